// src/pool.rs
//
// Multithreaded connection pool: allocation on accept, dispatch on
// readiness, reclamation on termination. The steady-state fast path
// touches no heap: slots come from the preallocated slab through the
// lock-free free stack.
use crate::error::{RavelError, RavelResult};
use crate::metrics::{PoolStats, StatsSnapshot};
use crate::session::{PacketSink, Session, SessionManager};
use crate::slab::{FreeStack, Slab, Slot};
use crate::syscalls;
use crate::timer::Reaper;
use crate::waiter::{EventSink, Waiter};
use libc::c_int;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use tracing::{debug, trace, warn};

/// Interest set armed for every connection descriptor. One-shot: the
/// watch disarms after a single firing until the sink rearms it.
const CONN_INTEREST: u32 = (libc::EPOLLIN
    | libc::EPOLLET
    | libc::EPOLLHUP
    | libc::EPOLLRDHUP
    | libc::EPOLLPRI
    | libc::EPOLLONESHOT) as u32;

/// Shared state of one pool run. Built on `run`, dropped on `stop`.
struct PoolCore<P: PacketSink> {
    slab: Slab<P::State>,
    stack: FreeStack,
    waiter: Waiter,
    reaper: Reaper,
    sink: Arc<P>,
    stats: Arc<PoolStats>,
}

impl<P: PacketSink> PoolCore<P> {
    /// Binds an accepted descriptor to a free slot and arms its watch.
    /// Closes the descriptor and returns `None` when the pool is
    /// exhausted or registration fails.
    fn add_client(&self, fd: c_int) -> Option<u32> {
        let Some(idx) = self.stack.pop(&self.slab) else {
            trace!(fd, "pool exhausted, rejecting connection");
            self.stats.inc_rejected();
            syscalls::close(fd);
            return None;
        };

        let slot = self.slab.slot(idx as usize);
        slot.bind_fd(fd);
        // The slot was free, so this thread holds it exclusively.
        unsafe {
            *slot.state_mut() = P::State::default();
        }
        self.stats.inc_accepted();

        let mut session = Session::new(slot, self);
        self.sink.accepted(&mut session);

        if let Err(e) = self.waiter.add(idx as u64, fd, CONN_INTEREST) {
            warn!(fd, error = %e, "failed to arm connection watch");
            self.terminate_slot(slot);
            return None;
        }

        self.reaper.set(idx);
        Some(idx)
    }

    /// Reclaims a slot without invoking any hook.
    fn terminate_slot(&self, slot: &Slot<P::State>) {
        let Some(fd) = self.claim(slot) else { return };
        let _ = self.waiter.remove(fd);
        syscalls::close(fd);
        self.stack.push(&self.slab, slot.id());
    }

    /// Reclaims a slot, firing `closed` before the slot is reused.
    fn terminate_on_close(&self, slot: &Slot<P::State>) {
        let Some(fd) = self.claim(slot) else { return };
        let _ = self.waiter.remove(fd);
        syscalls::close(fd);
        self.stats.inc_closed();

        let mut session = Session::new(slot, self);
        self.sink.closed(&mut session);

        self.stack.push(&self.slab, slot.id());
    }

    /// Reclaims a slot, firing `error` before the slot is reused.
    fn terminate_on_error(&self, slot: &Slot<P::State>) {
        let Some(fd) = self.claim(slot) else { return };
        let _ = self.waiter.remove(fd);
        syscalls::close(fd);
        self.stats.inc_errored();

        let mut session = Session::new(slot, self);
        self.sink.error(&mut session);

        self.stack.push(&self.slab, slot.id());
    }

    /// Claims the descriptor for termination; `None` when another caller
    /// already did (terminate is idempotent).
    fn claim(&self, slot: &Slot<P::State>) -> Option<c_int> {
        let fd = slot.take_fd();
        if fd == 0 {
            return None;
        }
        self.reaper.unset(slot.id());
        self.stats.dec_active();
        Some(fd)
    }

    /// EPOLLIN: drain reads to WouldBlock, forwarding each chunk.
    fn read_ready(&self, slot: &Slot<P::State>) {
        let fd = slot.fd();
        if fd == 0 {
            return;
        }

        loop {
            let buf = unsafe { slot.recv_buf() };
            match syscalls::read(fd, buf) {
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.terminate_on_error(slot);
                    break;
                }
                Ok(0) => {
                    self.terminate_on_close(slot);
                    break;
                }
                Ok(n) => {
                    self.stats.add_bytes_received(n as u64);
                    let data = &buf[..n];
                    let mut session = Session::new(slot, self);
                    self.sink.data_received(&mut session, data);
                    if slot.fd() == 0 {
                        // The sink terminated the connection mid-drain.
                        break;
                    }
                }
            }
        }
    }

    /// EPOLLPRI: drain single urgent bytes to WouldBlock.
    fn oob_ready(&self, slot: &Slot<P::State>) {
        let fd = slot.fd();
        if fd == 0 {
            return;
        }

        loop {
            match syscalls::read_oob(fd) {
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.terminate_on_error(slot);
                    break;
                }
                Ok(None) => break,
                Ok(Some(byte)) => {
                    let mut session = Session::new(slot, self);
                    self.sink.oob_received(&mut session, byte);
                    if slot.fd() == 0 {
                        break;
                    }
                }
            }
        }
    }
}

impl<P: PacketSink> EventSink for PoolCore<P> {
    fn trigger(&self, token: u64, events: u32) {
        let idx = token as usize;
        if idx >= self.slab.capacity() {
            return;
        }
        let slot = self.slab.slot(idx);

        if events & libc::EPOLLERR as u32 != 0 {
            self.terminate_on_error(slot);
            return;
        }

        if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
            self.terminate_on_close(slot);
            return;
        }

        if events & libc::EPOLLPRI as u32 != 0 {
            self.reaper.set(slot.id());
            self.oob_ready(slot);
        }

        if events & libc::EPOLLIN as u32 != 0 {
            self.reaper.set(slot.id());
            self.read_ready(slot);
        }
    }
}

impl<P: PacketSink> SessionManager<P::State> for PoolCore<P> {
    fn rearm(&self, slot: &Slot<P::State>) {
        let fd = slot.fd();
        if fd == 0 {
            return;
        }
        if let Err(e) = self.waiter.rearm(slot.id() as u64, fd, CONN_INTEREST) {
            warn!(fd, error = %e, "failed to rearm connection watch");
        }
    }

    fn terminate(&self, slot: &Slot<P::State>) {
        self.terminate_slot(slot);
    }
}

struct RunningPool<P: PacketSink> {
    core: Arc<PoolCore<P>>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// Owns the slab, free stack, waiter and reaper of the connection side,
/// and the worker threads dispatching readiness events.
pub struct ClientPool<P: PacketSink> {
    sink: Arc<P>,
    stats: Arc<PoolStats>,
    running: Mutex<Option<RunningPool<P>>>,
}

impl<P: PacketSink> ClientPool<P> {
    pub fn new(sink: P) -> Self {
        Self {
            sink: Arc::new(sink),
            stats: Arc::new(PoolStats::default()),
            running: Mutex::new(None),
        }
    }

    /// Starts the pool: allocates the slab, chains the free stack,
    /// optionally starts the reaper, and spawns `workers` dispatch
    /// threads. Returns `Ok(false)` when already running.
    pub fn run(
        &self,
        workers: usize,
        capacity: usize,
        timeout_ms: u64,
        pin_workers: bool,
    ) -> RavelResult<bool> {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return Ok(false);
        }

        let slab = Slab::new(capacity);
        let stack = FreeStack::new();
        stack.init(&slab);

        let core = Arc::new(PoolCore {
            slab,
            stack,
            waiter: Waiter::new()?,
            reaper: Reaper::new(),
            sink: self.sink.clone(),
            stats: self.stats.clone(),
        });

        if timeout_ms > 0 {
            let weak: Weak<PoolCore<P>> = Arc::downgrade(&core);
            core.reaper.run(timeout_ms, move |expired| {
                let Some(core) = weak.upgrade() else { return };
                for &idx in expired {
                    let slot = core.slab.slot(idx as usize);
                    if slot.fd() != 0 {
                        core.stats.inc_timed_out();
                    }
                    core.terminate_on_close(slot);
                }
            });
        }

        let core_ids = if pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let worker_count = workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let worker_core = Arc::clone(&core);
            let pin_to = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);

            core.waiter.enlist();
            let spawned = thread::Builder::new()
                .name(format!("ravel-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = pin_to {
                        core_affinity::set_for_current(id);
                    }
                    debug!(worker = i, "entering dispatch loop");
                    worker_core.waiter.wait(&*worker_core);
                    debug!(worker = i, "dispatch loop exited");
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    core.reaper.stop();
                    core.waiter.close();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(RavelError::Setup("spawn worker thread", e));
                }
            }
        }

        debug!(
            workers = worker_count,
            capacity = core.slab.capacity(),
            timeout_ms,
            "connection pool started"
        );
        *running = Some(RunningPool { core, workers: handles });
        Ok(true)
    }

    /// Hands an accepted descriptor to the running pool. Closes it when
    /// the pool is stopped or full.
    pub fn add_client(&self, fd: c_int) -> Option<u32> {
        let core = {
            let running = self.running.lock().unwrap();
            running.as_ref().map(|run| Arc::clone(&run.core))
        };

        match core {
            Some(core) => core.add_client(fd),
            None => {
                syscalls::close(fd);
                None
            }
        }
    }

    /// Stops the reaper, daisy-chains the workers out, reclaims every
    /// live slot and releases the slab. Idempotent.
    pub fn stop(&self) {
        let mut running = self.running.lock().unwrap();
        let Some(run) = running.take() else { return };

        run.core.reaper.stop();
        run.core.waiter.close();
        for handle in run.workers {
            let _ = handle.join();
        }

        for idx in 0..run.core.slab.capacity() {
            run.core.terminate_slot(run.core.slab.slot(idx));
        }
        debug!("connection pool stopped");
        // The core (and with it the slab) is released here.
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<P: PacketSink> Drop for ClientPool<P> {
    fn drop(&mut self) {
        self.stop();
    }
}
