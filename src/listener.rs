// src/listener.rs
//
// Listener pool: owns the listening sockets and a second waiter whose
// wait loop runs on the caller of `run`. Each readiness notification
// drains the accept queue into the connection pool.
use crate::error::{RavelError, RavelResult};
use crate::metrics::StatsSnapshot;
use crate::pool::ClientPool;
use crate::session::PacketSink;
use crate::syscalls;
use crate::waiter::{EventSink, Waiter};
use libc::c_int;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

/// Listener interest set. EPOLLEXCLUSIVE keeps an accept burst from
/// waking more than one waiter.
const LISTENER_INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLEXCLUSIVE) as u32;

/// Event handling for multiple listening sockets and their clients.
pub struct ServerPool<P: PacketSink> {
    // Listener id -> descriptor. Ids are assigned monotonically and
    // never reused within the process.
    listeners: Mutex<BTreeMap<u32, c_int>>,
    next_id: AtomicU32,
    waiter: Waiter,
    pool: ClientPool<P>,
    running: Mutex<bool>,
}

impl<P: PacketSink> ServerPool<P> {
    pub fn new(sink: P) -> RavelResult<Self> {
        Ok(Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            waiter: Waiter::new()?,
            pool: ClientPool::new(sink),
            running: Mutex::new(false),
        })
    }

    /// Creates a nonblocking TCP listener on `port` and registers it.
    /// Returns the assigned listener id.
    pub fn bind(&self, port: u16, backlog: c_int) -> RavelResult<u32> {
        let fd = syscalls::tcp_listener(port, backlog)?;
        match self.register(fd) {
            Ok(id) => {
                info!(port, listener = id, "listening");
                Ok(id)
            }
            Err(e) => {
                syscalls::close(fd);
                Err(e)
            }
        }
    }

    /// Adopts an externally created listening descriptor.
    pub fn add(&self, fd: c_int) -> RavelResult<u32> {
        let id = self.register(fd)?;
        info!(fd, listener = id, "adopted listener");
        Ok(id)
    }

    fn register(&self, fd: c_int) -> RavelResult<u32> {
        // An edge-triggered accept loop needs a nonblocking listener.
        syscalls::set_nonblocking(fd)?;

        let mut listeners = self.listeners.lock().unwrap();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiter
            .add(id as u64, fd, LISTENER_INTEREST)
            .map_err(RavelError::Io)?;
        listeners.insert(id, fd);
        Ok(id)
    }

    /// Starts the connection pool, then waits on the listener sockets
    /// from the calling thread until `stop`. Returns immediately when
    /// the pool is already running.
    pub fn run(
        &self,
        workers: usize,
        max_clients: usize,
        timeout_ms: u64,
        pin_workers: bool,
    ) -> RavelResult<()> {
        {
            let mut running = self.running.lock().unwrap();
            if !self.pool.run(workers, max_clients, timeout_ms, pin_workers)? {
                return Ok(());
            }
            *running = true;
            self.waiter.enlist();
        }

        self.waiter.wait(self);
        *self.running.lock().unwrap() = false;
        Ok(())
    }

    /// Shuts down the listener loop and the connection pool. Idempotent.
    pub fn stop(&self) {
        {
            let mut running = self.running.lock().unwrap();
            if *running {
                *running = false;
                self.waiter.close();
            }
        }
        self.pool.stop();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pool.stats()
    }
}

impl<P: PacketSink> EventSink for ServerPool<P> {
    fn trigger(&self, token: u64, events: u32) {
        let id = token as u32;

        // Precedence: error, then hangup, then readable.
        if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            let fd = self.listeners.lock().unwrap().remove(&id);
            if let Some(fd) = fd {
                warn!(listener = id, "listener failed, closing");
                let _ = self.waiter.remove(fd);
                syscalls::close(fd);
            }
            return;
        }

        if events & libc::EPOLLIN as u32 == 0 {
            return;
        }

        let fd = { self.listeners.lock().unwrap().get(&id).copied() };
        let Some(listen_fd) = fd else { return };

        // Drain the accept queue. Admission rejections are closed inside
        // the pool; nothing else to do here.
        loop {
            match syscalls::accept(listen_fd) {
                Ok(Some(client_fd)) => {
                    self.pool.add_client(client_fd);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(listener = id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

impl<P: PacketSink> Drop for ServerPool<P> {
    fn drop(&mut self) {
        self.stop();
        let mut listeners = self.listeners.lock().unwrap();
        for (_, fd) in std::mem::take(&mut *listeners) {
            syscalls::close(fd);
        }
    }
}
