// src/waiter.rs
//
// Edge-triggered, one-shot readiness engine shared by multiple worker
// threads, with an in-band shutdown channel.
use crate::error::{RavelError, RavelResult};
use crate::syscalls;
use libc::c_int;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Reserved token for the shutdown channel's read side.
pub const CTRL_TOKEN: u64 = u64::MAX;

/// Events drained per epoll_wait call.
const MAX_EVENTS: usize = 1024;

/// Downstream receiver of readiness notifications.
pub trait EventSink {
    fn trigger(&self, token: u64, events: u32);
}

/// Wraps an epoll instance and a socketpair self-pipe.
///
/// Shutdown is daisy-chained: `close()` re-arms the one-shot watch on the
/// pipe's read side and writes a single byte, waking exactly one waiting
/// worker. That worker decrements the enlisted-worker count and, while
/// the post-decrement value is still positive, re-invokes `close()` so
/// the next worker follows suit. The signal byte and the rearmed watch
/// persist until a worker arrives, so late starters are not lost.
pub struct Waiter {
    epfd: c_int,
    // [0] is the signal (write) side, [1] the registered read side.
    ctrl: [c_int; 2],
    workers: AtomicUsize,
}

impl Waiter {
    pub fn new() -> RavelResult<Self> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(RavelError::Setup(
                "create epoll instance",
                io::Error::last_os_error(),
            ));
        }

        let ctrl = match syscalls::socketpair_stream() {
            Ok(fds) => fds,
            Err(e) => {
                syscalls::close(epfd);
                return Err(RavelError::Setup("create shutdown channel", e));
            }
        };

        let waiter = Self {
            epfd,
            ctrl,
            workers: AtomicUsize::new(0),
        };

        let interest = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        if let Err(e) = waiter.ctl(libc::EPOLL_CTL_ADD, waiter.ctrl[1], interest, CTRL_TOKEN) {
            return Err(RavelError::Setup("register shutdown channel", e));
        }

        Ok(waiter)
    }

    fn ctl(&self, op: c_int, fd: c_int, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Registers a new descriptor under `token`.
    pub fn add(&self, token: u64, fd: c_int, interest: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token)
    }

    /// Re-arms an existing registration after a one-shot firing.
    pub fn rearm(&self, token: u64, fd: c_int, interest: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, token)
    }

    /// Deregisters a descriptor.
    pub fn remove(&self, fd: c_int) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Accounts for one forthcoming `wait` call in the shutdown chain.
    /// Must be invoked (by the launching thread) once per worker that
    /// will enter `wait`.
    pub fn enlist(&self) {
        self.workers.fetch_add(1, Ordering::AcqRel);
    }

    /// Enters the dispatch loop. Returns after a shutdown signal or a
    /// fatal epoll failure.
    pub fn wait<S: EventSink>(&self, sink: &S) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        'run: loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as c_int, -1)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                warn!(error = %err, "epoll_wait failed, worker exiting");
                self.workers.fetch_sub(1, Ordering::AcqRel);
                break;
            }

            for i in 0..n as usize {
                let event = events[i];
                let token = event.u64;

                if token == CTRL_TOKEN {
                    let mut byte = [0u8; 1];
                    let _ = syscalls::read(self.ctrl[1], &mut byte);

                    // Pass the shutdown baton to the next worker before
                    // leaving, until the chain reaches the last one.
                    if self.workers.fetch_sub(1, Ordering::AcqRel) > 1 {
                        self.close();
                    }
                    break 'run;
                }

                sink.trigger(token, event.events);
            }
        }
    }

    /// Initiates the daisy-chained shutdown: guarantees exactly one
    /// additional wakeup.
    pub fn close(&self) {
        let interest = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        if let Err(e) = self.ctl(libc::EPOLL_CTL_MOD, self.ctrl[1], interest, CTRL_TOKEN) {
            warn!(error = %e, "failed to rearm shutdown channel");
        }
        let _ = syscalls::write(self.ctrl[0], &[0u8]);
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        syscalls::close(self.epfd);
        syscalls::close(self.ctrl[0]);
        syscalls::close(self.ctrl[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct NullSink;

    impl EventSink for NullSink {
        fn trigger(&self, _token: u64, _events: u32) {}
    }

    #[test]
    fn add_rearm_remove_roundtrip() {
        let waiter = Waiter::new().unwrap();
        let pair = syscalls::socketpair_stream().unwrap();

        let interest = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        waiter.add(7, pair[0], interest).unwrap();
        waiter.rearm(7, pair[0], interest).unwrap();
        waiter.remove(pair[0]).unwrap();
        // Removing twice is an OS error surfaced to the caller.
        assert!(waiter.remove(pair[0]).is_err());

        syscalls::close(pair[0]);
        syscalls::close(pair[1]);
    }

    #[test]
    fn shutdown_daisy_chain_wakes_every_worker() {
        let waiter = Arc::new(Waiter::new().unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            waiter.enlist();
            let waiter = waiter.clone();
            handles.push(thread::spawn(move || waiter.wait(&NullSink)));
        }

        thread::sleep(Duration::from_millis(20));
        waiter.close();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(waiter.workers.load(Ordering::Acquire), 0);
    }

    #[test]
    fn shutdown_reaches_a_late_worker() {
        let waiter = Arc::new(Waiter::new().unwrap());

        // Enlisted before spawn: the signal must persist until the
        // worker actually enters the wait loop.
        waiter.enlist();
        waiter.close();

        let late = {
            let waiter = waiter.clone();
            thread::spawn(move || waiter.wait(&NullSink))
        };
        late.join().unwrap();
        assert_eq!(waiter.workers.load(Ordering::Acquire), 0);
    }

    #[test]
    fn dispatches_readiness_to_sink() {
        use std::sync::mpsc;

        struct ChannelSink(std::sync::Mutex<mpsc::Sender<(u64, u32)>>);

        impl EventSink for ChannelSink {
            fn trigger(&self, token: u64, events: u32) {
                let _ = self.0.lock().unwrap().send((token, events));
            }
        }

        let waiter = Arc::new(Waiter::new().unwrap());
        let pair = syscalls::socketpair_stream().unwrap();
        let interest = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        waiter.add(42, pair[1], interest).unwrap();

        let (tx, rx) = mpsc::channel();
        waiter.enlist();
        let worker = {
            let waiter = waiter.clone();
            thread::spawn(move || waiter.wait(&ChannelSink(std::sync::Mutex::new(tx))))
        };

        syscalls::write(pair[0], b"x").unwrap();
        let (token, events) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(token, 42);
        assert_ne!(events & libc::EPOLLIN as u32, 0);

        waiter.close();
        worker.join().unwrap();
        syscalls::close(pair[0]);
        syscalls::close(pair[1]);
    }
}
