// src/session.rs
//
// Event trampoline between the connection pool and user code: the
// capability-probed `PacketSink` hooks and the lightweight `Session`
// view they receive.
use crate::slab::Slot;
use crate::syscalls;
use std::io;

/// Downstream sink for connection events.
///
/// Implement only the hooks you care about; the default bodies are empty
/// and compile away, so an uninstalled callback costs nothing. Hooks run
/// on pool worker threads. After a `data_received` or `oob_received`
/// dispatch the sink must call [`Session::rearm`] for the connection to
/// keep receiving, or [`Session::terminate`] to drop it.
pub trait PacketSink: Send + Sync + 'static {
    /// Per-connection user state, rebuilt via `Default` on every accept.
    type State: Default + Send + 'static;

    fn accepted(&self, _session: &mut Session<'_, Self::State>) {}

    fn data_received(&self, _session: &mut Session<'_, Self::State>, _data: &[u8]) {}

    fn oob_received(&self, _session: &mut Session<'_, Self::State>, _byte: u8) {}

    fn closed(&self, _session: &mut Session<'_, Self::State>) {}

    fn error(&self, _session: &mut Session<'_, Self::State>) {}
}

/// Session-related pool operations exposed to the session view.
pub trait SessionManager<S>: Sync {
    /// Re-registers the one-shot read watch.
    fn rearm(&self, slot: &Slot<S>);

    /// Closes the connection and returns its slot to the free stack.
    fn terminate(&self, slot: &Slot<S>);
}

/// Borrowed handle to one connection, valid for the duration of a hook
/// invocation. Never owns the connection.
pub struct Session<'a, S> {
    slot: &'a Slot<S>,
    manager: &'a dyn SessionManager<S>,
}

impl<'a, S> Session<'a, S> {
    pub(crate) fn new(slot: &'a Slot<S>, manager: &'a dyn SessionManager<S>) -> Self {
        Self { slot, manager }
    }

    /// Stable identifier of the underlying slot.
    pub fn id(&self) -> u32 {
        self.slot.id()
    }

    /// Writes to the connection, retrying short writes until the socket
    /// buffer fills. Returns the number of bytes delivered; callers that
    /// need full delivery must loop.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.slot.fd();
        if fd == 0 {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }

        let mut written = 0;
        while written < buf.len() {
            match syscalls::write(fd, &buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    if written == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(written)
    }

    /// Per-connection user state.
    pub fn state(&mut self) -> &mut S {
        // One-shot registration serializes dispatch per connection, so
        // the hook holds exclusive access for its duration.
        unsafe { self.slot.state_mut() }
    }

    /// Reactivates the connection for its next readiness event.
    pub fn rearm(&self) {
        self.manager.rearm(self.slot);
    }

    /// Closes the connection and reclaims its slot.
    pub fn terminate(&self) {
        self.manager.terminate(self.slot);
    }
}
