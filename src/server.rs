// src/server.rs
use crate::error::RavelResult;
use crate::listener::ServerPool;
use crate::metrics::StatsSnapshot;
use crate::session::PacketSink;
use libc::c_int;

const DEFAULT_BACKLOG: c_int = 1000;
const DEFAULT_MAX_CLIENTS: usize = 100_000;

/// Facade over the listener pool and the connection pool.
///
/// ```no_run
/// use ravel::{PacketSink, Server, Session};
///
/// struct Echo;
///
/// impl PacketSink for Echo {
///     type State = ();
///
///     fn data_received(&self, session: &mut Session<'_, ()>, data: &[u8]) {
///         let _ = session.write(data);
///         session.rearm();
///     }
/// }
///
/// let server = Server::new(Echo).unwrap().workers(4).timeout_ms(30_000);
/// server.bind(9000).unwrap();
/// server.run().unwrap(); // blocks until server.stop()
/// ```
pub struct Server<P: PacketSink> {
    pool: ServerPool<P>,
    workers: usize,
    max_clients: usize,
    timeout_ms: u64,
    pin_workers: bool,
}

impl<P: PacketSink> Server<P> {
    pub fn new(sink: P) -> RavelResult<Self> {
        Ok(Self {
            pool: ServerPool::new(sink)?,
            workers: num_cpus::get(),
            max_clients: DEFAULT_MAX_CLIENTS,
            timeout_ms: 0,
            pin_workers: false,
        })
    }

    /// Number of dispatch worker threads. Defaults to all cores.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Connection slot capacity. The actual capacity is rounded up to
    /// fill whole memory pages.
    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Idle timeout in milliseconds; 0 disables the reaper. Idleness is
    /// measured from the last readable or urgent dispatch; writes and
    /// accepts do not refresh the timer.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Pin worker threads round-robin onto available cores.
    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    /// Binds a listener on `port` with the default backlog.
    pub fn bind(&self, port: u16) -> RavelResult<u32> {
        self.pool.bind(port, DEFAULT_BACKLOG)
    }

    pub fn bind_with_backlog(&self, port: u16, backlog: c_int) -> RavelResult<u32> {
        self.pool.bind(port, backlog)
    }

    /// Adopts an externally created listening descriptor. The server
    /// takes ownership and closes it on drop.
    pub fn add(&self, fd: c_int) -> RavelResult<u32> {
        self.pool.add(fd)
    }

    /// Runs the accept loop on the calling thread until [`Server::stop`].
    pub fn run(&self) -> RavelResult<()> {
        self.pool
            .run(self.workers, self.max_clients, self.timeout_ms, self.pin_workers)
    }

    /// Tears the server down: exits the accept loop, stops the reaper,
    /// joins the workers, reclaims every connection. Idempotent; a
    /// subsequent `run` starts cleanly.
    pub fn stop(&self) {
        self.pool.stop();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.pool.stats()
    }
}
