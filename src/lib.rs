//! Multi-reactor TCP server framework built around an edge-triggered,
//! one-shot readiness loop. Connection slots come from a preallocated,
//! page-rounded slab recycled through a lock-free free stack, so the
//! steady-state fast path performs no heap allocation. Linux only.

pub mod error;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod session;
pub mod slab;
pub mod syscalls;
pub mod timer;
pub mod waiter;

// Re-exports for users
pub use error::{RavelError, RavelResult};
pub use listener::ServerPool;
pub use logging::init_logging;
pub use metrics::StatsSnapshot;
pub use pool::ClientPool;
pub use server::Server;
pub use session::{PacketSink, Session, SessionManager};
