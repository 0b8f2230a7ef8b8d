pub mod graceful_shutdown;
pub mod session_tracker;

pub use graceful_shutdown::{GracefulShutdown, ShutdownReason, ShutdownToken};
pub use session_tracker::{SessionGuard, SessionTracker};
