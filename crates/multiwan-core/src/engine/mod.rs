//! Download engine
//!
//! - Source-bound HTTP sessions
//! - HEAD probing for size, filename and range support
//! - Streaming transfer with Range resume, pause, cancel and throttling
//! - Task registry and workers
//! - Source address verification against an IP echo service

mod manager;
mod probe;
mod progress;
mod rate_limiter;
mod session;
mod transfer;
mod verify;
mod worker;

pub use manager::*;
pub use probe::*;
pub use progress::*;
pub use rate_limiter::*;
pub use session::*;
pub use transfer::*;
pub use verify::*;
pub use worker::*;
