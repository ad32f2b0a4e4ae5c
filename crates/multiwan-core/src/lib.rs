//! multiwan core - source-bound download engine
//!
//! Every task is pinned to one local source address, so parallel downloads
//! can be spread over several uplinks. The crate provides the bound HTTP
//! client, the resumable transfer engine, the task registry with its
//! per-interface admission check, and a FIFO queue on top of it.

mod config;
pub mod engine;
mod error;
mod queue;

pub use config::*;
pub use engine::*;
pub use error::*;
pub use queue::*;

pub use multiwan_types as types;
