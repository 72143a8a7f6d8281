//! Download Engine - the heart of Podcatch
//!
//! This module implements a single-worker download engine with:
//! - Resumable transfers via HTTP byte ranges
//! - Exponential backoff with jitter, honoring `Retry-After`
//! - Size verification and atomic publication of finished files
//! - A debounced, crash-safe index of finished downloads

mod manager;
mod persistence;
mod publish;
mod retry;
mod state;
mod transfer;

pub use manager::*;
pub use persistence::*;
pub use publish::*;
pub use retry::*;
pub use state::*;
pub use transfer::*;
