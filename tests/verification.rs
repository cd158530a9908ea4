//! Verification integration tests.
//!
//! - Property tests: invariants of the timeline, the reliable channel, the
//!   chaos link and the snapshot store under random inputs

#[path = "common/mod.rs"]
mod common;

mod verification {
    pub mod property;
}
