//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: a scriptable host game and a flat byte-addressed memory
//! - `test_utils`: peers wired together through simulated links, and the
//!   loop that drives them
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::{connect, run_for, HostStub};
//! ```

// Each test binary uses a different subset of these helpers.
#[allow(dead_code)]
pub mod stubs;
#[allow(dead_code)]
pub mod test_utils;

// Re-export commonly used items for convenience.
#[allow(unused_imports)]
pub use stubs::{scripted_input, HostStub, VecMemory, GAME_MEMORY_SIZE};

#[allow(unused_imports)]
pub use test_utils::{
    connect, init_tracing, run_for, settled_end, FrameRecord, Link, Pair, Peer, MATCH_INDEX,
};
