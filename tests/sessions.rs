//! Session integration tests.
//!
//! This module contains integration tests for whole sessions:
//! - Two netplay peers in lockstep over delay-based and rollback netcode
//! - Spectators reconstructing a broadcast match

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

// Session test modules
mod sessions {
    pub mod lockstep;
    pub mod spectator;
}
