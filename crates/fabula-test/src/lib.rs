//! Fabula Test Harness - Scenario-driven protocol validation
//!
//! This crate provides:
//! - A scriptable scenario authority (held, reordered and rejected
//!   confirmations)
//! - Convergence checking against from-scratch truth replay
//! - End-to-end reconciliation scenarios

pub mod convergence;
pub mod integration;
pub mod scenario;

pub use convergence::*;
pub use integration::*;
pub use scenario::*;

/// Install a compact tracing subscriber honoring `RUST_LOG`, for scenario
/// debugging. Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
