//! Helix Tests - Deterministic Simulation Testing for the Helix sink.
//!
//! This crate contains the DST (Deterministic Simulation Testing) and
//! integration tests for the sink. Tests are organized by component and type:
//!
//! ## Test Organization
//!
//! **DST Tests** (`*_dst.rs`): Deterministic simulation with fault injection
//! - `sink_dst`: End-to-end sink DST with crashes and redelivery
//! - `recovery_dst`: Recovery idempotence after random crashes
//!
//! **Integration Tests** (`*_tests.rs`): Multi-component integration
//! - `sink_tests`: Failure, retry and restart scenarios across writer and commit log
//!
//! **Support Modules**:
//! - `properties`: Property definitions (`ExactlyOnceChecker`, etc.)
//! - `scenarios`: Reusable configurations, fault patterns and seeds
//! - `upstream`: Seeded, rewindable record source
//!
//! ## Naming Conventions
//!
//! - DST tests: `test_dst_<component>_<scenario>`
//! - Integration tests: `test_<component>_<scenario>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod properties;
pub mod scenarios;
pub mod upstream;

// DST test modules (deterministic simulation with fault injection).
#[cfg(test)]
mod recovery_dst;
#[cfg(test)]
mod sink_dst;


/// Installs a test log subscriber honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
