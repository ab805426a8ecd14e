//! Conformance harness for IBC relayers.
//!
//! A run provisions two chains, builds a relayer in one of its execution
//! variants, links a transfer path and walks the handshake and packet
//! lifecycle while asserting the state both chains expose.

use std::sync::{Mutex, MutexGuard};

pub mod chain;
pub mod config;
pub mod container;
pub mod driver;
pub mod error;
pub mod logging;
pub mod mock;
pub mod relayer;
pub mod report;
pub mod retry;

#[cfg(test)]
mod tests;

pub use config::HarnessConfig;
pub use driver::{ConformanceOutcome, Harness};
pub use error::{HarnessError, Phase};

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
