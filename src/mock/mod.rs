//! In-memory chains, relay engine and container runtime.
//!
//! Everything here runs inside the test process, so the full conformance
//! sequence can be exercised deterministically without docker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::chain::ChainInstance;
pub(crate) use crate::lock;

pub mod chain;
pub mod relay;
pub mod runtime;

pub use chain::{BlockEvents, ChainEvent, IbcMsg, MockChain, MockProvisioner, Packet};
pub use relay::{MockRelayEngine, RelayFault};
pub use runtime::MockContainerRuntime;

/// The set of mock chains that can see each other, keyed by chain id.
///
/// Chains look their counterparty up here to check handshake and packet
/// proofs.
#[derive(Clone, Default)]
pub struct MockNetwork {
    chains: Arc<Mutex<HashMap<String, MockChain>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, chain: MockChain) -> anyhow::Result<()> {
        let mut chains = lock(&self.chains);
        let chain_id = chain.config().chain_id.clone();
        anyhow::ensure!(
            !chains.contains_key(&chain_id),
            "chain {chain_id} is already running"
        );
        chains.insert(chain_id, chain);
        Ok(())
    }

    pub(crate) fn remove(&self, chain_id: &str) {
        lock(&self.chains).remove(chain_id);
    }

    pub fn chain(&self, chain_id: &str) -> anyhow::Result<MockChain> {
        lock(&self.chains)
            .get(chain_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("chain {chain_id} is not running"))
    }

    /// Ids of every chain that has not been torn down, sorted.
    pub fn running_chains(&self) -> Vec<String> {
        let mut ids: Vec<_> = lock(&self.chains).keys().cloned().collect();
        ids.sort();
        ids
    }
}
