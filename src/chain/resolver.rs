use tracing::{info, warn};

use crate::chain::{ChainConfig, ChainInstance, ChainProvisioner, ChainSpec};
use crate::error::{HarnessError, Result};

/// Two chains provisioned for one conformance run. `a` is the packet source.
pub struct ChainPair<C: ChainInstance> {
    pub a: C,
    pub b: C,
}

impl<C: ChainInstance> ChainPair<C> {
    pub fn is_running(&self) -> bool {
        self.a.is_running() || self.b.is_running()
    }

    /// Tears both chains down. Both are attempted even if the first fails;
    /// calling it again after success is a no-op.
    pub async fn teardown(&mut self) -> Result<()> {
        let a = teardown_chain(&mut self.a).await;
        let b = teardown_chain(&mut self.b).await;
        a.and(b)
    }
}

impl<C: ChainInstance> Drop for ChainPair<C> {
    fn drop(&mut self) {
        for chain in [&mut self.a, &mut self.b] {
            if chain.is_running() {
                warn!(chain = %chain.chain_id(), "chain dropped without teardown; releasing it");
                chain.abandon();
            }
        }
    }
}

async fn teardown_chain<C: ChainInstance>(chain: &mut C) -> Result<()> {
    if !chain.is_running() {
        return Ok(());
    }
    let chain_id = chain.chain_id().to_string();
    chain
        .teardown()
        .await
        .map_err(|e| HarnessError::provisioning(chain_id, e.context("teardown failed")))
}

/// Resolves both specs and provisions the chains concurrently.
///
/// If only one chain comes up it is torn down before the error is returned,
/// so a failed call never leaves anything running.
pub async fn resolve_chain_pair<P: ChainProvisioner>(
    provisioner: &P,
    specs: &[ChainSpec; 2],
    run_id: &str,
) -> Result<ChainPair<P::Chain>> {
    let [config_a, config_b] = resolve_configs(specs)?;

    info!(
        run_id,
        chain_a = %config_a.chain_id,
        chain_b = %config_b.chain_id,
        "provisioning chain pair"
    );

    let id_a = config_a.chain_id.clone();
    let id_b = config_b.chain_id.clone();

    let (a, b) = futures::join!(
        provisioner.provision(config_a, run_id),
        provisioner.provision(config_b, run_id),
    );

    match (a, b) {
        (Ok(a), Ok(b)) => Ok(ChainPair { a, b }),
        (Ok(mut a), Err(e)) => {
            release_after_failure(&mut a).await;
            Err(HarnessError::provisioning(id_b, e))
        }
        (Err(e), Ok(mut b)) => {
            release_after_failure(&mut b).await;
            Err(HarnessError::provisioning(id_a, e))
        }
        (Err(e), Err(other)) => {
            warn!(chain = %id_b, error = %other, "second chain also failed to provision");
            Err(HarnessError::provisioning(id_a, e))
        }
    }
}

fn resolve_configs(specs: &[ChainSpec; 2]) -> Result<[ChainConfig; 2]> {
    let resolve = |index: usize| {
        specs[index]
            .resolve(index)
            .map_err(|e| HarnessError::provisioning(specs[index].name.clone(), e))
    };

    let a = resolve(0)?;
    let b = resolve(1)?;

    if a.chain_id == b.chain_id {
        return Err(HarnessError::provisioning(
            b.chain_id.clone(),
            anyhow::anyhow!("both chains resolve to chain id {}", a.chain_id),
        ));
    }

    Ok([a, b])
}

async fn release_after_failure<C: ChainInstance>(chain: &mut C) {
    if let Err(e) = chain.teardown().await {
        warn!(chain = %chain.chain_id(), error = %e, "failed to release chain after provisioning error");
    }
}
