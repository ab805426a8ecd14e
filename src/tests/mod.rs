mod config;
mod cosmos;
mod driver;
mod mock;
mod relayer;
mod resolver;

use core::time::Duration;
use std::sync::Arc;

use bon::Builder;

use crate::chain::{ChainSpec, DockerImage, GenesisAmounts};
use crate::config::{HarnessConfig, DEFAULT_RELAYER_IMAGE, DEFAULT_RELAYER_UID_GID};
use crate::container::{ImageCache, ImageSource};
use crate::driver::Harness;
use crate::mock::{MockContainerRuntime, MockProvisioner, MockRelayEngine, RelayFault};
use crate::relayer::{ProcessingStrategy, RelayerFactory, RelayerVariant};
use crate::report::MemoryReporter;
use crate::retry::RetryPolicy;

/// Event-driven processing without backfill.
pub(crate) const EVENTS: ProcessingStrategy = ProcessingStrategy::EventDriven { block_history: 0 };

pub(crate) type MockHarness =
    Harness<MockProvisioner, MockRelayEngine, MockContainerRuntime, MemoryReporter>;

/// Polls fast enough for mock chains producing a block every 50ms.
pub(crate) fn fast_config() -> HarnessConfig {
    HarnessConfig::builder()
        .retry(
            RetryPolicy::builder()
                .initial_delay(Duration::from_millis(20))
                .max_delay(Duration::from_millis(200))
                .max_attempts(40)
                .build(),
        )
        .ready_timeout(Duration::from_secs(10))
        .build()
}

pub(crate) fn dymension() -> ChainSpec {
    ChainSpec::builder()
        .name("dymension")
        .chain_id("dymension_100-1")
        .gas_adjustment(0.0)
        .genesis_amounts(GenesisAmounts {
            faucet: 1_000_000_000_000_000_000_000_000,
            validator: 500_000_000_000_000_000_000_000,
        })
        .build()
}

pub(crate) fn osmosis() -> ChainSpec {
    ChainSpec::builder()
        .name("osmosis")
        .version("v7.2.0")
        .chain_id("osmosis-1001")
        .build()
}

pub(crate) fn relayer_image() -> DockerImage {
    DockerImage::builder()
        .repository(DEFAULT_RELAYER_IMAGE)
        .version("local")
        .uid_gid(DEFAULT_RELAYER_UID_GID)
        .build()
}

pub(crate) fn local_image() -> ImageSource {
    ImageSource::Local(relayer_image())
}

pub(crate) fn all_variants() -> Vec<RelayerVariant> {
    let legacy = ProcessingStrategy::LegacyScan { block_history: 100 };
    vec![
        RelayerVariant::in_process(EVENTS),
        RelayerVariant::in_process(legacy),
        RelayerVariant::containerized(local_image(), EVENTS),
        RelayerVariant::containerized(local_image(), legacy),
    ]
}

/// A harness wired entirely to in-memory chains and relayers.
#[derive(Builder)]
pub(crate) struct MockSetup {
    #[builder(default)]
    provisioner: MockProvisioner,
    #[builder(default)]
    fault: RelayFault,
    /// Relayer containers die right after starting.
    #[builder(default)]
    crashing: bool,
    /// Stopping relayer containers fails.
    #[builder(default)]
    failing_stop: bool,
    /// Images the mock registry can serve, besides the local relayer image.
    #[builder(default)]
    registry: Vec<DockerImage>,
    #[builder(default = fast_config())]
    config: HarnessConfig,
}

impl MockSetup {
    pub(crate) fn harness(self) -> MockHarness {
        let engine = MockRelayEngine::new(self.provisioner.network().clone())
            .with_fault(self.fault)
            .with_tick(Duration::from_millis(20));

        let mut runtime =
            MockContainerRuntime::new(engine.clone()).with_local_image(relayer_image());
        for image in self.registry {
            runtime = runtime.with_registry_image(image);
        }
        if self.crashing {
            runtime = runtime.crashing_on_start();
        }
        if self.failing_stop {
            runtime = runtime.failing_stop();
        }

        let factory = RelayerFactory::new(engine, Arc::new(runtime), ImageCache::new());
        Harness::new(self.provisioner, factory, self.config, MemoryReporter::default())
    }
}
