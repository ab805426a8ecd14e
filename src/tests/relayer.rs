use core::time::Duration;
use std::path::PathBuf;
use std::sync::Arc;

use rstest::rstest;
use testresult::TestResult;

use crate::chain::{resolve_chain_pair, ChainInstance, DockerImage};
use crate::container::{ImageCache, ImageSource};
use crate::error::{ConstructionError, HarnessError, Phase};
use crate::logging::install_logger;
use crate::mock::{MockContainerRuntime, MockProvisioner, MockRelayEngine, RelayFault};
use crate::relayer::container::{chain_config_json, parse_linked_path, RlyCommands};
use crate::relayer::{ProcessingStrategy, RelayerFactory, RelayerHandle, RelayerVariant};
use crate::report::ReportEvent;
use crate::tests::{dymension, local_image, osmosis, MockSetup, EVENTS};

#[rstest]
#[case(ProcessingStrategy::EventDriven { block_history: 0 }, &["--processor", "events", "--block-history", "0"])]
#[case(ProcessingStrategy::EventDriven { block_history: 100 }, &["--processor", "events", "--block-history", "100"])]
#[case(ProcessingStrategy::LegacyScan { block_history: 100 }, &["--processor", "legacy", "--block-history", "100"])]
#[case(ProcessingStrategy::LegacyScan { block_history: 0 }, &["--processor", "legacy", "--block-history", "0"])]
fn strategy_maps_to_startup_flags(
    #[case] strategy: ProcessingStrategy,
    #[case] flags: &[&str],
) -> TestResult {
    assert_eq!(strategy.startup_flags(), flags);
    assert_eq!(ProcessingStrategy::from_flags(flags)?, strategy);
    Ok(())
}

#[test]
fn missing_flags_mean_event_driven() -> TestResult {
    let none: &[&str] = &[];
    assert_eq!(ProcessingStrategy::from_flags(none)?, EVENTS);
    assert_eq!(
        ProcessingStrategy::from_flags(&["--processor", "events"])?,
        EVENTS
    );
    assert_eq!(
        ProcessingStrategy::from_flags(&["--processor", "legacy"])?,
        ProcessingStrategy::LegacyScan { block_history: 0 }
    );
    Ok(())
}

#[test]
fn unknown_processor_is_rejected() {
    assert!(ProcessingStrategy::from_flags(&["--processor", "polling"]).is_err());
    assert!(
        ProcessingStrategy::from_flags(&["--processor", "legacy", "--block-history", "many"])
            .is_err()
    );
}

#[test]
fn variant_names_execution_and_strategy() {
    let legacy = RelayerVariant::containerized(
        local_image(),
        ProcessingStrategy::LegacyScan { block_history: 100 },
    );
    assert_eq!(legacy.to_string(), "containerized/legacy(history=100)");
    assert_eq!(
        RelayerVariant::in_process(EVENTS).to_string(),
        "in-process/events"
    );
}

#[tokio::test]
async fn rly_commands_cover_setup_and_start() -> TestResult {
    install_logger();
    let provisioner = MockProvisioner::default();
    let mut chains = resolve_chain_pair(&provisioner, &[dymension(), osmosis()], "rly").await?;

    let commands = RlyCommands {
        path: "dymension_100-1-osmosis-1001".into(),
        a: chains.a.endpoint(),
        b: chains.b.endpoint(),
    };
    let setup = commands.setup();
    chains.teardown().await?;

    let subcommands: Vec<String> = setup
        .iter()
        .map(|command| command[1..3].join(" "))
        .collect();
    assert_eq!(
        subcommands,
        [
            "config init",
            "chains add",
            "chains add",
            "keys restore",
            "keys restore",
            "paths new",
            "tx link",
        ]
    );
    for command in &setup {
        assert_eq!(command[0], "rly");
        assert!(command.ends_with(&["--home".to_string(), "/home/relayer".to_string()]));
    }

    let start = commands.start(ProcessingStrategy::LegacyScan { block_history: 100 });
    assert!(start.ends_with(&[
        "--processor".to_string(),
        "legacy".to_string(),
        "--block-history".to_string(),
        "100".to_string(),
    ]));

    let json = chain_config_json(&commands.a);
    assert_eq!(json["type"], "cosmos");
    assert_eq!(json["value"]["chain-id"], "dymension_100-1");
    assert_eq!(json["value"]["account-prefix"], "dym");
    assert_eq!(json["value"]["gas-prices"], "0udym");
    assert_eq!(json["value"]["trusting-period"], "168h0m0s");
    Ok(())
}

const PATH_SHOW: &str = r#"{
  "path": {
    "src": {"chain-id": "dymension_100-1", "client-id": "07-tendermint-0", "connection-id": "connection-0"},
    "dst": {"chain-id": "osmosis-1001", "client-id": "07-tendermint-0", "connection-id": "connection-0"}
  },
  "status": {"chains": true, "clients": true, "connection": true, "channels": true}
}"#;

#[test]
fn linked_path_uses_latest_open_transfer_channel() -> TestResult {
    let channels = [
        r#"{"state":"STATE_CLOSED","ordering":"ORDER_UNORDERED","counterparty":{"port_id":"transfer","channel_id":"channel-0"},"connection_hops":["connection-0"],"version":"ics20-1","port_id":"transfer","channel_id":"channel-0"}"#,
        r#"{"state":"STATE_OPEN","ordering":"ORDER_UNORDERED","counterparty":{"port_id":"transfer","channel_id":"channel-1"},"connection_hops":["connection-0"],"version":"ics20-1","port_id":"transfer","channel_id":"channel-1"}"#,
        r#"{"state":"STATE_OPEN","ordering":"ORDER_ORDERED","counterparty":{"port_id":"icahost","channel_id":"channel-2"},"connection_hops":["connection-0"],"version":"ics27-1","port_id":"icacontroller","channel_id":"channel-2"}"#,
    ]
    .join("\n");

    let path = parse_linked_path("demo", PATH_SHOW, &channels)?;

    assert_eq!(path.name, "demo");
    assert_eq!(path.a.chain_id, "dymension_100-1");
    assert_eq!(path.a.channel_id, "channel-1");
    assert_eq!(path.b.chain_id, "osmosis-1001");
    assert_eq!(path.b.port_id, "transfer");
    assert_eq!(path.b.channel_id, "channel-1");
    Ok(())
}

#[test]
fn linked_path_needs_an_open_channel() {
    let channels = r#"{"state":"STATE_INIT","counterparty":{"port_id":"transfer","channel_id":""},"connection_hops":["connection-0"],"port_id":"transfer","channel_id":"channel-0"}"#;
    assert!(parse_linked_path("demo", PATH_SHOW, channels).is_err());
    assert!(parse_linked_path("demo", "not json", "").is_err());
}

#[tokio::test]
async fn missing_local_image_is_never_pulled() -> TestResult {
    install_logger();
    let harness = MockSetup::builder().build().harness();
    let absent = DockerImage::builder().repository("relayer").version("absent").build();
    let variant = RelayerVariant::containerized(
        ImageSource::Local(absent),
        EVENTS,
    );

    let result = harness.run(&[dymension(), osmosis()], &variant).await;

    assert!(matches!(
        result,
        Err(HarnessError::Construction(ConstructionError::ImageUnavailable { .. }))
    ));
    assert_eq!(harness.factory().runtime().pulls(), 0);
    assert!(harness.provisioner().network().running_chains().is_empty());
    Ok(())
}

#[tokio::test]
async fn unpullable_image_fails_construction() -> TestResult {
    install_logger();
    let harness = MockSetup::builder().build().harness();
    let unknown = DockerImage::builder().repository("relayer").version("v9.9.9").build();
    let variant =
        RelayerVariant::containerized(ImageSource::Pull(unknown), EVENTS);

    let error = harness
        .run(&[dymension(), osmosis()], &variant)
        .await
        .expect_err("construction should fail");

    assert!(matches!(
        error,
        HarnessError::Construction(ConstructionError::ImageUnavailable { .. })
    ));
    assert_eq!(harness.factory().runtime().pulls(), 1);
    assert!(harness.provisioner().network().running_chains().is_empty());
    assert_eq!(harness.factory().runtime().live_containers(), 0);
    Ok(())
}

#[tokio::test]
async fn pulled_image_is_reused_across_runs() -> TestResult {
    install_logger();
    let image = DockerImage::builder().repository("relayer").version("v2.5.0").build();
    let harness = MockSetup::builder()
        .registry(vec![image.clone()])
        .build()
        .harness();
    let variant =
        RelayerVariant::containerized(ImageSource::Pull(image), EVENTS);

    harness.run(&[dymension(), osmosis()], &variant).await?;
    harness.run(&[dymension(), osmosis()], &variant).await?;

    assert_eq!(harness.factory().runtime().pulls(), 1);
    Ok(())
}

#[tokio::test]
async fn image_is_built_once_under_concurrency() -> TestResult {
    install_logger();
    let runtime = MockContainerRuntime::new(MockRelayEngine::new(Default::default()));
    let cache = ImageCache::new();
    let source = ImageSource::Build {
        image: DockerImage::builder().repository("relayer").version("dev").build(),
        context: PathBuf::from("."),
        dockerfile: None,
    };

    let (a, b, c, d) = futures::join!(
        cache.ensure(&runtime, &source),
        cache.ensure(&runtime, &source),
        cache.ensure(&runtime, &source),
        cache.ensure(&runtime, &source),
    );
    for image in [a?, b?, c?, d?] {
        assert_eq!(&image, source.image());
    }

    assert_eq!(runtime.builds(), 1);
    Ok(())
}

#[rstest]
#[case::in_process(RelayerVariant::in_process(EVENTS))]
#[case::containerized(RelayerVariant::containerized(local_image(), EVENTS))]
#[tokio::test]
async fn stop_is_idempotent(#[case] variant: RelayerVariant) -> TestResult {
    install_logger();
    let provisioner = MockProvisioner::default();
    let engine = MockRelayEngine::new(provisioner.network().clone());
    let runtime = Arc::new(
        MockContainerRuntime::new(engine.clone()).with_local_image(crate::tests::relayer_image()),
    );
    let factory = RelayerFactory::new(engine, runtime.clone(), ImageCache::new());
    let mut chains = resolve_chain_pair(&provisioner, &[dymension(), osmosis()], "stop").await?;

    let mut never_started = factory.build(&variant, &chains, "stop-unstarted").await?;
    never_started.stop().await?;
    never_started.stop().await?;

    let mut relayer = factory.build(&variant, &chains, "stop").await?;
    relayer.start().await?;
    let path = relayer.await_ready(Duration::from_secs(10)).await?;
    assert_eq!(path.a.chain_id, "dymension_100-1");
    relayer.ensure_running()?;

    relayer.stop().await?;
    relayer.stop().await?;
    relayer.ensure_running()?;

    assert_eq!(runtime.live_containers(), 0);
    chains.teardown().await?;
    Ok(())
}

#[tokio::test]
async fn crashed_relayer_is_a_process_exit() -> TestResult {
    install_logger();
    let harness = MockSetup::builder().crashing(true).build().harness();
    let variant = RelayerVariant::containerized(local_image(), EVENTS);

    let error = harness
        .run(&[dymension(), osmosis()], &variant)
        .await
        .expect_err("crashed relayer must fail the run");

    assert!(matches!(error, HarnessError::ProcessExit { .. }), "{error}");
    assert!(harness
        .reporter()
        .events()
        .iter()
        .any(|event| matches!(event, ReportEvent::Diagnostic { .. })));
    assert!(harness.provisioner().network().running_chains().is_empty());
    assert_eq!(harness.factory().runtime().live_containers(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_stop_still_removes_the_container() -> TestResult {
    install_logger();
    let harness = MockSetup::builder().failing_stop(true).build().harness();
    let variant = RelayerVariant::containerized(local_image(), EVENTS);

    let error = harness
        .run(&[dymension(), osmosis()], &variant)
        .await
        .expect_err("failed stop must fail the run");

    assert!(
        matches!(error, HarnessError::ProcessExit { phase: Phase::Teardown, .. }),
        "{error}"
    );
    assert_eq!(harness.factory().runtime().live_containers(), 0);
    assert!(harness.provisioner().network().running_chains().is_empty());
    Ok(())
}

#[rstest]
#[case::in_process(RelayerVariant::in_process(EVENTS))]
#[case::containerized(RelayerVariant::containerized(local_image(), EVENTS))]
#[tokio::test]
async fn cancelled_run_releases_chains_and_containers(#[case] variant: RelayerVariant) -> TestResult {
    install_logger();
    let harness = MockSetup::builder()
        .fault(RelayFault::DropPackets)
        .build()
        .harness();

    let cancelled = tokio::time::timeout(
        Duration::from_secs(2),
        harness.run(&[dymension(), osmosis()], &variant),
    )
    .await;
    assert!(cancelled.is_err(), "run should still be waiting for the dropped packet");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.provisioner().network().running_chains().is_empty());
    assert_eq!(harness.factory().runtime().live_containers(), 0);
    Ok(())
}

#[tokio::test]
async fn containerized_only_factory_rejects_in_process() -> TestResult {
    install_logger();
    let provisioner = MockProvisioner::default();
    let runtime = Arc::new(MockContainerRuntime::new(MockRelayEngine::new(
        provisioner.network().clone(),
    )));
    let factory =
        RelayerFactory::<MockRelayEngine, _>::containerized_only(runtime, ImageCache::new());
    let mut chains = resolve_chain_pair(&provisioner, &[dymension(), osmosis()], "no-engine").await?;

    let built = factory
        .build(&RelayerVariant::in_process(EVENTS), &chains, "no-engine")
        .await;
    chains.teardown().await?;

    assert!(matches!(built, Err(ConstructionError::Configure(_))));
    Ok(())
}
