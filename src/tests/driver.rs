use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use std::sync::Arc;

use rstest::rstest;
use serde_json::json;
use testresult::TestResult;

use crate::chain::HandshakeState::{self, Closed, Init, Open, TryOpen};
use crate::container::ImageCache;
use crate::driver::{HandshakeTracker, Harness, PacketState};
use crate::error::{HarnessError, Phase};
use crate::logging::install_logger;
use crate::mock::{MockContainerRuntime, MockProvisioner, MockRelayEngine, RelayFault};
use crate::relayer::{ProcessingStrategy, RelayerFactory, RelayerVariant};
use crate::report::{NopReporter, ReportEvent};
use crate::retry::{Observation, RetryPolicy};
use crate::tests::{dymension, fast_config, osmosis, MockSetup, EVENTS};

#[rstest]
#[case(true, false, PacketState::Sent)]
#[case(true, true, PacketState::Relayed)]
#[case(false, true, PacketState::Acknowledged)]
#[case(false, false, PacketState::TimedOut)]
fn packet_state_from_commitment_and_receipt(
    #[case] commitment: bool,
    #[case] receipt: bool,
    #[case] expected: PacketState,
) {
    let state = PacketState::classify(commitment, receipt);
    assert_eq!(state, expected);
    assert_eq!(
        state.is_terminal(),
        matches!(expected, PacketState::Acknowledged | PacketState::TimedOut)
    );
}

#[rstest]
#[case(&[Init, TryOpen, Open])]
#[case(&[Init, Init, TryOpen, TryOpen, Open])]
#[case(&[TryOpen, Open])]
#[case(&[Open])]
fn handshake_progressions_are_accepted(#[case] states: &[HandshakeState]) -> TestResult {
    let mut tracker = HandshakeTracker::new(Phase::ConnectionHandshake, "connection-0");
    let (last, earlier) = states.split_last().expect("at least one state");

    for state in earlier {
        assert!(!tracker.observe(*state)?);
    }
    assert!(tracker.observe(*last)?);
    assert_eq!(tracker.last(), Some(Open));
    Ok(())
}

#[rstest]
#[case(&[TryOpen, Init])]
#[case(&[Open, TryOpen])]
#[case(&[Init, Closed])]
fn handshake_regressions_are_rejected(#[case] states: &[HandshakeState]) {
    let mut tracker = HandshakeTracker::new(Phase::ChannelHandshake, "transfer/channel-0");
    let (last, earlier) = states.split_last().expect("at least one state");

    for state in earlier {
        assert!(tracker.observe(*state).is_ok());
    }
    let error = tracker.observe(*last).expect_err("regression must fail");
    assert!(matches!(
        error,
        HarnessError::ProtocolAssertion {
            phase: Phase::ChannelHandshake,
            ..
        }
    ));
}

#[rstest]
#[case(1, Duration::ZERO)]
#[case(2, Duration::from_millis(200))]
#[case(3, Duration::from_millis(400))]
#[case(6, Duration::from_millis(3200))]
#[case(7, Duration::from_secs(5))]
#[case(30, Duration::from_secs(5))]
fn backoff_doubles_up_to_the_cap(#[case] attempt: u32, #[case] expected: Duration) {
    assert_eq!(RetryPolicy::default().delay_for_attempt(attempt), expected);
}

#[test]
fn budget_sums_every_delay() {
    let policy = RetryPolicy::builder().max_attempts(3).build();
    assert_eq!(policy.budget(), Duration::from_millis(600));
}

#[tokio::test]
async fn poll_gives_up_at_the_ceiling() {
    let policy = RetryPolicy::builder()
        .initial_delay(Duration::from_millis(1))
        .max_attempts(4)
        .build();
    let polls = AtomicU32::new(0);
    let counter = &polls;

    let result = policy
        .poll_until(Phase::RelayPacket, "packet RELAYED", move || async move {
            let poll = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<Observation<()>, HarnessError>(Observation::Pending(format!("poll {poll}")))
        })
        .await;

    assert_eq!(polls.load(Ordering::SeqCst), 4);
    match result {
        Err(HarnessError::LivenessBoundExceeded {
            phase,
            attempts,
            last_observed,
            ..
        }) => {
            assert_eq!(phase, Phase::RelayPacket);
            assert_eq!(attempts, 4);
            assert_eq!(last_observed, "poll 4");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn poll_stops_on_first_error() {
    let policy = RetryPolicy::builder()
        .initial_delay(Duration::from_millis(1))
        .build();
    let polls = AtomicU32::new(0);
    let counter = &polls;

    let result = policy
        .poll_until(Phase::ChannelHandshake, "channel OPEN", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Observation<()>, _>(HarnessError::assertion(
                Phase::ChannelHandshake,
                "OPEN",
                "CLOSED",
            ))
        })
        .await;

    assert_eq!(polls.load(Ordering::SeqCst), 1);
    assert!(matches!(result, Err(HarnessError::ProtocolAssertion { .. })));
}

#[tokio::test]
async fn successful_run_reports_every_phase() -> TestResult {
    install_logger();
    let harness = MockSetup::builder().build().harness();
    let variant = RelayerVariant::in_process(EVENTS);

    harness.run(&[dymension(), osmosis()], &variant).await?;

    let events = harness.reporter().events();
    assert!(matches!(events.first(), Some(ReportEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(ReportEvent::RunFinished { passed: true, .. })
    ));

    let passed: Vec<Phase> = events
        .iter()
        .filter_map(|event| match event {
            ReportEvent::PhasePassed { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        passed,
        [
            Phase::Provision,
            Phase::Construct,
            Phase::ChainsRunning,
            Phase::RelayerReady,
            Phase::ClientHandshake,
            Phase::ConnectionHandshake,
            Phase::ChannelHandshake,
            Phase::SendPacket,
            Phase::RelayPacket,
            Phase::AcknowledgePacket,
            Phase::SendPacket,
            Phase::TimeoutPacket,
            Phase::Teardown,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn dropped_packets_exceed_the_liveness_bound() -> TestResult {
    install_logger();
    let mut config = fast_config();
    config.retry.max_attempts = 10;
    let harness = MockSetup::builder()
        .fault(RelayFault::DropPackets)
        .config(config)
        .build()
        .harness();
    let variant = RelayerVariant::in_process(EVENTS);

    let error = harness
        .run(&[dymension(), osmosis()], &variant)
        .await
        .expect_err("dropped packet must fail the run");

    assert!(error.is_liveness(), "{error}");
    assert_eq!(error.phase(), Phase::RelayPacket);

    let failures = harness.reporter().failures();
    assert!(failures.iter().any(|event| matches!(
        event,
        ReportEvent::PhaseFailed {
            phase: Phase::RelayPacket,
            ..
        }
    )));
    assert!(matches!(
        harness.reporter().events().last(),
        Some(ReportEvent::RunFinished { passed: false, .. })
    ));
    assert!(harness.provisioner().network().running_chains().is_empty());
    Ok(())
}

#[tokio::test]
async fn double_delivery_is_a_protocol_violation() -> TestResult {
    install_logger();
    let harness = MockSetup::builder()
        .provisioner(MockProvisioner::builder().allow_redelivery(true).build())
        .fault(RelayFault::Redeliver)
        .build()
        .harness();
    let variant = RelayerVariant::in_process(EVENTS);

    let error = harness
        .run(&[dymension(), osmosis()], &variant)
        .await
        .expect_err("second delivery must fail the run");

    match &error {
        HarnessError::ProtocolAssertion { phase, actual, .. } => {
            assert!(
                matches!(phase, Phase::RelayPacket | Phase::AcknowledgePacket),
                "{error}"
            );
            assert_eq!(actual, "2 deliveries");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(harness.provisioner().network().running_chains().is_empty());
    Ok(())
}

#[tokio::test]
async fn chain_rejects_duplicate_delivery() -> TestResult {
    install_logger();
    let harness = MockSetup::builder()
        .fault(RelayFault::Redeliver)
        .build()
        .harness();
    let variant = RelayerVariant::in_process(ProcessingStrategy::LegacyScan { block_history: 0 });

    let outcome = harness.run(&[dymension(), osmosis()], &variant).await?;

    assert_eq!(outcome.relay_packet.deliveries, 1);
    assert_eq!(outcome.relay_packet.state, PacketState::Acknowledged);
    Ok(())
}

#[tokio::test]
async fn failed_provisioning_is_reported_as_provision() -> TestResult {
    install_logger();
    let harness = MockSetup::builder()
        .provisioner(
            MockProvisioner::builder()
                .failing_chains(vec!["dymension_100-1".to_string()])
                .build(),
        )
        .build()
        .harness();
    let variant = RelayerVariant::in_process(EVENTS);

    let error = harness
        .run(&[dymension(), osmosis()], &variant)
        .await
        .expect_err("provisioning must fail");

    assert_eq!(error.phase(), Phase::Provision);
    assert_eq!(
        harness.reporter().failures(),
        [ReportEvent::PhaseFailed {
            run: run_of(&harness.reporter().events()),
            phase: Phase::Provision,
            cause: error.to_string(),
        }]
    );
    assert!(harness.provisioner().network().running_chains().is_empty());
    Ok(())
}

fn run_of(events: &[ReportEvent]) -> String {
    match events.first() {
        Some(ReportEvent::RunStarted { run }) => run.clone(),
        other => panic!("run did not start with RunStarted: {other:?}"),
    }
}

#[test]
fn report_events_serialize_with_a_kind_tag() {
    let event = ReportEvent::PhaseFailed {
        run: "conformance-1-0".into(),
        phase: Phase::TimeoutPacket,
        cause: "boom".into(),
    };
    assert_eq!(
        event.to_json(),
        json!({
            "kind": "phase_failed",
            "run": "conformance-1-0",
            "phase": "timeout_packet",
            "cause": "boom",
        })
    );
}

#[tokio::test]
async fn harness_runs_without_a_reporter() -> TestResult {
    install_logger();
    let provisioner = MockProvisioner::default();
    let engine = MockRelayEngine::new(provisioner.network().clone());
    let runtime = Arc::new(MockContainerRuntime::new(engine.clone()));
    let factory = RelayerFactory::new(engine, runtime, ImageCache::new());
    let harness = Harness::new(provisioner, factory, fast_config(), NopReporter);
    let variant = RelayerVariant::in_process(ProcessingStrategy::LegacyScan { block_history: 100 });

    let outcome = harness.run(&[dymension(), osmosis()], &variant).await?;

    assert_eq!(outcome.relay_packet.state, PacketState::Acknowledged);
    assert!(harness.provisioner().network().running_chains().is_empty());
    Ok(())
}

#[tokio::test]
async fn silent_node_is_a_provisioning_failure() -> TestResult {
    install_logger();
    let mut config = fast_config();
    config.retry.max_attempts = 5;
    let harness = MockSetup::builder()
        .provisioner(
            MockProvisioner::builder()
                .block_time(Duration::from_secs(3600))
                .build(),
        )
        .config(config)
        .build()
        .harness();
    let variant = RelayerVariant::in_process(EVENTS);

    let error = harness
        .run(&[dymension(), osmosis()], &variant)
        .await
        .expect_err("a chain without blocks must fail the run");

    match &error {
        HarnessError::Provisioning { chain, .. } => assert_eq!(chain, "dymension_100-1"),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(error.phase(), Phase::Provision);
    assert!(error.to_string().contains("node startup timeout"), "{error}");

    let passed: Vec<Phase> = harness
        .reporter()
        .events()
        .iter()
        .filter_map(|event| match event {
            ReportEvent::PhasePassed { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(passed, [Phase::Provision, Phase::Construct]);
    assert!(harness.provisioner().network().running_chains().is_empty());
    Ok(())
}
