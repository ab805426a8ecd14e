use std::sync::Arc;

use rstest::rstest;
use serde_json::json;
use testresult::TestResult;

use crate::chain::cosmos::{
    find_event_attribute, parse_channel, parse_client_state, parse_connection,
    CosmosDockerProvisioner,
};
use crate::chain::{ChainProvisioner, HandshakeState};
use crate::container::ImageCache;
use crate::logging::install_logger;
use crate::mock::{MockContainerRuntime, MockNetwork, MockRelayEngine};
use crate::tests::{dymension, fast_config};

#[test]
fn client_state_reads_tracked_chain_and_height() -> TestResult {
    let response = json!({
        "client_state": {
            "@type": "/ibc.lightclients.tendermint.v1.ClientState",
            "chain_id": "osmosis-1001",
            "trusting_period": "604800s",
            "frozen_height": {"revision_number": "0", "revision_height": "0"},
            "latest_height": {"revision_number": "1001", "revision_height": "57"}
        },
        "proof": null,
        "proof_height": {"revision_number": "100", "revision_height": "60"}
    });

    let client = parse_client_state(&response)?;

    assert_eq!(client.chain_id, "osmosis-1001");
    assert_eq!(client.latest_height, 57);
    assert!(!client.frozen);
    Ok(())
}

#[test]
fn frozen_height_marks_client_frozen() -> TestResult {
    let response = json!({
        "client_state": {
            "chain_id": "osmosis-1001",
            "frozen_height": {"revision_number": "1001", "revision_height": "12"},
            "latest_height": {"revision_number": "1001", "revision_height": "57"}
        }
    });
    assert!(parse_client_state(&response)?.frozen);
    Ok(())
}

#[test]
fn connection_in_try_open_has_counterparty() -> TestResult {
    let response = json!({
        "connection": {
            "client_id": "07-tendermint-0",
            "versions": [{"identifier": "1", "features": ["ORDER_ORDERED", "ORDER_UNORDERED"]}],
            "state": "STATE_TRYOPEN",
            "counterparty": {
                "client_id": "07-tendermint-3",
                "connection_id": "connection-2",
                "prefix": {"key_prefix": "aWJj"}
            },
            "delay_period": "0"
        }
    });

    let connection = parse_connection(&response)?;

    assert_eq!(connection.state, HandshakeState::TryOpen);
    assert_eq!(connection.client_id, "07-tendermint-0");
    assert_eq!(connection.counterparty_client_id, "07-tendermint-3");
    assert_eq!(connection.counterparty_connection_id.as_deref(), Some("connection-2"));
    Ok(())
}

#[test]
fn channel_in_init_has_no_counterparty_channel() -> TestResult {
    let response = json!({
        "channel": {
            "state": "STATE_INIT",
            "ordering": "ORDER_UNORDERED",
            "counterparty": {"port_id": "transfer", "channel_id": ""},
            "connection_hops": ["connection-0"],
            "version": "ics20-1"
        }
    });

    let channel = parse_channel(&response)?;

    assert_eq!(channel.state, HandshakeState::Init);
    assert_eq!(channel.connection_id, "connection-0");
    assert_eq!(channel.counterparty_port_id, "transfer");
    assert_eq!(channel.counterparty_channel_id, None);
    assert_eq!(channel.version, "ics20-1");
    Ok(())
}

#[test]
fn unknown_state_is_an_error() {
    let response = json!({
        "channel": {
            "state": "STATE_FLUSHING",
            "counterparty": {"port_id": "transfer", "channel_id": "channel-0"},
            "connection_hops": ["connection-0"],
            "version": "ics20-1"
        }
    });
    assert!(parse_channel(&response).is_err());
}

#[test]
fn packet_sequence_found_in_flat_events() {
    let tx = json!({
        "code": 0,
        "events": [
            {"type": "message", "attributes": [{"key": "action", "value": "/ibc.applications.transfer.v1.MsgTransfer"}]},
            {"type": "send_packet", "attributes": [
                {"key": "packet_src_port", "value": "transfer"},
                {"key": "packet_sequence", "value": "3"}
            ]}
        ]
    });
    assert_eq!(
        find_event_attribute(&tx, "send_packet", "packet_sequence").as_deref(),
        Some("3")
    );
}

#[test]
fn packet_sequence_found_in_message_logs() {
    let tx = json!({
        "code": 0,
        "logs": [{
            "msg_index": 0,
            "events": [{"type": "send_packet", "attributes": [{"key": "packet_sequence", "value": "1"}]}]
        }]
    });
    assert_eq!(
        find_event_attribute(&tx, "send_packet", "packet_sequence").as_deref(),
        Some("1")
    );
    assert_eq!(find_event_attribute(&tx, "recv_packet", "packet_sequence"), None);
}

#[rstest]
#[case::bootstrap_fails(true)]
#[case::image_unavailable(false)]
#[tokio::test]
async fn failed_provisioning_leaves_no_containers_or_networks(
    #[case] image_available: bool,
) -> TestResult {
    install_logger();
    let config = dymension().resolve(0)?;
    let mut runtime = MockContainerRuntime::new(MockRelayEngine::new(MockNetwork::new()));
    if image_available {
        runtime = runtime.with_registry_image(config.image.clone());
    }
    let runtime = Arc::new(runtime);
    let provisioner =
        CosmosDockerProvisioner::new(runtime.clone(), ImageCache::new(), fast_config().retry);

    let result = provisioner.provision(config, "cleanup").await;

    assert!(result.is_err());
    assert_eq!(runtime.pulls(), 1);
    assert_eq!(runtime.live_containers(), 0);
    assert!(runtime.networks().is_empty(), "{:?}", runtime.networks());
    Ok(())
}
