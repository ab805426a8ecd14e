use core::time::Duration;

use rstest::rstest;
use testresult::TestResult;
use tokio::sync::watch;

use crate::chain::{resolve_chain_pair, ChainInstance, Coin, PacketTimeout, TransferRequest};
use crate::logging::install_logger;
use crate::mock::{MockProvisioner, MockRelayEngine};
use crate::relayer::{PacketProcessor, ProcessingStrategy};
use crate::tests::{dymension, osmosis, EVENTS};

#[rstest]
#[case::legacy_backfill(ProcessingStrategy::LegacyScan { block_history: 100 }, true)]
#[case::legacy_without_history(ProcessingStrategy::LegacyScan { block_history: 0 }, false)]
#[case::events_backfill(ProcessingStrategy::EventDriven { block_history: 100 }, true)]
#[case::events_without_history(EVENTS, false)]
#[tokio::test]
async fn earlier_packets_are_relayed_only_with_block_history(
    #[case] strategy: ProcessingStrategy,
    #[case] relayed: bool,
) -> TestResult {
    install_logger();
    let provisioner = MockProvisioner::default();
    let engine = MockRelayEngine::new(provisioner.network().clone())
        .with_tick(Duration::from_millis(20));
    let mut chains = resolve_chain_pair(&provisioner, &[dymension(), osmosis()], "backfill").await?;
    let path = engine.link_chains(chains.a.chain_id(), chains.b.chain_id())?;

    let sent = chains
        .a
        .send_transfer(TransferRequest {
            port_id: path.a.port_id.clone(),
            channel_id: path.a.channel_id.clone(),
            sender: chains.a.user_wallet().clone(),
            receiver: chains.b.user_wallet().address.clone(),
            amount: Coin::new(chains.a.config().denom.clone(), 1_000),
            timeout: PacketTimeout::Default,
        })
        .await?;

    // Let a few blocks commit the packet before the processor exists.
    let sent_at = chains.a.height()?;
    while chains.a.height()? < sent_at + 2 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let processor = engine.build_processor(&path, strategy)?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let processing = tokio::spawn(processor.run(shutdown_rx));

    let mut received = false;
    for _ in 0..25 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        received = chains
            .b
            .has_receipt(&path.b.port_id, &path.b.channel_id, sent.sequence)?;
        if received {
            break;
        }
    }

    shutdown.send_replace(true);
    processing.await??;
    chains.teardown().await?;

    assert_eq!(received, relayed);
    Ok(())
}

#[tokio::test]
async fn legacy_scan_relays_packets_sent_after_start() -> TestResult {
    install_logger();
    let provisioner = MockProvisioner::default();
    let engine = MockRelayEngine::new(provisioner.network().clone())
        .with_tick(Duration::from_millis(20));
    let mut chains = resolve_chain_pair(&provisioner, &[dymension(), osmosis()], "scan").await?;
    let path = engine.link_chains(chains.a.chain_id(), chains.b.chain_id())?;

    let processor = engine.build_processor(&path, ProcessingStrategy::LegacyScan { block_history: 0 })?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let processing = tokio::spawn(processor.run(shutdown_rx));

    let sent = chains
        .a
        .send_transfer(TransferRequest {
            port_id: path.a.port_id.clone(),
            channel_id: path.a.channel_id.clone(),
            sender: chains.a.user_wallet().clone(),
            receiver: chains.b.user_wallet().address.clone(),
            amount: Coin::new(chains.a.config().denom.clone(), 1_000),
            timeout: PacketTimeout::Default,
        })
        .await?;

    let mut acknowledged = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        acknowledged = !chains
            .a
            .has_commitment(&path.a.port_id, &path.a.channel_id, sent.sequence)?;
        if acknowledged {
            break;
        }
    }

    shutdown.send_replace(true);
    processing.await??;
    chains.teardown().await?;

    assert!(acknowledged, "packet {} never acknowledged", sent.sequence);
    Ok(())
}
