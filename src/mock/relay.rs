use core::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::chain::{ChainEndpoint, TRANSFER_PORT, TRANSFER_VERSION};
use crate::mock::chain::{BlockEvents, ChainEvent, IbcMsg, MockChain, Packet};
use crate::mock::MockNetwork;
use crate::relayer::{LinkedPath, PacketProcessor, PathEnd, ProcessingStrategy, RelayEngine};

const DEFAULT_TICK: Duration = Duration::from_millis(50);
/// Failed deliveries are retried this many times before being dropped.
const MAX_DELIVERY_ATTEMPTS: u32 = 100;

/// Misbehaviour injected into the mock relayer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RelayFault {
    #[default]
    None,
    /// Never delivers packets, so nothing reaches the destination chain.
    DropPackets,
    /// Submits every packet to the destination chain twice.
    Redeliver,
}

/// Relay engine driving [`MockChain`]s directly.
#[derive(Clone)]
pub struct MockRelayEngine {
    network: MockNetwork,
    fault: RelayFault,
    tick: Duration,
}

impl MockRelayEngine {
    pub fn new(network: MockNetwork) -> Self {
        Self {
            network,
            fault: RelayFault::None,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_fault(mut self, fault: RelayFault) -> Self {
        self.fault = fault;
        self
    }

    /// Cadence of the legacy scan and of delivery retries.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    /// Runs the client, connection and transfer channel handshakes between
    /// two running chains.
    pub fn link_chains(&self, a_id: &str, b_id: &str) -> anyhow::Result<LinkedPath> {
        let a = self.network.chain(a_id)?;
        let b = self.network.chain(b_id)?;

        let created = |chain: &MockChain, msg: IbcMsg| -> anyhow::Result<String> {
            let what = format!("{msg:?}");
            chain
                .deliver(msg)?
                .with_context(|| format!("{what} created nothing"))
        };
        let deliver = |chain: &MockChain, msg: IbcMsg| -> anyhow::Result<()> {
            chain.deliver(msg).map(|_| ())
        };

        let client_a = created(&a, IbcMsg::CreateClient {
            counterparty_chain_id: b_id.to_string(),
        })?;
        let client_b = created(&b, IbcMsg::CreateClient {
            counterparty_chain_id: a_id.to_string(),
        })?;
        debug!(%client_a, %client_b, "clients created");

        let connection_a = created(&a, IbcMsg::ConnOpenInit {
            client_id: client_a.clone(),
            counterparty_client_id: client_b.clone(),
        })?;
        deliver(&b, IbcMsg::UpdateClient {
            client_id: client_b.clone(),
        })?;
        let connection_b = created(&b, IbcMsg::ConnOpenTry {
            client_id: client_b.clone(),
            counterparty_client_id: client_a.clone(),
            counterparty_connection_id: connection_a.clone(),
        })?;
        deliver(&a, IbcMsg::UpdateClient {
            client_id: client_a.clone(),
        })?;
        deliver(&a, IbcMsg::ConnOpenAck {
            connection_id: connection_a.clone(),
            counterparty_connection_id: connection_b.clone(),
        })?;
        deliver(&b, IbcMsg::ConnOpenConfirm {
            connection_id: connection_b.clone(),
        })?;
        debug!(%connection_a, %connection_b, "connection open");

        let channel_a = created(&a, IbcMsg::ChanOpenInit {
            port_id: TRANSFER_PORT.to_string(),
            connection_id: connection_a.clone(),
            counterparty_port_id: TRANSFER_PORT.to_string(),
            version: TRANSFER_VERSION.to_string(),
        })?;
        let channel_b = created(&b, IbcMsg::ChanOpenTry {
            port_id: TRANSFER_PORT.to_string(),
            connection_id: connection_b.clone(),
            counterparty_port_id: TRANSFER_PORT.to_string(),
            counterparty_channel_id: channel_a.clone(),
            version: TRANSFER_VERSION.to_string(),
        })?;
        deliver(&a, IbcMsg::ChanOpenAck {
            port_id: TRANSFER_PORT.to_string(),
            channel_id: channel_a.clone(),
            counterparty_channel_id: channel_b.clone(),
        })?;
        deliver(&b, IbcMsg::ChanOpenConfirm {
            port_id: TRANSFER_PORT.to_string(),
            channel_id: channel_b.clone(),
        })?;
        debug!(%channel_a, %channel_b, "channel open");

        Ok(LinkedPath {
            name: format!("{a_id}-{b_id}"),
            a: PathEnd {
                chain_id: a_id.to_string(),
                client_id: client_a,
                connection_id: connection_a,
                port_id: TRANSFER_PORT.to_string(),
                channel_id: channel_a,
            },
            b: PathEnd {
                chain_id: b_id.to_string(),
                client_id: client_b,
                connection_id: connection_b,
                port_id: TRANSFER_PORT.to_string(),
                channel_id: channel_b,
            },
        })
    }

    /// Builds the processing loop. Event subscriptions and scan start heights
    /// are fixed here, before the caller learns the path is ready.
    pub fn build_processor(
        &self,
        path: &LinkedPath,
        strategy: ProcessingStrategy,
    ) -> anyhow::Result<MockProcessor> {
        let sides = [
            Side {
                chain: self.network.chain(&path.a.chain_id)?,
                end: path.a.clone(),
            },
            Side {
                chain: self.network.chain(&path.b.chain_id)?,
                end: path.b.clone(),
            },
        ];

        let source = match strategy {
            ProcessingStrategy::EventDriven { block_history } => {
                // Subscribe before reading the height so no block falls between
                // the backfill and the stream.
                let events = [sides[0].chain.subscribe(), sides[1].chain.subscribe()];
                let latest = [sides[0].chain.height()?, sides[1].chain.height()?];
                BlockSource::Events {
                    events,
                    backfill_from: [
                        backfill_start(latest[0], block_history),
                        backfill_start(latest[1], block_history),
                    ],
                    streamed_after: latest,
                }
            }
            ProcessingStrategy::LegacyScan { block_history } => BlockSource::Scan {
                next: [
                    backfill_start(sides[0].chain.height()?, block_history),
                    backfill_start(sides[1].chain.height()?, block_history),
                ],
            },
        };

        Ok(MockProcessor {
            relay: Relay {
                sides,
                fault: self.fault,
            },
            source,
            tick: self.tick,
        })
    }
}

impl RelayEngine for MockRelayEngine {
    type Processor = MockProcessor;

    async fn link_path(&self, a: &ChainEndpoint, b: &ChainEndpoint) -> anyhow::Result<LinkedPath> {
        self.link_chains(&a.chain_id, &b.chain_id)
    }

    async fn processor(
        &self,
        path: &LinkedPath,
        strategy: ProcessingStrategy,
    ) -> anyhow::Result<MockProcessor> {
        self.build_processor(path, strategy)
    }
}

/// First height to process when `block_history` blocks up to `latest` are
/// backfilled.
fn backfill_start(latest: u64, block_history: u64) -> u64 {
    if block_history == 0 {
        latest + 1
    } else {
        (latest + 1).saturating_sub(block_history).max(1)
    }
}

struct Side {
    chain: MockChain,
    end: PathEnd,
}

enum BlockSource {
    Events {
        events: [broadcast::Receiver<BlockEvents>; 2],
        backfill_from: [u64; 2],
        /// Streamed blocks at or below these heights were backfilled.
        streamed_after: [u64; 2],
    },
    Scan { next: [u64; 2] },
}

enum Work {
    /// A packet committed on side `from`, to be received or timed out.
    Relay { from: usize, packet: Packet },
    /// An acknowledgement written on side `from`, to be relayed back.
    Ack { from: usize, packet: Packet },
}

struct Retry {
    work: Work,
    attempts: u32,
}

struct Relay {
    sides: [Side; 2],
    fault: RelayFault,
}

impl Relay {
    fn handle_block(&self, from: usize, events: Vec<ChainEvent>, retries: &mut Vec<Retry>) {
        for event in events {
            let work = match event {
                ChainEvent::SendPacket(packet) => Work::Relay { from, packet },
                ChainEvent::WriteAcknowledgement(packet) => Work::Ack { from, packet },
            };
            if !self.concerns_path(&work) {
                continue;
            }
            if let Err(e) = self.process(&work) {
                debug!(error = %e, "delivery failed, will retry");
                retries.push(Retry { work, attempts: 1 });
            }
        }
    }

    fn concerns_path(&self, work: &Work) -> bool {
        match work {
            Work::Relay { from, packet } => {
                let end = &self.sides[*from].end;
                packet.source_port == end.port_id && packet.source_channel == end.channel_id
            }
            Work::Ack { from, packet } => {
                let end = &self.sides[*from].end;
                packet.destination_port == end.port_id
                    && packet.destination_channel == end.channel_id
            }
        }
    }

    fn process(&self, work: &Work) -> anyhow::Result<()> {
        match work {
            Work::Relay { from, packet } => {
                if self.fault == RelayFault::DropPackets {
                    debug!(sequence = packet.sequence, "dropping packet");
                    return Ok(());
                }

                let src = &self.sides[*from];
                let dst = &self.sides[1 - from];

                if packet.is_expired_at(dst.chain.time()?) {
                    src.chain.deliver(IbcMsg::UpdateClient {
                        client_id: src.end.client_id.clone(),
                    })?;
                    src.chain.deliver(IbcMsg::Timeout(packet.clone()))?;
                    debug!(sequence = packet.sequence, "packet timed out");
                    return Ok(());
                }

                dst.chain.deliver(IbcMsg::UpdateClient {
                    client_id: dst.end.client_id.clone(),
                })?;
                dst.chain.deliver(IbcMsg::RecvPacket(packet.clone()))?;
                debug!(sequence = packet.sequence, "packet received");

                if self.fault == RelayFault::Redeliver {
                    if let Err(e) = dst.chain.deliver(IbcMsg::RecvPacket(packet.clone())) {
                        debug!(sequence = packet.sequence, error = %e, "redelivery rejected");
                    }
                }
                Ok(())
            }
            Work::Ack { from, packet } => {
                let src = &self.sides[1 - from];
                src.chain.deliver(IbcMsg::UpdateClient {
                    client_id: src.end.client_id.clone(),
                })?;
                src.chain.deliver(IbcMsg::Acknowledgement(packet.clone()))?;
                debug!(sequence = packet.sequence, "acknowledgement relayed");
                Ok(())
            }
        }
    }

    fn retry(&self, retries: &mut Vec<Retry>) {
        let pending = core::mem::take(retries);
        for mut retry in pending {
            match self.process(&retry.work) {
                Ok(()) => {}
                Err(e) if retry.attempts >= MAX_DELIVERY_ATTEMPTS => {
                    warn!(error = %e, attempts = retry.attempts, "giving up on delivery");
                }
                Err(_) => {
                    retry.attempts += 1;
                    retries.push(retry);
                }
            }
        }
    }

    fn scan(&self, next: &mut [u64; 2], retries: &mut Vec<Retry>) -> anyhow::Result<()> {
        for (index, side) in self.sides.iter().enumerate() {
            let latest = side.chain.height()?;
            self.replay(index, next[index], latest, retries)?;
            next[index] = next[index].max(latest + 1);
        }
        Ok(())
    }

    /// Handles the retained blocks `from..=to` of side `index`.
    fn replay(&self, index: usize, from: u64, to: u64, retries: &mut Vec<Retry>) -> anyhow::Result<()> {
        let side = &self.sides[index];
        for height in from..=to {
            match side.chain.block_events(height)? {
                Some(events) => self.handle_block(index, events, retries),
                None => warn!(height, chain_id = %side.end.chain_id, "block no longer retained"),
            }
        }
        Ok(())
    }
}

/// The packet-processing loop of [`MockRelayEngine`].
pub struct MockProcessor {
    relay: Relay,
    source: BlockSource,
    tick: Duration,
}

impl PacketProcessor for MockProcessor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let MockProcessor {
            relay,
            source,
            tick,
        } = self;
        let mut ticker = tokio::time::interval(tick);
        let mut retries = Vec::new();

        match source {
            BlockSource::Events {
                events: [mut events_a, mut events_b],
                backfill_from,
                streamed_after,
            } => {
                for index in 0..2 {
                    relay.replay(index, backfill_from[index], streamed_after[index], &mut retries)?;
                }
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        block = events_a.recv() => {
                            let events = received(block, &relay.sides[0], streamed_after[0])?;
                            relay.handle_block(0, events, &mut retries);
                        }
                        block = events_b.recv() => {
                            let events = received(block, &relay.sides[1], streamed_after[1])?;
                            relay.handle_block(1, events, &mut retries);
                        }
                        _ = ticker.tick() => relay.retry(&mut retries),
                    }
                }
            }
            BlockSource::Scan { mut next } => loop {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    _ = ticker.tick() => {
                        relay.retry(&mut retries);
                        relay.scan(&mut next, &mut retries)?;
                    }
                }
            },
        }
    }
}

fn received(
    block: Result<BlockEvents, RecvError>,
    side: &Side,
    streamed_after: u64,
) -> anyhow::Result<Vec<ChainEvent>> {
    match block {
        Ok(block) if block.height <= streamed_after => Ok(Vec::new()),
        Ok(block) => Ok(block.events),
        Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, chain_id = %side.end.chain_id, "event subscription lagged");
            Ok(Vec::new())
        }
        Err(RecvError::Closed) => {
            anyhow::bail!("event subscription of {} closed", side.end.chain_id)
        }
    }
}
