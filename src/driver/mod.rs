//! The standardized IBC conformance sequence run against one chain pair and
//! one relayer.

use core::future::Future;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info};

use crate::chain::{
    ChainInstance, ChainPair, Coin, HandshakeState, PacketTimeout, TransferRequest,
    TRANSFER_VERSION,
};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Phase, Result};
use crate::lock;
use crate::relayer::{LinkedPath, PathEnd, RelayerHandle};
use crate::report::{ReportEvent, Reporter};
use crate::retry::Observation;

pub mod harness;
pub mod state;

pub use harness::Harness;
pub use state::{HandshakeTracker, PacketState};

/// What happened to one transfer packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PacketOutcome {
    pub sequence: u64,
    pub state: PacketState,
    /// Successful receives on the destination chain.
    pub deliveries: u64,
    /// Net decrease of the sender's balance, fee included.
    pub sender_debit: u128,
    /// Net increase of the receiver's voucher balance.
    pub receiver_credit: u128,
}

/// Observable result of a passing run. Two runs over equivalent chain pairs
/// produce equal outcomes whatever relayer variant they used.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConformanceOutcome {
    pub path: LinkedPath,
    pub connection_states: [HandshakeState; 2],
    pub channel_states: [HandshakeState; 2],
    pub relay_packet: PacketOutcome,
    pub timeout_packet: Option<PacketOutcome>,
}

/// Drives one run. Owns nothing: provisioning, stopping the relayer and
/// teardown belong to the caller.
pub struct Driver<'a, C: ChainInstance, H: RelayerHandle> {
    chains: &'a ChainPair<C>,
    relayer: &'a mut H,
    config: &'a HarnessConfig,
    reporter: &'a dyn Reporter,
    run: &'a str,
}

impl<'a, C: ChainInstance, H: RelayerHandle> Driver<'a, C, H> {
    pub fn new(
        chains: &'a ChainPair<C>,
        relayer: &'a mut H,
        config: &'a HarnessConfig,
        reporter: &'a dyn Reporter,
        run: &'a str,
    ) -> Self {
        Self {
            chains,
            relayer,
            config,
            reporter,
            run,
        }
    }

    pub async fn run(mut self) -> Result<ConformanceOutcome> {
        let result = self.steps().await;
        if let Err(e) = &result {
            self.reporter.record(ReportEvent::PhaseFailed {
                run: self.run.to_string(),
                phase: e.phase(),
                cause: e.to_string(),
            });
        }
        result
    }

    async fn steps(&mut self) -> Result<ConformanceOutcome> {
        self.await_chains_running().await?;
        self.passed(Phase::ChainsRunning);

        self.relayer.start().await?;
        let path = self.relayer.await_ready(self.config.ready_timeout).await?;
        self.check_path(&path)?;
        info!(path = %path.name, "relayer reports path linked");
        self.passed(Phase::RelayerReady);

        let (connection_states, channel_states) = self.await_handshake(&path).await?;

        let relay_packet = self.transfer(&path, PacketTimeout::Default).await?;
        let timeout_packet = if self.config.test_timeout {
            Some(self.transfer(&path, PacketTimeout::Expired).await?)
        } else {
            None
        };

        self.recheck_handshake(&path).await?;

        Ok(ConformanceOutcome {
            path,
            connection_states,
            channel_states,
            relay_packet,
            timeout_packet,
        })
    }

    fn passed(&self, phase: Phase) {
        debug!(%phase, "phase passed");
        self.reporter.record(ReportEvent::PhasePassed {
            run: self.run.to_string(),
            phase,
        });
    }

    /// Fails if the relayer went away, attributing the exit to `phase`.
    fn relayer_alive(&self, phase: Phase) -> Result<()> {
        self.relayer.ensure_running().map_err(|e| match e {
            HarnessError::ProcessExit { code, detail, .. } => HarnessError::ProcessExit {
                phase,
                code,
                detail,
            },
            other => other,
        })
    }

    /// Retries a read until it succeeds. Query errors count as "not yet".
    async fn query<T, F, Fut>(&self, phase: Phase, what: &str, mut read: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.config
            .retry
            .poll_until(phase, what, || {
                let read = read();
                async move {
                    Ok::<_, HarnessError>(match read.await {
                        Ok(value) => Observation::Ready(value),
                        Err(e) => Observation::Pending(format!("query failed: {e:#}")),
                    })
                }
            })
            .await
    }

    /// A node that never produces blocks did not start, which is a
    /// provisioning failure rather than a liveness one.
    async fn await_chains_running(&self) -> Result<()> {
        for chain in [&self.chains.a, &self.chains.b] {
            self.await_blocks(chain).await.map_err(|e| match e {
                e @ HarnessError::LivenessBoundExceeded { .. } => HarnessError::provisioning(
                    chain.chain_id(),
                    anyhow::Error::new(e).context("node startup timeout"),
                ),
                other => other,
            })?;
        }
        Ok(())
    }

    async fn await_blocks(&self, chain: &C) -> Result<()> {
        let waiting_for = format!("block production on {}", chain.chain_id());
        self.query(Phase::ChainsRunning, &waiting_for, || chain.health_check())
            .await?;
        let start = self
            .query(Phase::ChainsRunning, &waiting_for, || chain.latest_height())
            .await?;

        let height = self
            .config
            .retry
            .poll_until(Phase::ChainsRunning, &waiting_for, move || async move {
                Ok::<_, HarnessError>(match chain.latest_height().await {
                    Ok(height) if height > start => Observation::Ready(height),
                    Ok(height) => Observation::Pending(format!("height {height}")),
                    Err(e) => Observation::Pending(format!("query failed: {e:#}")),
                })
            })
            .await?;
        debug!(chain_id = %chain.chain_id(), height, "chain producing blocks");
        Ok(())
    }

    fn check_path(&self, path: &LinkedPath) -> Result<()> {
        let expected = [self.chains.a.chain_id(), self.chains.b.chain_id()];
        let actual = [path.a.chain_id.as_str(), path.b.chain_id.as_str()];
        if expected != actual {
            return Err(HarnessError::assertion(
                Phase::RelayerReady,
                format!("path between {} and {}", expected[0], expected[1]),
                format!("path between {} and {}", actual[0], actual[1]),
            ));
        }
        Ok(())
    }

    /// The chain holding `end` and the opposite end, for both ends.
    fn sides<'p>(&self, path: &'p LinkedPath) -> [(&C, &'p PathEnd, &'p PathEnd); 2] {
        [
            (&self.chains.a, &path.a, &path.b),
            (&self.chains.b, &path.b, &path.a),
        ]
    }

    async fn await_handshake(
        &self,
        path: &LinkedPath,
    ) -> Result<([HandshakeState; 2], [HandshakeState; 2])> {
        for (chain, end, other) in self.sides(path) {
            self.await_client(chain, end, other).await?;
        }
        self.passed(Phase::ClientHandshake);

        let mut connections = [HandshakeState::Uninitialized; 2];
        for (index, (chain, end, other)) in self.sides(path).into_iter().enumerate() {
            connections[index] = self.await_connection(chain, end, other).await?;
        }
        self.passed(Phase::ConnectionHandshake);

        let mut channels = [HandshakeState::Uninitialized; 2];
        for (index, (chain, end, other)) in self.sides(path).into_iter().enumerate() {
            channels[index] = self.await_channel(chain, end, other).await?;
        }
        self.passed(Phase::ChannelHandshake);

        Ok((connections, channels))
    }

    async fn await_client(&self, chain: &C, end: &PathEnd, other: &PathEnd) -> Result<()> {
        let phase = Phase::ClientHandshake;
        let waiting_for = format!("client {} on {}", end.client_id, end.chain_id);

        let client = self
            .config
            .retry
            .poll_until(phase, &waiting_for, move || async move {
                self.relayer_alive(phase)?;
                Ok::<_, HarnessError>(match chain.query_client(&end.client_id).await {
                    Ok(Some(client)) => Observation::Ready(client),
                    Ok(None) => Observation::Pending("client not found".into()),
                    Err(e) => Observation::Pending(format!("query failed: {e:#}")),
                })
            })
            .await?;

        if client.chain_id != other.chain_id {
            return Err(HarnessError::assertion(
                phase,
                format!("{} tracking {}", end.client_id, other.chain_id),
                format!("{} tracking {}", end.client_id, client.chain_id),
            ));
        }
        if client.frozen {
            return Err(HarnessError::assertion(
                phase,
                format!("{} active", end.client_id),
                "frozen client",
            ));
        }
        Ok(())
    }

    async fn await_connection(
        &self,
        chain: &C,
        end: &PathEnd,
        other: &PathEnd,
    ) -> Result<HandshakeState> {
        let phase = Phase::ConnectionHandshake;
        let waiting_for = format!("connection {} on {} OPEN", end.connection_id, end.chain_id);
        let tracker = Mutex::new(HandshakeTracker::new(
            phase,
            format!("connection {} on {}", end.connection_id, end.chain_id),
        ));
        let tracker = &tracker;

        let connection = self
            .config
            .retry
            .poll_until(phase, &waiting_for, move || async move {
                self.relayer_alive(phase)?;
                Ok::<_, HarnessError>(match chain.query_connection(&end.connection_id).await {
                    Ok(Some(connection)) => {
                        if lock(tracker).observe(connection.state)? {
                            Observation::Ready(connection)
                        } else {
                            Observation::Pending(connection.state.to_string())
                        }
                    }
                    Ok(None) => Observation::Pending("connection not found".into()),
                    Err(e) => Observation::Pending(format!("query failed: {e:#}")),
                })
            })
            .await?;

        let expected = (
            end.client_id.as_str(),
            other.client_id.as_str(),
            Some(other.connection_id.as_str()),
        );
        let actual = (
            connection.client_id.as_str(),
            connection.counterparty_client_id.as_str(),
            connection.counterparty_connection_id.as_deref(),
        );
        if expected != actual {
            return Err(HarnessError::assertion(
                phase,
                format!("{} with ends {expected:?}", end.connection_id),
                format!("ends {actual:?}"),
            ));
        }

        Ok(connection.state)
    }

    async fn await_channel(
        &self,
        chain: &C,
        end: &PathEnd,
        other: &PathEnd,
    ) -> Result<HandshakeState> {
        let phase = Phase::ChannelHandshake;
        let waiting_for = format!(
            "channel {}/{} on {} OPEN",
            end.port_id, end.channel_id, end.chain_id
        );
        let tracker = Mutex::new(HandshakeTracker::new(
            phase,
            format!("channel {}/{} on {}", end.port_id, end.channel_id, end.chain_id),
        ));
        let tracker = &tracker;

        let channel = self
            .config
            .retry
            .poll_until(phase, &waiting_for, move || async move {
                self.relayer_alive(phase)?;
                Ok::<_, HarnessError>(match chain.query_channel(&end.port_id, &end.channel_id).await {
                    Ok(Some(channel)) => {
                        if lock(tracker).observe(channel.state)? {
                            Observation::Ready(channel)
                        } else {
                            Observation::Pending(channel.state.to_string())
                        }
                    }
                    Ok(None) => Observation::Pending("channel not found".into()),
                    Err(e) => Observation::Pending(format!("query failed: {e:#}")),
                })
            })
            .await?;

        let expected = (
            end.connection_id.as_str(),
            other.port_id.as_str(),
            Some(other.channel_id.as_str()),
            TRANSFER_VERSION,
        );
        let actual = (
            channel.connection_id.as_str(),
            channel.counterparty_port_id.as_str(),
            channel.counterparty_channel_id.as_deref(),
            channel.version.as_str(),
        );
        if expected != actual {
            return Err(HarnessError::assertion(
                phase,
                format!("{}/{} with {expected:?}", end.port_id, end.channel_id),
                format!("{actual:?}"),
            ));
        }

        Ok(channel.state)
    }

    /// Sends one transfer from chain `a` to chain `b` and follows it to a
    /// terminal state.
    async fn transfer(&self, path: &LinkedPath, timeout: PacketTimeout) -> Result<PacketOutcome> {
        let (src, dst) = (&self.chains.a, &self.chains.b);
        let (src_end, dst_end) = (&path.a, &path.b);

        let sender = src.user_wallet().clone();
        let receiver = dst.user_wallet().address.clone();
        let denom = src.config().denom.clone();
        let amount = self.config.transfer_amount;

        let voucher = self
            .query(Phase::SendPacket, "voucher denom", || {
                dst.ibc_denom(&dst_end.port_id, &dst_end.channel_id, &denom)
            })
            .await?;
        let sender_before = self
            .query(Phase::SendPacket, "sender balance", || {
                src.query_balance(&sender.address, &denom)
            })
            .await?;
        let receiver_before = self
            .query(Phase::SendPacket, "receiver balance", || {
                dst.query_balance(&receiver, &voucher)
            })
            .await?;

        let request = TransferRequest {
            port_id: src_end.port_id.clone(),
            channel_id: src_end.channel_id.clone(),
            sender: sender.clone(),
            receiver: receiver.clone(),
            amount: Coin::new(denom.clone(), amount),
            timeout,
        };
        let sent = src.send_transfer(request).await.map_err(|e| {
            HarnessError::assertion(Phase::SendPacket, "transfer accepted", format!("{e:#}"))
        })?;
        info!(sequence = sent.sequence, fee = sent.fee, ?timeout, "packet sent");
        self.passed(Phase::SendPacket);

        let sequence = sent.sequence;
        let observe = move |phase: Phase| {
            move || async move {
                self.relayer_alive(phase)?;
                let commitment = src
                    .query_packet_commitment(&src_end.port_id, &src_end.channel_id, sequence)
                    .await;
                let receipt = dst
                    .query_packet_receipt(&dst_end.port_id, &dst_end.channel_id, sequence)
                    .await;
                let deliveries = dst
                    .query_packet_deliveries(&dst_end.port_id, &dst_end.channel_id, sequence)
                    .await;
                Ok::<_, HarnessError>(match (commitment, receipt, deliveries) {
                    (Ok(commitment), Ok(receipt), Ok(deliveries)) => {
                        if deliveries > 1 {
                            return Err(HarnessError::assertion(
                                phase,
                                format!("packet {sequence} received at most once"),
                                format!("{deliveries} deliveries"),
                            ));
                        }
                        Some((PacketState::classify(commitment, receipt), deliveries))
                    }
                    _ => None,
                })
            }
        };

        let (state, deliveries) = match timeout {
            PacketTimeout::Default => {
                let observe_relay = observe(Phase::RelayPacket);
                self.config
                    .retry
                    .poll_until(Phase::RelayPacket, "packet RELAYED", || {
                        let observed = observe_relay();
                        async move {
                            Ok::<_, HarnessError>(match observed.await? {
                                Some((PacketState::TimedOut, _)) => {
                                    return Err(HarnessError::assertion(
                                        Phase::RelayPacket,
                                        format!("packet {sequence} relayed"),
                                        PacketState::TimedOut,
                                    ))
                                }
                                Some((state @ (PacketState::Relayed | PacketState::Acknowledged), _)) => {
                                    Observation::Ready(state)
                                }
                                Some((state, _)) => Observation::Pending(state.to_string()),
                                None => Observation::Pending("packet query failed".into()),
                            })
                        }
                    })
                    .await?;
                self.passed(Phase::RelayPacket);

                let observe_ack = observe(Phase::AcknowledgePacket);
                self.config
                    .retry
                    .poll_until(Phase::AcknowledgePacket, "packet ACKNOWLEDGED", || {
                        let observed = observe_ack();
                        async move {
                            Ok::<_, HarnessError>(match observed.await? {
                                Some((PacketState::Acknowledged, deliveries)) => {
                                    Observation::Ready((PacketState::Acknowledged, deliveries))
                                }
                                Some((PacketState::TimedOut, _)) => {
                                    return Err(HarnessError::assertion(
                                        Phase::AcknowledgePacket,
                                        format!("packet {sequence} acknowledged"),
                                        PacketState::TimedOut,
                                    ))
                                }
                                Some((state, _)) => Observation::Pending(state.to_string()),
                                None => Observation::Pending("packet query failed".into()),
                            })
                        }
                    })
                    .await?
            }
            PacketTimeout::Expired => {
                let observe_timeout = observe(Phase::TimeoutPacket);
                self.config
                    .retry
                    .poll_until(Phase::TimeoutPacket, "packet TIMED_OUT", || {
                        let observed = observe_timeout();
                        async move {
                            Ok::<_, HarnessError>(match observed.await? {
                                Some((PacketState::TimedOut, deliveries)) => {
                                    Observation::Ready((PacketState::TimedOut, deliveries))
                                }
                                Some((state @ (PacketState::Relayed | PacketState::Acknowledged), _)) => {
                                    return Err(HarnessError::assertion(
                                        Phase::TimeoutPacket,
                                        format!("expired packet {sequence} never received"),
                                        state,
                                    ))
                                }
                                Some((state, _)) => Observation::Pending(state.to_string()),
                                None => Observation::Pending("packet query failed".into()),
                            })
                        }
                    })
                    .await?
            }
        };

        let phase = match timeout {
            PacketTimeout::Default => Phase::AcknowledgePacket,
            PacketTimeout::Expired => Phase::TimeoutPacket,
        };

        if timeout == PacketTimeout::Default {
            let acknowledged = self
                .query(phase, "acknowledgement", || {
                    dst.query_packet_acknowledgement(&dst_end.port_id, &dst_end.channel_id, sequence)
                })
                .await?;
            if !acknowledged {
                return Err(HarnessError::assertion(
                    phase,
                    format!("acknowledgement for packet {sequence} written"),
                    "no acknowledgement",
                ));
            }
        }

        let expected_deliveries = match timeout {
            PacketTimeout::Default => 1,
            PacketTimeout::Expired => 0,
        };
        if deliveries != expected_deliveries {
            return Err(HarnessError::assertion(
                phase,
                format!("{expected_deliveries} deliveries of packet {sequence}"),
                deliveries,
            ));
        }

        let sender_after = self
            .query(phase, "sender balance", || src.query_balance(&sender.address, &denom))
            .await?;
        let receiver_after = self
            .query(phase, "receiver balance", || dst.query_balance(&receiver, &voucher))
            .await?;

        let (expected_debit, expected_credit) = match timeout {
            PacketTimeout::Default => (amount + sent.fee, amount),
            PacketTimeout::Expired => (sent.fee, 0),
        };
        let expected_sender = sender_before.checked_sub(expected_debit);
        if Some(sender_after) != expected_sender {
            return Err(HarnessError::assertion(
                phase,
                format!("sender balance {sender_before} - {expected_debit}{denom}"),
                format!("{sender_after}{denom}"),
            ));
        }
        if receiver_after != receiver_before + expected_credit {
            return Err(HarnessError::assertion(
                phase,
                format!("receiver balance {receiver_before} + {expected_credit}{voucher}"),
                format!("{receiver_after}{voucher}"),
            ));
        }

        self.passed(phase);
        info!(sequence, %state, "packet reached terminal state");

        Ok(PacketOutcome {
            sequence,
            state,
            deliveries,
            sender_debit: sender_before - sender_after,
            receiver_credit: receiver_after - receiver_before,
        })
    }

    /// Packet traffic must not have disturbed the handshake objects.
    async fn recheck_handshake(&self, path: &LinkedPath) -> Result<()> {
        for (chain, end, _) in self.sides(path) {
            let connection = self
                .query(Phase::ConnectionHandshake, "connection", || {
                    chain.query_connection(&end.connection_id)
                })
                .await?;
            let channel = self
                .query(Phase::ChannelHandshake, "channel", || {
                    chain.query_channel(&end.port_id, &end.channel_id)
                })
                .await?;

            let connection_state = connection.map(|c| c.state);
            if connection_state != Some(HandshakeState::Open) {
                return Err(HarnessError::assertion(
                    Phase::ConnectionHandshake,
                    format!("{} still OPEN", end.connection_id),
                    format!("{connection_state:?}"),
                ));
            }
            let channel_state = channel.map(|c| c.state);
            if channel_state != Some(HandshakeState::Open) {
                return Err(HarnessError::assertion(
                    Phase::ChannelHandshake,
                    format!("{} still OPEN", end.channel_id),
                    format!("{channel_state:?}"),
                ));
            }
        }
        Ok(())
    }
}
