use core::time::Duration;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bon::Builder;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chain::{
    ChainConfig, ChainEndpoint, ChainInstance, ChainProvisioner, ChainType, ChannelEnd,
    ClientState, ConnectionEnd, HandshakeState, PacketTimeout, SentPacket, TransferRequest,
    Wallet,
};
use crate::mock::{lock, MockNetwork};

/// Gas a mock transfer consumes; the fee is this times the gas price.
pub const MOCK_TRANSFER_GAS: u128 = 200_000;
const DEFAULT_TIMEOUT_WINDOW: Duration = Duration::from_secs(600);
const EVENT_BUFFER: usize = 1024;
const HISTORY_DEPTH: u64 = 10_000;

/// An ICS-20 packet as committed by the source chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u64,
    pub source_port: String,
    pub source_channel: String,
    pub destination_port: String,
    pub destination_channel: String,
    pub denom: String,
    pub amount: u128,
    pub sender: String,
    pub receiver: String,
    /// Unix nanoseconds. Zero disables the timestamp timeout.
    pub timeout_timestamp: u64,
}

impl Packet {
    pub fn is_expired_at(&self, time: u64) -> bool {
        self.timeout_timestamp != 0 && time >= self.timeout_timestamp
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    SendPacket(Packet),
    WriteAcknowledgement(Packet),
}

/// Events emitted by one committed block. Published for every block,
/// including empty ones.
#[derive(Clone, Debug)]
pub struct BlockEvents {
    pub chain_id: String,
    pub height: u64,
    pub events: Vec<ChainEvent>,
}

/// Messages a relayer submits to a mock chain.
#[derive(Clone, Debug)]
pub enum IbcMsg {
    CreateClient {
        counterparty_chain_id: String,
    },
    UpdateClient {
        client_id: String,
    },
    ConnOpenInit {
        client_id: String,
        counterparty_client_id: String,
    },
    ConnOpenTry {
        client_id: String,
        counterparty_client_id: String,
        counterparty_connection_id: String,
    },
    ConnOpenAck {
        connection_id: String,
        counterparty_connection_id: String,
    },
    ConnOpenConfirm {
        connection_id: String,
    },
    ChanOpenInit {
        port_id: String,
        connection_id: String,
        counterparty_port_id: String,
        version: String,
    },
    ChanOpenTry {
        port_id: String,
        connection_id: String,
        counterparty_port_id: String,
        counterparty_channel_id: String,
        version: String,
    },
    ChanOpenAck {
        port_id: String,
        channel_id: String,
        counterparty_channel_id: String,
    },
    ChanOpenConfirm {
        port_id: String,
        channel_id: String,
    },
    RecvPacket(Packet),
    Acknowledgement(Packet),
    Timeout(Packet),
}

type PacketKey = (String, String, u64);

fn packet_key(port_id: &str, channel_id: &str, sequence: u64) -> PacketKey {
    (port_id.to_string(), channel_id.to_string(), sequence)
}

fn escrow_address(port_id: &str, channel_id: &str) -> String {
    format!("escrow/{port_id}/{channel_id}")
}

/// Denom of vouchers minted for `base_denom` arriving over `(port, channel)`.
pub fn voucher_denom(port_id: &str, channel_id: &str, base_denom: &str) -> String {
    format!("ibc/{port_id}/{channel_id}/{base_denom}")
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[derive(Default)]
struct ChainState {
    running: bool,
    height: u64,
    /// Unix nanoseconds of the latest block.
    time: u64,
    balances: HashMap<(String, String), u128>,
    clients: BTreeMap<String, ClientState>,
    connections: BTreeMap<String, ConnectionEnd>,
    channels: BTreeMap<(String, String), ChannelEnd>,
    next_sequence: HashMap<(String, String), u64>,
    commitments: HashMap<PacketKey, Packet>,
    receipts: HashSet<PacketKey>,
    deliveries: HashMap<PacketKey, u64>,
    acknowledgements: HashSet<PacketKey>,
    pending: Vec<ChainEvent>,
    history: BTreeMap<u64, Vec<ChainEvent>>,
}

impl ChainState {
    fn credit(&mut self, address: &str, denom: &str, amount: u128) {
        *self
            .balances
            .entry((address.to_string(), denom.to_string()))
            .or_default() += amount;
    }

    fn debit(&mut self, address: &str, denom: &str, amount: u128) -> anyhow::Result<()> {
        let balance = self
            .balances
            .entry((address.to_string(), denom.to_string()))
            .or_default();
        anyhow::ensure!(
            *balance >= amount,
            "insufficient funds: {address} has {balance}{denom}, needs {amount}{denom}"
        );
        *balance -= amount;
        Ok(())
    }

    fn connection(&self, connection_id: &str) -> anyhow::Result<&ConnectionEnd> {
        self.connections
            .get(connection_id)
            .ok_or_else(|| anyhow::anyhow!("connection {connection_id} not found"))
    }

    fn channel(&self, port_id: &str, channel_id: &str) -> anyhow::Result<&ChannelEnd> {
        self.channels
            .get(&(port_id.to_string(), channel_id.to_string()))
            .ok_or_else(|| anyhow::anyhow!("channel {port_id}/{channel_id} not found"))
    }

    fn open_channel(&self, port_id: &str, channel_id: &str) -> anyhow::Result<&ChannelEnd> {
        let channel = self.channel(port_id, channel_id)?;
        anyhow::ensure!(
            channel.state == HandshakeState::Open,
            "channel {port_id}/{channel_id} is {}",
            channel.state
        );
        Ok(channel)
    }

    fn set_connection_state(
        &mut self,
        connection_id: &str,
        expected: HandshakeState,
        next: HandshakeState,
    ) -> anyhow::Result<&mut ConnectionEnd> {
        let connection = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| anyhow::anyhow!("connection {connection_id} not found"))?;
        anyhow::ensure!(
            connection.state == expected,
            "connection {connection_id} is {}, expected {expected}",
            connection.state
        );
        connection.state = next;
        Ok(connection)
    }

    fn set_channel_state(
        &mut self,
        port_id: &str,
        channel_id: &str,
        expected: HandshakeState,
        next: HandshakeState,
    ) -> anyhow::Result<&mut ChannelEnd> {
        let channel = self
            .channels
            .get_mut(&(port_id.to_string(), channel_id.to_string()))
            .ok_or_else(|| anyhow::anyhow!("channel {port_id}/{channel_id} not found"))?;
        anyhow::ensure!(
            channel.state == expected,
            "channel {port_id}/{channel_id} is {}, expected {expected}",
            channel.state
        );
        channel.state = next;
        Ok(channel)
    }
}

fn mock_wallet(config: &ChainConfig, key_name: &str) -> Wallet {
    Wallet {
        key_name: key_name.to_string(),
        address: format!("{}1{key_name}", config.bech32_prefix),
        mnemonic: format!("mock mnemonic for {key_name} on {}", config.chain_id),
    }
}

/// An in-memory IBC-capable chain producing blocks on a timer.
///
/// Messages take effect as soon as they are delivered; the events they emit
/// are published with the next block.
#[derive(Clone)]
pub struct MockChain {
    config: ChainConfig,
    user: Wallet,
    relayer: Wallet,
    allow_redelivery: bool,
    network: MockNetwork,
    state: Arc<Mutex<ChainState>>,
    events: broadcast::Sender<BlockEvents>,
    producer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MockChain {
    /// Builds genesis, registers the chain on `network` and starts producing
    /// blocks every `block_time`.
    pub fn start(
        config: ChainConfig,
        network: MockNetwork,
        block_time: Duration,
        allow_redelivery: bool,
    ) -> anyhow::Result<Self> {
        let user = mock_wallet(&config, "user");
        let relayer = mock_wallet(&config, "relayer");
        let validator = mock_wallet(&config, "validator");

        let mut state = ChainState {
            running: true,
            height: 1,
            time: now_nanos(),
            ..ChainState::default()
        };
        let genesis = config.genesis;
        state.credit(&user.address, &config.denom, genesis.wallet_share());
        state.credit(&relayer.address, &config.denom, genesis.wallet_share());
        state.credit(
            &validator.address,
            &config.denom,
            genesis.validator - genesis.self_delegation(),
        );
        state.history.insert(1, Vec::new());

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let chain = Self {
            config,
            user,
            relayer,
            allow_redelivery,
            network,
            state: Arc::new(Mutex::new(state)),
            events,
            producer: Arc::new(Mutex::new(None)),
        };

        chain.network.register(chain.clone())?;

        let producer = chain.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(block_time);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                producer.produce_block();
            }
        });
        *lock(&chain.producer) = Some(handle);

        info!(chain_id = %chain.config.chain_id, ?block_time, "mock chain started");
        Ok(chain)
    }

    /// Stops block production and leaves the network. Idempotent.
    fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if !state.running {
                return;
            }
            state.running = false;
        }
        if let Some(producer) = lock(&self.producer).take() {
            producer.abort();
        }
        self.network.remove(&self.config.chain_id);
        info!(chain_id = %self.config.chain_id, "mock chain stopped");
    }

    fn produce_block(&self) {
        let block = {
            let mut state = lock(&self.state);
            if !state.running {
                return;
            }
            state.height += 1;
            state.time = now_nanos().max(state.time + 1);
            let height = state.height;
            let events = core::mem::take(&mut state.pending);
            state.history.insert(height, events.clone());
            if height > HISTORY_DEPTH {
                state.history.remove(&(height - HISTORY_DEPTH));
            }
            BlockEvents {
                chain_id: self.config.chain_id.clone(),
                height,
                events,
            }
        };

        // No subscriber is not an error.
        let _ = self.events.send(block);
    }

    fn read<T>(&self, f: impl FnOnce(&ChainState) -> T) -> anyhow::Result<T> {
        let state = lock(&self.state);
        anyhow::ensure!(state.running, "chain {} is not running", self.config.chain_id);
        Ok(f(&state))
    }

    fn write<T>(&self, f: impl FnOnce(&mut ChainState) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let mut state = lock(&self.state);
        anyhow::ensure!(state.running, "chain {} is not running", self.config.chain_id);
        f(&mut state)
    }

    /// Receives every block committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BlockEvents> {
        self.events.subscribe()
    }

    pub fn height(&self) -> anyhow::Result<u64> {
        self.read(|state| state.height)
    }

    /// Unix nanoseconds of the latest block.
    pub fn time(&self) -> anyhow::Result<u64> {
        self.read(|state| state.time)
    }

    /// Events of the block at `height`, if it is still retained.
    pub fn block_events(&self, height: u64) -> anyhow::Result<Option<Vec<ChainEvent>>> {
        self.read(|state| state.history.get(&height).cloned())
    }

    /// Every channel end as `(port, channel, end)`.
    pub fn channels(&self) -> anyhow::Result<Vec<(String, String, ChannelEnd)>> {
        self.read(|state| {
            state
                .channels
                .iter()
                .map(|((port, channel), end)| (port.clone(), channel.clone(), end.clone()))
                .collect()
        })
    }

    pub fn has_commitment(&self, port_id: &str, channel_id: &str, sequence: u64) -> anyhow::Result<bool> {
        let key = packet_key(port_id, channel_id, sequence);
        self.read(|state| state.commitments.contains_key(&key))
    }

    pub fn has_receipt(&self, port_id: &str, channel_id: &str, sequence: u64) -> anyhow::Result<bool> {
        let key = packet_key(port_id, channel_id, sequence);
        self.read(|state| state.receipts.contains(&key))
    }

    pub fn has_acknowledgement(&self, port_id: &str, channel_id: &str, sequence: u64) -> anyhow::Result<bool> {
        let key = packet_key(port_id, channel_id, sequence);
        self.read(|state| state.acknowledgements.contains(&key))
    }

    fn client_counterparty(&self, client_id: &str) -> anyhow::Result<MockChain> {
        let chain_id = self.read(|state| state.clients.get(client_id).map(|c| c.chain_id.clone()))?;
        let chain_id = chain_id.ok_or_else(|| anyhow::anyhow!("client {client_id} not found"))?;
        self.network.chain(&chain_id)
    }

    fn connection_counterparty(&self, connection_id: &str) -> anyhow::Result<MockChain> {
        let client_id = self.read(|state| {
            state
                .connections
                .get(connection_id)
                .map(|connection| connection.client_id.clone())
        })?;
        let client_id =
            client_id.ok_or_else(|| anyhow::anyhow!("connection {connection_id} not found"))?;
        self.client_counterparty(&client_id)
    }

    fn channel_counterparty(&self, port_id: &str, channel_id: &str) -> anyhow::Result<MockChain> {
        let connection_id = self.read(|state| {
            state
                .channels
                .get(&(port_id.to_string(), channel_id.to_string()))
                .map(|channel| channel.connection_id.clone())
        })?;
        let connection_id = connection_id
            .ok_or_else(|| anyhow::anyhow!("channel {port_id}/{channel_id} not found"))?;
        self.connection_counterparty(&connection_id)
    }

    fn query_counterparty_connection(
        counterparty: &MockChain,
        connection_id: &str,
    ) -> anyhow::Result<ConnectionEnd> {
        counterparty
            .read(|state| state.connections.get(connection_id).cloned())?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "connection {connection_id} not found on {}",
                    counterparty.config.chain_id
                )
            })
    }

    fn query_counterparty_channel(
        counterparty: &MockChain,
        port_id: &str,
        channel_id: &str,
    ) -> anyhow::Result<ChannelEnd> {
        counterparty
            .read(|state| {
                state
                    .channels
                    .get(&(port_id.to_string(), channel_id.to_string()))
                    .cloned()
            })?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "channel {port_id}/{channel_id} not found on {}",
                    counterparty.config.chain_id
                )
            })
    }

    /// Applies `msg` after checking it against the counterparty's state.
    /// Returns the identifier of the object it created, if any.
    ///
    /// The counterparty is always read before this chain's state is locked,
    /// so two chains delivering to each other never hold both locks.
    pub fn deliver(&self, msg: IbcMsg) -> anyhow::Result<Option<String>> {
        debug!(chain_id = %self.config.chain_id, ?msg, "delivering message");

        match msg {
            IbcMsg::CreateClient {
                counterparty_chain_id,
            } => {
                let latest_height = self.network.chain(&counterparty_chain_id)?.height()?;
                self.write(|state| {
                    let client_id = format!("07-tendermint-{}", state.clients.len());
                    state.clients.insert(
                        client_id.clone(),
                        ClientState {
                            chain_id: counterparty_chain_id,
                            latest_height,
                            frozen: false,
                        },
                    );
                    Ok(Some(client_id))
                })
            }

            IbcMsg::UpdateClient { client_id } => {
                let latest_height = self.client_counterparty(&client_id)?.height()?;
                self.write(|state| {
                    let client = state
                        .clients
                        .get_mut(&client_id)
                        .ok_or_else(|| anyhow::anyhow!("client {client_id} not found"))?;
                    anyhow::ensure!(!client.frozen, "client {client_id} is frozen");
                    client.latest_height = client.latest_height.max(latest_height);
                    Ok(None)
                })
            }

            IbcMsg::ConnOpenInit {
                client_id,
                counterparty_client_id,
            } => self.write(|state| {
                anyhow::ensure!(
                    state.clients.contains_key(&client_id),
                    "client {client_id} not found"
                );
                let connection_id = format!("connection-{}", state.connections.len());
                state.connections.insert(
                    connection_id.clone(),
                    ConnectionEnd {
                        state: HandshakeState::Init,
                        client_id,
                        counterparty_client_id,
                        counterparty_connection_id: None,
                    },
                );
                Ok(Some(connection_id))
            }),

            IbcMsg::ConnOpenTry {
                client_id,
                counterparty_client_id,
                counterparty_connection_id,
            } => {
                let counterparty = self.client_counterparty(&client_id)?;
                let proven =
                    Self::query_counterparty_connection(&counterparty, &counterparty_connection_id)?;
                anyhow::ensure!(
                    proven.state == HandshakeState::Init
                        && proven.client_id == counterparty_client_id
                        && proven.counterparty_client_id == client_id,
                    "counterparty connection {counterparty_connection_id} does not match the try: {proven:?}"
                );

                self.write(|state| {
                    let connection_id = format!("connection-{}", state.connections.len());
                    state.connections.insert(
                        connection_id.clone(),
                        ConnectionEnd {
                            state: HandshakeState::TryOpen,
                            client_id,
                            counterparty_client_id,
                            counterparty_connection_id: Some(counterparty_connection_id),
                        },
                    );
                    Ok(Some(connection_id))
                })
            }

            IbcMsg::ConnOpenAck {
                connection_id,
                counterparty_connection_id,
            } => {
                let counterparty = self.connection_counterparty(&connection_id)?;
                let proven =
                    Self::query_counterparty_connection(&counterparty, &counterparty_connection_id)?;
                anyhow::ensure!(
                    proven.state == HandshakeState::TryOpen
                        && proven.counterparty_connection_id.as_deref() == Some(connection_id.as_str()),
                    "counterparty connection {counterparty_connection_id} does not match the ack: {proven:?}"
                );

                self.write(|state| {
                    let connection = state.set_connection_state(
                        &connection_id,
                        HandshakeState::Init,
                        HandshakeState::Open,
                    )?;
                    connection.counterparty_connection_id = Some(counterparty_connection_id);
                    Ok(None)
                })
            }

            IbcMsg::ConnOpenConfirm { connection_id } => {
                let counterparty = self.connection_counterparty(&connection_id)?;
                let counterparty_connection_id = self
                    .read(|state| {
                        state
                            .connection(&connection_id)
                            .map(|c| c.counterparty_connection_id.clone())
                    })??
                    .ok_or_else(|| {
                        anyhow::anyhow!("connection {connection_id} has no counterparty")
                    })?;
                let proven =
                    Self::query_counterparty_connection(&counterparty, &counterparty_connection_id)?;
                anyhow::ensure!(
                    proven.state == HandshakeState::Open,
                    "counterparty connection {counterparty_connection_id} is {}",
                    proven.state
                );

                self.write(|state| {
                    state.set_connection_state(
                        &connection_id,
                        HandshakeState::TryOpen,
                        HandshakeState::Open,
                    )?;
                    Ok(None)
                })
            }

            IbcMsg::ChanOpenInit {
                port_id,
                connection_id,
                counterparty_port_id,
                version,
            } => self.write(|state| {
                let connection = state.connection(&connection_id)?;
                anyhow::ensure!(
                    connection.state == HandshakeState::Open,
                    "connection {connection_id} is {}",
                    connection.state
                );
                let channel_id = format!("channel-{}", state.channels.len());
                state.channels.insert(
                    (port_id, channel_id.clone()),
                    ChannelEnd {
                        state: HandshakeState::Init,
                        connection_id,
                        counterparty_port_id,
                        counterparty_channel_id: None,
                        version,
                    },
                );
                Ok(Some(channel_id))
            }),

            IbcMsg::ChanOpenTry {
                port_id,
                connection_id,
                counterparty_port_id,
                counterparty_channel_id,
                version,
            } => {
                let counterparty = self.connection_counterparty(&connection_id)?;
                let proven = Self::query_counterparty_channel(
                    &counterparty,
                    &counterparty_port_id,
                    &counterparty_channel_id,
                )?;
                anyhow::ensure!(
                    proven.state == HandshakeState::Init
                        && proven.counterparty_port_id == port_id
                        && proven.version == version,
                    "counterparty channel {counterparty_channel_id} does not match the try: {proven:?}"
                );

                self.write(|state| {
                    let connection = state.connection(&connection_id)?;
                    anyhow::ensure!(
                        connection.state == HandshakeState::Open,
                        "connection {connection_id} is {}",
                        connection.state
                    );
                    let channel_id = format!("channel-{}", state.channels.len());
                    state.channels.insert(
                        (port_id, channel_id.clone()),
                        ChannelEnd {
                            state: HandshakeState::TryOpen,
                            connection_id,
                            counterparty_port_id,
                            counterparty_channel_id: Some(counterparty_channel_id),
                            version,
                        },
                    );
                    Ok(Some(channel_id))
                })
            }

            IbcMsg::ChanOpenAck {
                port_id,
                channel_id,
                counterparty_channel_id,
            } => {
                let counterparty = self.channel_counterparty(&port_id, &channel_id)?;
                let counterparty_port_id = self
                    .read(|state| {
                        state
                            .channel(&port_id, &channel_id)
                            .map(|c| c.counterparty_port_id.clone())
                    })??;
                let proven = Self::query_counterparty_channel(
                    &counterparty,
                    &counterparty_port_id,
                    &counterparty_channel_id,
                )?;
                anyhow::ensure!(
                    proven.state == HandshakeState::TryOpen
                        && proven.counterparty_channel_id.as_deref() == Some(channel_id.as_str()),
                    "counterparty channel {counterparty_channel_id} does not match the ack: {proven:?}"
                );

                self.write(|state| {
                    let channel = state.set_channel_state(
                        &port_id,
                        &channel_id,
                        HandshakeState::Init,
                        HandshakeState::Open,
                    )?;
                    channel.counterparty_channel_id = Some(counterparty_channel_id);
                    Ok(None)
                })
            }

            IbcMsg::ChanOpenConfirm {
                port_id,
                channel_id,
            } => {
                let counterparty = self.channel_counterparty(&port_id, &channel_id)?;
                let (counterparty_port_id, counterparty_channel_id) = self
                    .read(|state| {
                        state.channel(&port_id, &channel_id).map(|c| {
                            (c.counterparty_port_id.clone(), c.counterparty_channel_id.clone())
                        })
                    })??;
                let counterparty_channel_id = counterparty_channel_id.ok_or_else(|| {
                    anyhow::anyhow!("channel {port_id}/{channel_id} has no counterparty")
                })?;
                let proven = Self::query_counterparty_channel(
                    &counterparty,
                    &counterparty_port_id,
                    &counterparty_channel_id,
                )?;
                anyhow::ensure!(
                    proven.state == HandshakeState::Open,
                    "counterparty channel {counterparty_channel_id} is {}",
                    proven.state
                );

                self.write(|state| {
                    state.set_channel_state(
                        &port_id,
                        &channel_id,
                        HandshakeState::TryOpen,
                        HandshakeState::Open,
                    )?;
                    Ok(None)
                })
            }

            IbcMsg::RecvPacket(packet) => self.receive_packet(packet),
            IbcMsg::Acknowledgement(packet) => self.acknowledge_packet(packet),
            IbcMsg::Timeout(packet) => self.timeout_packet(packet),
        }
    }

    fn receive_packet(&self, packet: Packet) -> anyhow::Result<Option<String>> {
        let counterparty =
            self.channel_counterparty(&packet.destination_port, &packet.destination_channel)?;
        anyhow::ensure!(
            counterparty.has_commitment(&packet.source_port, &packet.source_channel, packet.sequence)?,
            "no commitment for packet {} on {}",
            packet.sequence,
            counterparty.config.chain_id
        );

        let allow_redelivery = self.allow_redelivery;
        self.write(|state| {
            let channel = state.open_channel(&packet.destination_port, &packet.destination_channel)?;
            anyhow::ensure!(
                channel.counterparty_channel_id.as_deref() == Some(packet.source_channel.as_str())
                    && channel.counterparty_port_id == packet.source_port,
                "packet source {}/{} is not the channel counterparty",
                packet.source_port,
                packet.source_channel
            );
            anyhow::ensure!(
                !packet.is_expired_at(state.time),
                "packet {} timeout elapsed",
                packet.sequence
            );

            let key = packet_key(&packet.destination_port, &packet.destination_channel, packet.sequence);
            anyhow::ensure!(
                allow_redelivery || !state.receipts.contains(&key),
                "packet {} already received",
                packet.sequence
            );

            state.receipts.insert(key.clone());
            *state.deliveries.entry(key.clone()).or_default() += 1;
            state.acknowledgements.insert(key);

            let denom = voucher_denom(&packet.destination_port, &packet.destination_channel, &packet.denom);
            state.credit(&packet.receiver, &denom, packet.amount);
            state.pending.push(ChainEvent::WriteAcknowledgement(packet));
            Ok(None)
        })
    }

    fn acknowledge_packet(&self, packet: Packet) -> anyhow::Result<Option<String>> {
        let counterparty = self.channel_counterparty(&packet.source_port, &packet.source_channel)?;
        anyhow::ensure!(
            counterparty.has_acknowledgement(
                &packet.destination_port,
                &packet.destination_channel,
                packet.sequence
            )?,
            "no acknowledgement for packet {} on {}",
            packet.sequence,
            counterparty.config.chain_id
        );

        self.write(|state| {
            let key = packet_key(&packet.source_port, &packet.source_channel, packet.sequence);
            anyhow::ensure!(
                state.commitments.remove(&key).is_some(),
                "packet {} has no commitment",
                packet.sequence
            );
            Ok(None)
        })
    }

    fn timeout_packet(&self, packet: Packet) -> anyhow::Result<Option<String>> {
        let counterparty = self.channel_counterparty(&packet.source_port, &packet.source_channel)?;
        anyhow::ensure!(
            !counterparty.has_receipt(
                &packet.destination_port,
                &packet.destination_channel,
                packet.sequence
            )?,
            "packet {} was received on {}",
            packet.sequence,
            counterparty.config.chain_id
        );
        anyhow::ensure!(
            packet.is_expired_at(counterparty.time()?),
            "packet {} has not timed out on {}",
            packet.sequence,
            counterparty.config.chain_id
        );

        self.write(|state| {
            let key = packet_key(&packet.source_port, &packet.source_channel, packet.sequence);
            anyhow::ensure!(
                state.commitments.remove(&key).is_some(),
                "packet {} has no commitment",
                packet.sequence
            );
            let escrow = escrow_address(&packet.source_port, &packet.source_channel);
            state.debit(&escrow, &packet.denom, packet.amount)?;
            state.credit(&packet.sender, &packet.denom, packet.amount);
            Ok(None)
        })
    }

    /// Fee charged for a transfer, and the denom it is charged in.
    pub fn transfer_fee(&self) -> anyhow::Result<(u128, String)> {
        let (price, denom) = self.config.parsed_gas_price()?;
        let fee = (price * MOCK_TRANSFER_GAS as f64).ceil() as u128;
        Ok((fee, denom))
    }
}

impl ChainInstance for MockChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn endpoint(&self) -> ChainEndpoint {
        ChainEndpoint {
            chain_id: self.config.chain_id.clone(),
            chain_type: ChainType::Cosmos,
            rpc_address: format!("mock://{}", self.config.chain_id),
            grpc_address: format!("mock://{}", self.config.chain_id),
            bech32_prefix: self.config.bech32_prefix.clone(),
            denom: self.config.denom.clone(),
            gas_prices: self.config.gas_prices.clone(),
            gas_adjustment: self.config.gas_adjustment,
            trusting_period: self.config.trusting_period,
            relayer_wallet: self.relayer.clone(),
            network: None,
        }
    }

    fn user_wallet(&self) -> &Wallet {
        &self.user
    }

    async fn latest_height(&self) -> anyhow::Result<u64> {
        self.height()
    }

    async fn query_client(&self, client_id: &str) -> anyhow::Result<Option<ClientState>> {
        self.read(|state| state.clients.get(client_id).cloned())
    }

    async fn query_connection(&self, connection_id: &str) -> anyhow::Result<Option<ConnectionEnd>> {
        self.read(|state| state.connections.get(connection_id).cloned())
    }

    async fn query_channel(&self, port_id: &str, channel_id: &str) -> anyhow::Result<Option<ChannelEnd>> {
        self.read(|state| {
            state
                .channels
                .get(&(port_id.to_string(), channel_id.to_string()))
                .cloned()
        })
    }

    async fn query_packet_commitment(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> anyhow::Result<bool> {
        self.has_commitment(port_id, channel_id, sequence)
    }

    async fn query_packet_receipt(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> anyhow::Result<bool> {
        self.has_receipt(port_id, channel_id, sequence)
    }

    async fn query_packet_acknowledgement(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> anyhow::Result<bool> {
        self.has_acknowledgement(port_id, channel_id, sequence)
    }

    async fn query_packet_deliveries(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> anyhow::Result<u64> {
        let key = packet_key(port_id, channel_id, sequence);
        self.read(|state| state.deliveries.get(&key).copied().unwrap_or_default())
    }

    async fn query_balance(&self, address: &str, denom: &str) -> anyhow::Result<u128> {
        self.read(|state| {
            state
                .balances
                .get(&(address.to_string(), denom.to_string()))
                .copied()
                .unwrap_or_default()
        })
    }

    async fn ibc_denom(&self, port_id: &str, channel_id: &str, base_denom: &str) -> anyhow::Result<String> {
        Ok(voucher_denom(port_id, channel_id, base_denom))
    }

    async fn send_transfer(&self, request: TransferRequest) -> anyhow::Result<SentPacket> {
        let (fee, fee_denom) = self.transfer_fee()?;

        self.write(|state| {
            let channel = state.open_channel(&request.port_id, &request.channel_id)?;
            let destination_channel = channel
                .counterparty_channel_id
                .clone()
                .ok_or_else(|| anyhow::anyhow!("channel {} has no counterparty", request.channel_id))?;
            let destination_port = channel.counterparty_port_id.clone();

            let sender = &request.sender.address;
            let denom = &request.amount.denom;
            let total = if fee_denom == *denom {
                request.amount.amount + fee
            } else {
                state.debit(sender, &fee_denom, fee)?;
                request.amount.amount
            };
            state.debit(sender, denom, total)?;
            state.credit(
                &escrow_address(&request.port_id, &request.channel_id),
                denom,
                request.amount.amount,
            );

            let next = state
                .next_sequence
                .entry((request.port_id.clone(), request.channel_id.clone()))
                .or_insert(1);
            let sequence = *next;
            *next += 1;

            let timeout_timestamp = match request.timeout {
                PacketTimeout::Default => state.time + DEFAULT_TIMEOUT_WINDOW.as_nanos() as u64,
                PacketTimeout::Expired => 1,
            };

            let packet = Packet {
                sequence,
                source_port: request.port_id.clone(),
                source_channel: request.channel_id.clone(),
                destination_port,
                destination_channel,
                denom: denom.clone(),
                amount: request.amount.amount,
                sender: sender.clone(),
                receiver: request.receiver.clone(),
                timeout_timestamp,
            };
            state.commitments.insert(
                packet_key(&request.port_id, &request.channel_id, sequence),
                packet.clone(),
            );
            state.pending.push(ChainEvent::SendPacket(packet));

            Ok(SentPacket {
                sequence,
                fee: if fee_denom == *denom { fee } else { 0 },
            })
        })
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        self.stop();
        Ok(())
    }

    fn abandon(&mut self) {
        self.stop();
    }

    fn is_running(&self) -> bool {
        lock(&self.state).running
    }
}

/// Provisions [`MockChain`]s on a shared [`MockNetwork`].
#[derive(Builder, Clone)]
pub struct MockProvisioner {
    #[builder(default)]
    network: MockNetwork,
    #[builder(default = Duration::from_millis(50))]
    block_time: Duration,
    /// Lets chains accept the same packet more than once.
    #[builder(default)]
    allow_redelivery: bool,
    /// Chain ids whose provisioning fails.
    #[builder(default)]
    failing_chains: Vec<String>,
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MockProvisioner {
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }
}

impl ChainProvisioner for MockProvisioner {
    type Chain = MockChain;

    async fn provision(&self, config: ChainConfig, run_id: &str) -> anyhow::Result<MockChain> {
        debug!(run_id, chain_id = %config.chain_id, "provisioning mock chain");

        if self.failing_chains.contains(&config.chain_id) {
            // Lets the other chain of the pair come up first.
            tokio::time::sleep(self.block_time).await;
            anyhow::bail!("genesis construction failed for {}", config.chain_id);
        }

        MockChain::start(
            config,
            self.network.clone(),
            self.block_time,
            self.allow_redelivery,
        )
    }
}
