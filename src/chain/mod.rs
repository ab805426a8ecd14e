use core::fmt;
use core::future::Future;
use core::time::Duration;

use anyhow::Context;
use bon::Builder;
use serde::{Deserialize, Serialize};

pub mod cosmos;
pub mod registry;
pub mod resolver;

pub use resolver::{resolve_chain_pair, ChainPair};

pub const TRANSFER_PORT: &str = "transfer";
pub const TRANSFER_VERSION: &str = "ics20-1";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    #[default]
    Cosmos,
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainType::Cosmos => f.write_str("cosmos"),
        }
    }
}

/// A container image reference plus the user it runs as.
#[derive(Builder, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DockerImage {
    #[builder(into)]
    pub repository: String,
    #[builder(into, default = "latest".to_string())]
    pub version: String,
    #[builder(into, default = "1025:1025".to_string())]
    pub uid_gid: String,
}

impl fmt::Display for DockerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.version)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Coin {
    pub denom: String,
    pub amount: u128,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: u128) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

/// Genesis balances: what the faucet account and the validator start with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GenesisAmounts {
    pub faucet: u128,
    pub validator: u128,
}

impl GenesisAmounts {
    pub const DEFAULT: GenesisAmounts = GenesisAmounts {
        faucet: 10_000_000_000_000,
        validator: 5_000_000_000_000,
    };

    pub fn coins(&self, denom: &str) -> (Coin, Coin) {
        (Coin::new(denom, self.faucet), Coin::new(denom, self.validator))
    }

    /// Balance given to each of the user and relayer wallets, carved out of
    /// the faucet amount.
    pub fn wallet_share(&self) -> u128 {
        self.faucet / 10
    }

    /// Self-delegation of the genesis validator.
    pub fn self_delegation(&self) -> u128 {
        self.validator / 2
    }
}

impl Default for GenesisAmounts {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Declarative description of one chain. Fields left unset are filled in
/// from the built-in registry when the spec is resolved.
#[derive(Builder, Clone, Debug)]
pub struct ChainSpec {
    #[builder(into)]
    pub name: String,
    #[builder(into, default = "latest".to_string())]
    pub version: String,
    pub chain_type: Option<ChainType>,
    #[builder(into)]
    pub chain_id: Option<String>,
    pub image: Option<DockerImage>,
    #[builder(into)]
    pub bin: Option<String>,
    #[builder(into)]
    pub bech32_prefix: Option<String>,
    #[builder(into)]
    pub denom: Option<String>,
    #[builder(into)]
    pub gas_prices: Option<String>,
    pub gas_adjustment: Option<f64>,
    pub trusting_period: Option<Duration>,
    #[builder(default = 1)]
    pub num_validators: usize,
    #[builder(default = 0)]
    pub num_full_nodes: usize,
    pub genesis_amounts: Option<GenesisAmounts>,
}

/// A [`ChainSpec`] with every field decided. Immutable from here on.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChainConfig {
    pub name: String,
    pub version: String,
    pub chain_type: ChainType,
    pub chain_id: String,
    pub image: DockerImage,
    pub bin: String,
    pub bech32_prefix: String,
    pub denom: String,
    pub gas_prices: String,
    pub gas_adjustment: f64,
    pub trusting_period: Duration,
    pub num_validators: usize,
    pub num_full_nodes: usize,
    pub genesis: GenesisAmounts,
}

impl ChainSpec {
    /// Merges the spec with the registry entry for `name`. `index` is the
    /// position of the chain in its pair and only picks the default chain id.
    pub fn resolve(&self, index: usize) -> anyhow::Result<ChainConfig> {
        let defaults = registry::lookup(&self.name);

        let field = |value: &Option<String>, default: Option<&str>, what: &str| {
            value
                .clone()
                .or_else(|| default.map(str::to_string))
                .with_context(|| {
                    format!("chain {} has no {what} and no registry default", self.name)
                })
        };

        let bin = field(&self.bin, defaults.map(|d| d.bin), "binary")?;
        let bech32_prefix = field(
            &self.bech32_prefix,
            defaults.map(|d| d.bech32_prefix),
            "bech32 prefix",
        )?;
        let denom = field(&self.denom, defaults.map(|d| d.denom), "denom")?;
        let gas_prices = field(
            &self.gas_prices,
            defaults.map(|d| d.gas_prices),
            "gas prices",
        )?;

        let image = match &self.image {
            Some(image) => image.clone(),
            None => {
                let repository = defaults.map(|d| d.image_repository).with_context(|| {
                    format!("chain {} has no image and no registry default", self.name)
                })?;
                DockerImage::builder()
                    .repository(repository)
                    .version(self.version.clone())
                    .build()
            }
        };

        anyhow::ensure!(
            self.num_validators >= 1,
            "chain {} needs at least one validator",
            self.name
        );

        Ok(ChainConfig {
            name: self.name.clone(),
            version: self.version.clone(),
            chain_type: self.chain_type.unwrap_or_default(),
            chain_id: self
                .chain_id
                .clone()
                .unwrap_or_else(|| format!("{}-{}", self.name, index + 1)),
            image,
            bin,
            bech32_prefix,
            denom,
            gas_prices,
            gas_adjustment: self
                .gas_adjustment
                .or(defaults.map(|d| d.gas_adjustment))
                .unwrap_or(1.3),
            trusting_period: self
                .trusting_period
                .or(defaults.map(|d| d.trusting_period))
                .unwrap_or(registry::DEFAULT_TRUSTING_PERIOD),
            num_validators: self.num_validators,
            num_full_nodes: self.num_full_nodes,
            genesis: self
                .genesis_amounts
                .or(defaults.map(|d| d.genesis))
                .unwrap_or_default(),
        })
    }
}

impl ChainConfig {
    /// Gas price as (amount per unit, denom), e.g. `0.0025uosmo`.
    pub fn parsed_gas_price(&self) -> anyhow::Result<(f64, String)> {
        parse_gas_price(&self.gas_prices)
    }
}

pub fn parse_gas_price(gas_prices: &str) -> anyhow::Result<(f64, String)> {
    let split = gas_prices
        .find(|c: char| c.is_ascii_alphabetic())
        .with_context(|| format!("gas price {gas_prices:?} has no denom"))?;
    let (amount, denom) = gas_prices.split_at(split);
    let amount = amount
        .parse::<f64>()
        .with_context(|| format!("gas price {gas_prices:?} has invalid amount"))?;
    Ok((amount, denom.to_string()))
}

/// Formats a duration the way Go's `time.Duration` prints it, e.g. `168h0m0s`.
pub fn format_go_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Wallet {
    pub key_name: String,
    pub address: String,
    pub mnemonic: String,
}

/// How a relayer reaches a chain. Enough to build the relayer's own chain
/// client configuration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChainEndpoint {
    pub chain_id: String,
    pub chain_type: ChainType,
    pub rpc_address: String,
    pub grpc_address: String,
    pub bech32_prefix: String,
    pub denom: String,
    pub gas_prices: String,
    pub gas_adjustment: f64,
    pub trusting_period: Duration,
    pub relayer_wallet: Wallet,
    /// Docker network the chain's nodes are attached to, if any.
    pub network: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeState {
    Uninitialized,
    Init,
    TryOpen,
    Open,
    Closed,
}

impl HandshakeState {
    /// Position in the INIT → TRY_OPEN → OPEN progression.
    pub fn rank(&self) -> u8 {
        match self {
            HandshakeState::Uninitialized => 0,
            HandshakeState::Init => 1,
            HandshakeState::TryOpen => 2,
            HandshakeState::Open => 3,
            HandshakeState::Closed => 4,
        }
    }

    /// Parses the `STATE_*` strings printed by Cosmos SDK queries.
    pub fn from_sdk(state: &str) -> anyhow::Result<Self> {
        match state {
            "STATE_UNINITIALIZED_UNSPECIFIED" => Ok(HandshakeState::Uninitialized),
            "STATE_INIT" => Ok(HandshakeState::Init),
            "STATE_TRYOPEN" => Ok(HandshakeState::TryOpen),
            "STATE_OPEN" => Ok(HandshakeState::Open),
            "STATE_CLOSED" => Ok(HandshakeState::Closed),
            other => anyhow::bail!("unknown handshake state {other}"),
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Uninitialized => "UNINITIALIZED",
            HandshakeState::Init => "INIT",
            HandshakeState::TryOpen => "TRY_OPEN",
            HandshakeState::Open => "OPEN",
            HandshakeState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientState {
    /// Chain the client tracks.
    pub chain_id: String,
    pub latest_height: u64,
    pub frozen: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionEnd {
    pub state: HandshakeState,
    pub client_id: String,
    pub counterparty_client_id: String,
    pub counterparty_connection_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEnd {
    pub state: HandshakeState,
    pub connection_id: String,
    pub counterparty_port_id: String,
    pub counterparty_channel_id: Option<String>,
    pub version: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacketTimeout {
    /// The chain's default timeout window.
    #[default]
    Default,
    /// A deadline that has already passed when the packet is committed.
    Expired,
}

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub port_id: String,
    pub channel_id: String,
    pub sender: Wallet,
    pub receiver: String,
    pub amount: Coin,
    pub timeout: PacketTimeout,
}

/// A packet the source chain committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentPacket {
    pub sequence: u64,
    /// Transaction fee paid by the sender, in the transferred denom.
    pub fee: u128,
}

/// The query and transaction surface of one running chain.
pub trait ChainInstance: Send + Sync + 'static {
    fn config(&self) -> &ChainConfig;

    fn chain_id(&self) -> &str {
        &self.config().chain_id
    }

    fn endpoint(&self) -> ChainEndpoint;

    /// Funded wallet the driver sends packets from.
    fn user_wallet(&self) -> &Wallet;

    fn latest_height(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    fn health_check(&self) -> impl Future<Output = anyhow::Result<()>> + Send {
        async {
            let height = self.latest_height().await?;
            anyhow::ensure!(height > 0, "chain {} has not produced a block", self.chain_id());
            Ok(())
        }
    }

    fn query_client(
        &self,
        client_id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<ClientState>>> + Send;

    fn query_connection(
        &self,
        connection_id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<ConnectionEnd>>> + Send;

    fn query_channel(
        &self,
        port_id: &str,
        channel_id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<ChannelEnd>>> + Send;

    fn query_packet_commitment(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;

    fn query_packet_receipt(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;

    fn query_packet_acknowledgement(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// How many times a packet was successfully received on this chain.
    fn query_packet_deliveries(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> impl Future<Output = anyhow::Result<u64>> + Send;

    fn query_balance(
        &self,
        address: &str,
        denom: &str,
    ) -> impl Future<Output = anyhow::Result<u128>> + Send;

    /// Denom under which tokens arriving over `(port_id, channel_id)` are held.
    fn ibc_denom(
        &self,
        port_id: &str,
        channel_id: &str,
        base_denom: &str,
    ) -> impl Future<Output = anyhow::Result<String>> + Send;

    fn send_transfer(
        &self,
        request: TransferRequest,
    ) -> impl Future<Output = anyhow::Result<SentPacket>> + Send;

    /// Stops every node of the chain and releases its resources. Idempotent.
    fn teardown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Releases the chain without waiting for it, for drop paths that cannot
    /// await [`ChainInstance::teardown`]. A no-op once the chain is released.
    fn abandon(&mut self);

    /// True until [`ChainInstance::teardown`] completed.
    fn is_running(&self) -> bool;
}

/// Turns a resolved [`ChainConfig`] into a running chain.
pub trait ChainProvisioner: Send + Sync {
    type Chain: ChainInstance;

    /// `run_id` namespaces every resource the chain allocates.
    fn provision(
        &self,
        config: ChainConfig,
        run_id: &str,
    ) -> impl Future<Output = anyhow::Result<Self::Chain>> + Send;
}
