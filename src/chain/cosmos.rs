//! Cosmos SDK chains running as docker containers.

use core::time::Duration;
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chain::{
    format_go_duration, ChainConfig, ChainEndpoint, ChainInstance, ChainProvisioner, ChannelEnd,
    ClientState, ConnectionEnd, HandshakeState, PacketTimeout, SentPacket, TransferRequest,
    Wallet,
};
use crate::container::{ContainerRuntime, ContainerSpec, ExecOutput, ImageCache, ImageSource};
use crate::error::Phase;
use crate::retry::{Observation, RetryPolicy};

pub const RPC_PORT: u16 = 26657;
pub const GRPC_PORT: u16 = 9090;
const CHAIN_HOME: &str = "/home/heighliner/chain";
const LOCAL_NODE: &str = "tcp://127.0.0.1:26657";
/// Gas limit of a transfer; fees are this times the gas price.
const TRANSFER_GAS: u128 = 200_000;
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Provisions single-validator chains, one container per chain, on a docker
/// network shared by the run.
pub struct CosmosDockerProvisioner<R> {
    runtime: Arc<R>,
    images: ImageCache,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl<R: ContainerRuntime> CosmosDockerProvisioner<R> {
    /// `retry` bounds the wait for submitted transactions to be included.
    pub fn new(runtime: Arc<R>, images: ImageCache, retry: RetryPolicy) -> Self {
        Self {
            runtime,
            images,
            retry,
            http: reqwest::Client::new(),
        }
    }

    /// Removes what a failed provisioning attempt left behind.
    async fn discard(&self, container: Option<&str>, network: &str) {
        if let Some(container) = container {
            if let Err(e) = self.runtime.remove(container).await {
                warn!(%container, error = %e, "failed to remove chain container");
            }
        }
        // The other chain of the run may still be attached.
        if let Err(e) = self.runtime.remove_network(network).await {
            debug!(%network, error = %e, "network not removed");
        }
    }
}

impl<R: ContainerRuntime> ChainProvisioner for CosmosDockerProvisioner<R> {
    type Chain = CosmosChain<R>;

    async fn provision(&self, config: ChainConfig, run_id: &str) -> anyhow::Result<CosmosChain<R>> {
        anyhow::ensure!(
            config.num_validators == 1 && config.num_full_nodes == 0,
            "docker chains run one validator and no full nodes, {} asks for {} validators and {} full nodes",
            config.chain_id,
            config.num_validators,
            config.num_full_nodes
        );

        self.images
            .ensure(self.runtime.as_ref(), &ImageSource::Pull(config.image.clone()))
            .await?;

        let network = format!("conformance-{run_id}");
        self.runtime.ensure_network(&network).await?;

        let container = format!("{}-val-0-{run_id}", config.chain_id);
        let spec = ContainerSpec::builder()
            .image(config.image.clone())
            .name(container.clone())
            .entrypoint("sleep")
            .command(vec!["infinity".to_string()])
            .network(network.clone())
            .publish(vec![RPC_PORT, GRPC_PORT])
            .build();
        if let Err(e) = self.runtime.spawn(&spec).await {
            self.discard(None, &network).await;
            return Err(e.context(format!("starting {}", config.chain_id)));
        }

        let node = Node {
            runtime: self.runtime.clone(),
            container,
            bin: config.bin.clone(),
        };

        let started = async {
            let wallets = bootstrap(&node, &config).await?;
            let rpc = self.runtime.host_port(&node.container, RPC_PORT).await?;
            anyhow::Ok((wallets, rpc))
        }
        .await;

        let (wallets, rpc) = match started {
            Ok(started) => started,
            Err(e) => {
                self.discard(Some(node.container.as_str()), &network).await;
                return Err(e.context(format!("bootstrapping {}", config.chain_id)));
            }
        };
        info!(chain_id = %config.chain_id, %rpc, "chain started");

        Ok(CosmosChain {
            config,
            node,
            network,
            rpc_url: format!("http://{rpc}"),
            http: self.http.clone(),
            retry: self.retry.clone(),
            user: wallets.user,
            relayer: wallets.relayer,
            running: true,
        })
    }
}

/// The validator container of a chain.
struct Node<R> {
    runtime: Arc<R>,
    container: String,
    bin: String,
}

impl<R: ContainerRuntime> Node<R> {
    async fn exec(&self, args: &[&str]) -> anyhow::Result<ExecOutput> {
        let mut command = vec![self.bin.clone()];
        command.extend(args.iter().map(|arg| arg.to_string()));
        self.runtime.exec(&self.container, &command, None).await
    }

    async fn exec_raw(&self, command: &[&str]) -> anyhow::Result<ExecOutput> {
        let command: Vec<String> = command.iter().map(|arg| arg.to_string()).collect();
        self.runtime.exec(&self.container, &command, None).await
    }

    /// Runs a genesis subcommand, falling back to the pre-0.47 top-level form.
    async fn genesis(&self, args: &[&str]) -> anyhow::Result<ExecOutput> {
        let mut nested = vec!["genesis"];
        nested.extend_from_slice(args);
        match self.exec(&nested).await {
            Ok(output) => Ok(output),
            Err(e) => {
                debug!(error = %e, "genesis subcommand unavailable, using legacy form");
                self.exec(args).await
            }
        }
    }

    /// Runs a query against the local node. `Ok(None)` if the object does not
    /// exist.
    async fn query(&self, args: &[&str]) -> anyhow::Result<Option<Value>> {
        let mut full = vec!["query"];
        full.extend_from_slice(args);
        full.extend_from_slice(&["--node", LOCAL_NODE, "--output", "json"]);

        match self.exec(&full).await {
            Ok(output) => {
                let value = serde_json::from_str(output.stdout.trim())
                    .with_context(|| format!("unexpected query output {:?}", output.stdout))?;
                Ok(Some(value))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    let message = format!("{e:#}");
    message.contains("not found") || message.contains("NotFound")
}

struct GenesisWallets {
    user: Wallet,
    relayer: Wallet,
}

async fn add_key<R: ContainerRuntime>(node: &Node<R>, name: &str) -> anyhow::Result<Wallet> {
    let output = node
        .exec(&[
            "keys",
            "add",
            name,
            "--keyring-backend",
            "test",
            "--output",
            "json",
            "--home",
            CHAIN_HOME,
        ])
        .await?;

    // Older SDKs print the new key to stderr.
    let raw = if output.stdout.trim().is_empty() {
        &output.stderr
    } else {
        &output.stdout
    };
    let key: Value = serde_json::from_str(raw.trim()).context("unexpected `keys add` output")?;

    Ok(Wallet {
        key_name: name.to_string(),
        address: json_str(&key, &["address"])?,
        mnemonic: json_str(&key, &["mnemonic"])?,
    })
}

/// Builds genesis with a validator and funded user and relayer accounts, then
/// starts the node.
async fn bootstrap<R: ContainerRuntime>(
    node: &Node<R>,
    config: &ChainConfig,
) -> anyhow::Result<GenesisWallets> {
    let chain_id = config.chain_id.as_str();
    let denom = config.denom.as_str();
    let moniker = format!("{chain_id}-val-0");

    node.exec(&["init", &moniker, "--chain-id", chain_id, "--home", CHAIN_HOME])
        .await?;

    let validator = add_key(node, "validator").await?;
    let user = add_key(node, "user").await?;
    let relayer = add_key(node, "relayer").await?;

    let (_, validator_coins) = config.genesis.coins(denom);
    let share = format!("{}{denom}", config.genesis.wallet_share());
    for (address, coins) in [
        (validator.address.as_str(), validator_coins.to_string()),
        (user.address.as_str(), share.clone()),
        (relayer.address.as_str(), share),
    ] {
        node.genesis(&["add-genesis-account", address, &coins, "--home", CHAIN_HOME])
            .await?;
    }

    let genesis_file = format!("{CHAIN_HOME}/config/genesis.json");
    let config_file = format!("{CHAIN_HOME}/config/config.toml");
    let app_file = format!("{CHAIN_HOME}/config/app.toml");

    node.exec_raw(&["sed", "-i", &format!("s/\"stake\"/\"{denom}\"/g"), &genesis_file])
        .await?;

    let delegation = format!("{}{denom}", config.genesis.self_delegation());
    node.genesis(&[
        "gentx",
        "validator",
        &delegation,
        "--chain-id",
        chain_id,
        "--keyring-backend",
        "test",
        "--home",
        CHAIN_HOME,
    ])
    .await?;
    node.genesis(&["collect-gentxs", "--home", CHAIN_HOME]).await?;

    for (expression, file) in [
        ("s#tcp://127.0.0.1:26657#tcp://0.0.0.0:26657#".to_string(), &config_file),
        ("s/timeout_commit = \"5s\"/timeout_commit = \"1s\"/".to_string(), &config_file),
        (
            format!("s/minimum-gas-prices = \"\"/minimum-gas-prices = \"{}\"/", config.gas_prices),
            &app_file,
        ),
        ("s#localhost:9090#0.0.0.0:9090#".to_string(), &app_file),
    ] {
        node.exec_raw(&["sed", "-i", &expression, file]).await?;
    }

    let start: Vec<String> = [node.bin.as_str(), "start", "--home", CHAIN_HOME]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    node.runtime.exec_detached(&node.container, &start).await?;

    debug!(
        chain_id,
        trusting_period = %format_go_duration(config.trusting_period),
        "genesis built and node started"
    );
    Ok(GenesisWallets { user, relayer })
}

fn json_at<'v>(value: &'v Value, path: &[&str]) -> anyhow::Result<&'v Value> {
    path.iter().try_fold(value, |value, key| {
        value
            .get(key)
            .with_context(|| format!("missing field {} in {value}", path.join(".")))
    })
}

fn json_str(value: &Value, path: &[&str]) -> anyhow::Result<String> {
    json_at(value, path)?
        .as_str()
        .map(str::to_string)
        .with_context(|| format!("field {} is not a string", path.join(".")))
}

fn json_u64(value: &Value, path: &[&str]) -> anyhow::Result<u64> {
    match json_at(value, path)? {
        Value::String(s) => s.parse().with_context(|| format!("field {} is not a number", path.join("."))),
        Value::Number(n) => n
            .as_u64()
            .with_context(|| format!("field {} is not a u64", path.join("."))),
        other => anyhow::bail!("field {} has unexpected value {other}", path.join(".")),
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

pub(crate) fn parse_client_state(value: &Value) -> anyhow::Result<ClientState> {
    let state = json_at(value, &["client_state"])?;
    Ok(ClientState {
        chain_id: json_str(state, &["chain_id"])?,
        latest_height: json_u64(state, &["latest_height", "revision_height"])?,
        frozen: json_u64(state, &["frozen_height", "revision_height"]).unwrap_or_default() != 0,
    })
}

pub(crate) fn parse_connection(value: &Value) -> anyhow::Result<ConnectionEnd> {
    let connection = json_at(value, &["connection"])?;
    Ok(ConnectionEnd {
        state: HandshakeState::from_sdk(&json_str(connection, &["state"])?)?,
        client_id: json_str(connection, &["client_id"])?,
        counterparty_client_id: json_str(connection, &["counterparty", "client_id"])?,
        counterparty_connection_id: json_str(connection, &["counterparty", "connection_id"])
            .ok()
            .and_then(non_empty),
    })
}

pub(crate) fn parse_channel(value: &Value) -> anyhow::Result<ChannelEnd> {
    let channel = json_at(value, &["channel"])?;
    let connection_id = json_at(channel, &["connection_hops"])?
        .as_array()
        .and_then(|hops| hops.first())
        .and_then(Value::as_str)
        .context("channel has no connection hops")?
        .to_string();

    Ok(ChannelEnd {
        state: HandshakeState::from_sdk(&json_str(channel, &["state"])?)?,
        connection_id,
        counterparty_port_id: json_str(channel, &["counterparty", "port_id"])?,
        counterparty_channel_id: json_str(channel, &["counterparty", "channel_id"])
            .ok()
            .and_then(non_empty),
        version: json_str(channel, &["version"])?,
    })
}

/// Finds `key` of the first `event_type` event in a `query tx` result, in
/// either the flat `events` list or the per-message `logs`.
pub(crate) fn find_event_attribute(tx: &Value, event_type: &str, key: &str) -> Option<String> {
    let flat = tx.get("events").and_then(Value::as_array).into_iter().flatten();
    let logged = tx
        .get("logs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|log| log.get("events").and_then(Value::as_array))
        .flatten();

    flat.chain(logged)
        .filter(|event| event.get("type").and_then(Value::as_str) == Some(event_type))
        .filter_map(|event| event.get("attributes").and_then(Value::as_array))
        .flatten()
        .find(|attribute| attribute.get("key").and_then(Value::as_str) == Some(key))
        .and_then(|attribute| attribute.get("value").and_then(Value::as_str))
        .map(str::to_string)
}

/// A running single-validator Cosmos SDK chain.
pub struct CosmosChain<R: ContainerRuntime> {
    config: ChainConfig,
    node: Node<R>,
    network: String,
    rpc_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    user: Wallet,
    relayer: Wallet,
    running: bool,
}

impl<R: ContainerRuntime> CosmosChain<R> {
    pub fn container(&self) -> &str {
        &self.node.container
    }

    async fn await_tx(&self, hash: &str) -> anyhow::Result<Value> {
        let tx = self
            .retry
            .poll_until(Phase::SendPacket, "transaction included", move || async move {
                Ok::<_, crate::error::HarnessError>(match self.node.query(&["tx", hash]).await {
                    Ok(Some(tx)) => Observation::Ready(tx),
                    Ok(None) => Observation::Pending(format!("tx {hash} not found")),
                    Err(e) => Observation::Pending(format!("{e:#}")),
                })
            })
            .await?;
        Ok(tx)
    }
}

impl<R: ContainerRuntime> ChainInstance for CosmosChain<R> {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn endpoint(&self) -> ChainEndpoint {
        ChainEndpoint {
            chain_id: self.config.chain_id.clone(),
            chain_type: self.config.chain_type,
            rpc_address: format!("http://{}:{RPC_PORT}", self.node.container),
            grpc_address: format!("http://{}:{GRPC_PORT}", self.node.container),
            bech32_prefix: self.config.bech32_prefix.clone(),
            denom: self.config.denom.clone(),
            gas_prices: self.config.gas_prices.clone(),
            gas_adjustment: self.config.gas_adjustment,
            trusting_period: self.config.trusting_period,
            relayer_wallet: self.relayer.clone(),
            network: Some(self.network.clone()),
        }
    }

    fn user_wallet(&self) -> &Wallet {
        &self.user
    }

    async fn latest_height(&self) -> anyhow::Result<u64> {
        let status: Value = self
            .http
            .get(format!("{}/status", self.rpc_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        json_u64(&status, &["result", "sync_info", "latest_block_height"])
    }

    async fn query_client(&self, client_id: &str) -> anyhow::Result<Option<ClientState>> {
        self.node
            .query(&["ibc", "client", "state", client_id])
            .await?
            .map(|value| parse_client_state(&value))
            .transpose()
    }

    async fn query_connection(&self, connection_id: &str) -> anyhow::Result<Option<ConnectionEnd>> {
        self.node
            .query(&["ibc", "connection", "end", connection_id])
            .await?
            .map(|value| parse_connection(&value))
            .transpose()
    }

    async fn query_channel(&self, port_id: &str, channel_id: &str) -> anyhow::Result<Option<ChannelEnd>> {
        self.node
            .query(&["ibc", "channel", "end", port_id, channel_id])
            .await?
            .map(|value| parse_channel(&value))
            .transpose()
    }

    async fn query_packet_commitment(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> anyhow::Result<bool> {
        let sequence = sequence.to_string();
        let value = self
            .node
            .query(&["ibc", "channel", "packet-commitment", port_id, channel_id, &sequence])
            .await?;
        Ok(value
            .and_then(|v| v.get("commitment").and_then(Value::as_str).map(str::to_string))
            .is_some_and(|commitment| !commitment.is_empty()))
    }

    async fn query_packet_receipt(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> anyhow::Result<bool> {
        let sequence = sequence.to_string();
        let value = self
            .node
            .query(&["ibc", "channel", "packet-receipt", port_id, channel_id, &sequence])
            .await?;
        Ok(value
            .and_then(|v| v.get("received").and_then(Value::as_bool))
            .unwrap_or(false))
    }

    async fn query_packet_acknowledgement(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> anyhow::Result<bool> {
        let sequence = sequence.to_string();
        let value = self
            .node
            .query(&["ibc", "channel", "packet-ack", port_id, channel_id, &sequence])
            .await?;
        Ok(value
            .and_then(|v| v.get("acknowledgement").and_then(Value::as_str).map(str::to_string))
            .is_some_and(|ack| !ack.is_empty()))
    }

    /// The SDK keeps a single receipt per packet, so this is 0 or 1.
    async fn query_packet_deliveries(
        &self,
        port_id: &str,
        channel_id: &str,
        sequence: u64,
    ) -> anyhow::Result<u64> {
        let received = self
            .query_packet_receipt(port_id, channel_id, sequence)
            .await?;
        Ok(u64::from(received))
    }

    async fn query_balance(&self, address: &str, denom: &str) -> anyhow::Result<u128> {
        let value = self
            .node
            .query(&["bank", "balances", address, "--denom", denom])
            .await?
            .with_context(|| format!("no balance for {address}"))?;
        json_str(&value, &["amount"])?
            .parse()
            .context("balance is not a number")
    }

    async fn ibc_denom(&self, port_id: &str, channel_id: &str, base_denom: &str) -> anyhow::Result<String> {
        let trace = format!("{port_id}/{channel_id}/{base_denom}");
        let value = self
            .node
            .query(&["ibc-transfer", "denom-hash", &trace])
            .await?
            .with_context(|| format!("no denom hash for {trace}"))?;
        Ok(format!("ibc/{}", json_str(&value, &["hash"])?))
    }

    async fn send_transfer(&self, request: TransferRequest) -> anyhow::Result<SentPacket> {
        let (price, fee_denom) = self.config.parsed_gas_price()?;
        let fee = (price * TRANSFER_GAS as f64).ceil() as u128;
        let fees = format!("{fee}{fee_denom}");
        let amount = request.amount.to_string();
        let gas = TRANSFER_GAS.to_string();

        let mut args = vec![
            "tx",
            "ibc-transfer",
            "transfer",
            request.port_id.as_str(),
            request.channel_id.as_str(),
            request.receiver.as_str(),
            amount.as_str(),
            "--from",
            request.sender.key_name.as_str(),
            "--keyring-backend",
            "test",
            "--chain-id",
            self.config.chain_id.as_str(),
            "--gas",
            gas.as_str(),
            "--fees",
            fees.as_str(),
            "--node",
            LOCAL_NODE,
            "--home",
            CHAIN_HOME,
            "--output",
            "json",
            "-y",
        ];
        if request.timeout == PacketTimeout::Expired {
            // Relative to the counterparty's clock, so the deadline passes
            // right after the packet is committed.
            args.extend_from_slice(&[
                "--packet-timeout-height",
                "0-0",
                "--packet-timeout-timestamp",
                "1",
            ]);
        }

        let output = self.node.exec(&args).await?;
        let broadcast: Value =
            serde_json::from_str(output.stdout.trim()).context("unexpected broadcast output")?;
        let code = json_u64(&broadcast, &["code"]).unwrap_or_default();
        anyhow::ensure!(
            code == 0,
            "transfer rejected with code {code}: {}",
            json_str(&broadcast, &["raw_log"]).unwrap_or_default()
        );
        let hash = json_str(&broadcast, &["txhash"])?;

        let tx = self.await_tx(&hash).await?;
        let code = json_u64(&tx, &["code"]).unwrap_or_default();
        anyhow::ensure!(
            code == 0,
            "transfer failed with code {code}: {}",
            json_str(&tx, &["raw_log"]).unwrap_or_default()
        );

        let sequence = find_event_attribute(&tx, "send_packet", "packet_sequence")
            .context("transfer emitted no send_packet event")?
            .parse()
            .context("packet_sequence is not a number")?;

        Ok(SentPacket {
            sequence,
            fee: if fee_denom == request.amount.denom { fee } else { 0 },
        })
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        if !self.running {
            return Ok(());
        }

        let runtime = &self.node.runtime;
        if let Err(e) = runtime.stop(&self.node.container, STOP_TIMEOUT).await {
            debug!(error = %e, "stopping chain container failed, removing it anyway");
        }
        runtime.remove(&self.node.container).await?;
        self.running = false;

        // The other chain of the run may still be attached.
        if let Err(e) = runtime.remove_network(&self.network).await {
            debug!(network = %self.network, error = %e, "network not removed");
        }

        info!(chain_id = %self.config.chain_id, "chain stopped");
        Ok(())
    }

    fn abandon(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        warn!(container = %self.node.container, "releasing chain in the background");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let runtime = self.node.runtime.clone();
        let container = self.node.container.clone();
        let network = self.network.clone();
        handle.spawn(async move {
            if let Err(e) = runtime.remove(&container).await {
                warn!(%container, error = %e, "failed to remove abandoned chain container");
            }
            if let Err(e) = runtime.remove_network(&network).await {
                debug!(%network, error = %e, "network not removed");
            }
        });
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl<R: ContainerRuntime> Drop for CosmosChain<R> {
    fn drop(&mut self) {
        self.abandon();
    }
}
