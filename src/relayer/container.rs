use core::time::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn, Instrument};

use crate::chain::{format_go_duration, ChainEndpoint, DockerImage, TRANSFER_PORT, TRANSFER_VERSION};
use crate::container::{ContainerRuntime, ContainerSpec, ExecOutput};
use crate::error::{ConstructionError, Result};
use crate::relayer::{
    LinkedPath, PathEnd, ProcessingStrategy, Readiness, RelayerHandle, RelayerTask,
    RelayerVariant, TaskExit,
};

/// Relayer home directory inside the container.
pub const RELAYER_HOME: &str = "/home/relayer";
pub const RELAYER_KEY_NAME: &str = "relayer";
/// Grace period `docker stop` gives the relayer before killing it.
const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Relayer chain configuration file in the format `chains add --file` reads.
pub fn chain_config_json(endpoint: &ChainEndpoint) -> serde_json::Value {
    json!({
        "type": endpoint.chain_type.to_string(),
        "value": {
            "key": RELAYER_KEY_NAME,
            "chain-id": endpoint.chain_id,
            "rpc-addr": endpoint.rpc_address,
            "grpc-addr": endpoint.grpc_address,
            "account-prefix": endpoint.bech32_prefix,
            "keyring-backend": "test",
            "gas-adjustment": endpoint.gas_adjustment,
            "gas-prices": endpoint.gas_prices,
            "debug": true,
            "timeout": "10s",
            "output-format": "json",
            "sign-mode": "direct",
            "trusting-period": format_go_duration(endpoint.trusting_period),
        }
    })
}

/// Every `rly` invocation the containerized relayer goes through, in order.
#[derive(Clone, Debug)]
pub struct RlyCommands {
    pub path: String,
    pub a: ChainEndpoint,
    pub b: ChainEndpoint,
}

impl RlyCommands {
    fn rly(args: &[&str]) -> Vec<String> {
        let mut command = vec!["rly".to_string()];
        command.extend(args.iter().map(|arg| arg.to_string()));
        command.extend(["--home".to_string(), RELAYER_HOME.to_string()]);
        command
    }

    pub fn chain_file(chain_id: &str) -> String {
        format!("{RELAYER_HOME}/chains/{chain_id}.json")
    }

    /// Commands that configure the relayer, up to and including `tx link`.
    pub fn setup(&self) -> Vec<Vec<String>> {
        let mut commands = vec![Self::rly(&["config", "init"])];
        for endpoint in [&self.a, &self.b] {
            let file = Self::chain_file(&endpoint.chain_id);
            commands.push(Self::rly(&["chains", "add", "--file", &file, &endpoint.chain_id]));
        }
        for endpoint in [&self.a, &self.b] {
            commands.push(Self::rly(&[
                "keys",
                "restore",
                &endpoint.chain_id,
                RELAYER_KEY_NAME,
                &endpoint.relayer_wallet.mnemonic,
            ]));
        }
        commands.push(Self::rly(&[
            "paths",
            "new",
            &self.a.chain_id,
            &self.b.chain_id,
            &self.path,
        ]));
        commands.push(Self::rly(&[
            "tx",
            "link",
            &self.path,
            "--src-port",
            TRANSFER_PORT,
            "--dst-port",
            TRANSFER_PORT,
            "--order",
            "unordered",
            "--version",
            TRANSFER_VERSION,
        ]));
        commands
    }

    pub fn show_path(&self) -> Vec<String> {
        Self::rly(&["paths", "show", &self.path, "--json"])
    }

    pub fn query_channels(&self) -> Vec<String> {
        Self::rly(&["q", "channels", &self.a.chain_id])
    }

    pub fn start(&self, strategy: ProcessingStrategy) -> Vec<String> {
        let mut command = Self::rly(&["start", &self.path]);
        command.extend(strategy.startup_flags());
        command
    }
}

#[derive(Deserialize)]
struct PathShow {
    path: PathShowBody,
}

#[derive(Deserialize)]
struct PathShowBody {
    src: PathShowEnd,
    dst: PathShowEnd,
}

#[derive(Deserialize)]
struct PathShowEnd {
    #[serde(rename = "chain-id")]
    chain_id: String,
    #[serde(rename = "client-id")]
    client_id: String,
    #[serde(rename = "connection-id")]
    connection_id: String,
}

#[derive(Deserialize)]
struct ChannelLine {
    state: String,
    port_id: String,
    channel_id: String,
    connection_hops: Vec<String>,
    counterparty: ChannelCounterparty,
}

#[derive(Deserialize)]
struct ChannelCounterparty {
    port_id: String,
    channel_id: String,
}

/// Builds the linked path from `paths show --json` and `q channels` output.
pub fn parse_linked_path(path_name: &str, path_show: &str, channels: &str) -> anyhow::Result<LinkedPath> {
    let shown: PathShow =
        serde_json::from_str(path_show.trim()).context("unexpected `paths show` output")?;
    let PathShowBody { src, dst } = shown.path;

    let channel = channels
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<ChannelLine>(line.trim()))
        .collect::<Result<Vec<_>, _>>()
        .context("unexpected `q channels` output")?
        .into_iter()
        .filter(|channel| {
            channel.state == "STATE_OPEN"
                && channel.port_id == TRANSFER_PORT
                && channel.connection_hops.first() == Some(&src.connection_id)
        })
        .last()
        .with_context(|| format!("no open transfer channel on connection {}", src.connection_id))?;

    Ok(LinkedPath {
        name: path_name.to_string(),
        a: PathEnd {
            chain_id: src.chain_id,
            client_id: src.client_id,
            connection_id: src.connection_id,
            port_id: channel.port_id,
            channel_id: channel.channel_id,
        },
        b: PathEnd {
            chain_id: dst.chain_id,
            client_id: dst.client_id,
            connection_id: dst.connection_id,
            port_id: channel.counterparty.port_id,
            channel_id: channel.counterparty.channel_id,
        },
    })
}

/// Everything the background task needs, owned so it can move into the task.
struct Launch<R> {
    runtime: Arc<R>,
    image: DockerImage,
    commands: RlyCommands,
    strategy: ProcessingStrategy,
    home: PathBuf,
    network: Option<String>,
    container_name: String,
}

impl<R> Clone for Launch<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            image: self.image.clone(),
            commands: self.commands.clone(),
            strategy: self.strategy,
            home: self.home.clone(),
            network: self.network.clone(),
            container_name: self.container_name.clone(),
        }
    }
}

impl<R: ContainerRuntime> Launch<R> {
    fn spec(&self, command: Vec<String>) -> ContainerSpec {
        ContainerSpec::builder()
            .image(self.image.clone())
            .command(command)
            .maybe_network(self.network.clone())
            .mounts(vec![(self.home.clone(), RELAYER_HOME.to_string())])
            .build()
    }

    async fn rly(&self, command: Vec<String>) -> anyhow::Result<ExecOutput> {
        self.runtime.run(&self.spec(command)).await
    }

    async fn link(&self) -> anyhow::Result<LinkedPath> {
        for command in self.commands.setup() {
            self.rly(command).await?;
        }
        let shown = self.rly(self.commands.show_path()).await?;
        let channels = self.rly(self.commands.query_channels()).await?;
        parse_linked_path(&self.commands.path, &shown.stdout, &channels.stdout)
    }

    async fn run(
        self,
        ready: tokio::sync::watch::Sender<Readiness>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<TaskExit> {
        let linked = tokio::select! {
            linked = self.link() => linked,
            _ = shutdown.changed() => return Ok(TaskExit { code: None, requested: true }),
        };

        let linked = match linked {
            Ok(linked) => linked,
            Err(e) => {
                ready.send_replace(Readiness::Failed(format!("{e:#}")));
                return Err(e);
            }
        };

        let mut start = self.spec(self.commands.start(self.strategy));
        start.name = Some(self.container_name.clone());

        let container = match self.runtime.spawn(&start).await {
            Ok(container) => container,
            Err(e) => {
                ready.send_replace(Readiness::Failed(format!("{e:#}")));
                return Err(e);
            }
        };

        info!(path = %linked.name, %container, "path linked, relayer container started");
        ready.send_replace(Readiness::Linked(linked));

        let exit = tokio::select! {
            _ = shutdown.changed() => self.halt(&container).await.map(|code| TaskExit {
                code: Some(code),
                requested: true,
            }),
            code = self.runtime.wait(&container) => code.map(|code| {
                warn!(code, %container, "relayer container exited unexpectedly");
                TaskExit { code: Some(code), requested: false }
            }),
        };

        let removed = self.runtime.remove(&container).await;
        let exit = exit?;
        removed?;
        Ok(exit)
    }

    async fn halt(&self, container: &str) -> anyhow::Result<i64> {
        self.runtime.stop(container, CONTAINER_STOP_TIMEOUT).await?;
        self.runtime.wait(container).await
    }
}

/// Relayer running as a container launched from a relayer image.
///
/// Dropping a started relayer without [`RelayerHandle::stop`] aborts its
/// task and removes the container in the background.
pub struct ContainerRelayer<R: ContainerRuntime> {
    launch: Launch<R>,
    variant: RelayerVariant,
    task: Option<RelayerTask>,
}

impl<R: ContainerRuntime> ContainerRelayer<R> {
    /// Prepares the relayer home directory with one chain file per chain.
    pub async fn new(
        runtime: Arc<R>,
        image: DockerImage,
        variant: RelayerVariant,
        endpoints: [ChainEndpoint; 2],
        run_id: &str,
    ) -> Result<Self, ConstructionError> {
        let [a, b] = endpoints;
        let home = std::env::temp_dir()
            .join("relayer-conformance")
            .join(run_id);

        write_chain_files(&home, [&a, &b])
            .await
            .map_err(ConstructionError::Configure)?;

        let network = a.network.clone().or_else(|| b.network.clone());
        let commands = RlyCommands {
            path: format!("{}-{}", a.chain_id, b.chain_id),
            a,
            b,
        };

        Ok(Self {
            launch: Launch {
                runtime,
                image,
                commands,
                strategy: variant.strategy,
                home,
                network,
                container_name: format!("relayer-{run_id}"),
            },
            variant,
            task: None,
        })
    }

    pub fn home(&self) -> &Path {
        &self.launch.home
    }
}

async fn write_chain_files(home: &Path, endpoints: [&ChainEndpoint; 2]) -> anyhow::Result<()> {
    let chains = home.join("chains");
    tokio::fs::create_dir_all(&chains)
        .await
        .with_context(|| format!("creating {}", chains.display()))?;

    // The container user differs from the host user.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for dir in [home, chains.as_path()] {
            tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await?;
        }
    }

    for endpoint in endpoints {
        let file = chains.join(format!("{}.json", endpoint.chain_id));
        let contents = serde_json::to_string_pretty(&chain_config_json(endpoint))?;
        tokio::fs::write(&file, contents)
            .await
            .with_context(|| format!("writing {}", file.display()))?;
    }
    Ok(())
}

impl<R: ContainerRuntime> RelayerHandle for ContainerRelayer<R> {
    fn variant(&self) -> &RelayerVariant {
        &self.variant
    }

    async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(ConstructionError::Launch(anyhow::anyhow!("relayer already started")).into());
        }

        let launch = self.launch.clone();
        let span = tracing::info_span!("relayer", variant = %self.variant);
        self.task = Some(RelayerTask::spawn(move |ready, shutdown| {
            launch.run(ready, shutdown).instrument(span)
        }));
        Ok(())
    }

    async fn await_ready(&mut self, timeout: Duration) -> Result<LinkedPath> {
        match self.task.as_mut() {
            Some(task) => task.await_ready(timeout).await,
            None => Err(ConstructionError::Launch(anyhow::anyhow!("relayer was never started")).into()),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.task {
            Some(task) => task.ensure_running(),
            None => Ok(()),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        let stopped = match self.task.take() {
            Some(mut task) => {
                let stopped = task.stop().await;
                if stopped.is_err() {
                    let container = &self.launch.container_name;
                    if let Err(e) = self.launch.runtime.remove(container).await {
                        warn!(%container, error = %e, "failed to remove relayer container");
                    }
                }
                stopped
            }
            None => Ok(()),
        };

        match tokio::fs::remove_dir_all(&self.launch.home).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(home = %self.launch.home.display(), error = %e, "failed to remove relayer home"),
        }

        stopped
    }
}

impl<R: ContainerRuntime> Drop for ContainerRelayer<R> {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        drop(task);

        let container = self.launch.container_name.clone();
        warn!(%container, "relayer dropped without stop; removing its container");
        if let Err(e) = std::fs::remove_dir_all(&self.launch.home) {
            debug!(home = %self.launch.home.display(), error = %e, "relayer home not removed");
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let runtime = self.launch.runtime.clone();
        handle.spawn(async move {
            if let Err(e) = runtime.remove(&container).await {
                warn!(%container, error = %e, "failed to remove dropped relayer container");
            }
        });
    }
}
