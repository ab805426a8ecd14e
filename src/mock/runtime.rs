use core::net::SocketAddr;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::chain::DockerImage;
use crate::container::{ContainerRuntime, ContainerSpec, ExecOutput};
use crate::mock::{lock, MockRelayEngine};
use crate::relayer::container::RELAYER_HOME;
use crate::relayer::{LinkedPath, PacketProcessor, ProcessingStrategy};

/// Relayer configuration accumulated by `rly` commands in one home directory.
#[derive(Default)]
struct RlyHome {
    chains: HashSet<String>,
    keys: HashSet<String>,
    paths: HashMap<String, (String, String)>,
    linked: HashMap<String, LinkedPath>,
}

struct MockContainer {
    shutdown: watch::Sender<bool>,
    exit: watch::Receiver<Option<i64>>,
}

/// A [`ContainerRuntime`] that interprets relayer containers in process.
///
/// `rly` commands act on [`crate::mock::MockChain`]s through a
/// [`MockRelayEngine`]; `rly start` runs the engine's processor until the
/// container is stopped or removed. Containers are addressed by name when
/// they have one. Any other container idles until stopped, and `exec` into
/// it fails.
pub struct MockContainerRuntime {
    engine: MockRelayEngine,
    local_images: Mutex<HashSet<DockerImage>>,
    registry: Mutex<HashSet<DockerImage>>,
    homes: Mutex<HashMap<PathBuf, RlyHome>>,
    containers: Mutex<HashMap<String, MockContainer>>,
    networks: Mutex<HashSet<String>>,
    crash_on_start: bool,
    fail_stop: bool,
    next_container: AtomicUsize,
    pulls: AtomicUsize,
    builds: AtomicUsize,
}

impl MockContainerRuntime {
    pub fn new(engine: MockRelayEngine) -> Self {
        Self {
            engine,
            local_images: Mutex::default(),
            registry: Mutex::default(),
            homes: Mutex::default(),
            containers: Mutex::default(),
            networks: Mutex::default(),
            crash_on_start: false,
            fail_stop: false,
            next_container: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
        }
    }

    /// Makes `image` present locally.
    pub fn with_local_image(self, image: DockerImage) -> Self {
        lock(&self.local_images).insert(image);
        self
    }

    /// Makes `image` pullable from the registry.
    pub fn with_registry_image(self, image: DockerImage) -> Self {
        lock(&self.registry).insert(image);
        self
    }

    /// Relayer containers exit with status 1 right after starting.
    pub fn crashing_on_start(mut self) -> Self {
        self.crash_on_start = true;
        self
    }

    /// Every `stop` fails, leaving the container running.
    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Networks created and not yet removed, sorted.
    pub fn networks(&self) -> Vec<String> {
        let mut networks: Vec<_> = lock(&self.networks).iter().cloned().collect();
        networks.sort();
        networks
    }

    /// Containers started and not yet removed.
    pub fn live_containers(&self) -> usize {
        lock(&self.containers).len()
    }

    fn home_of(spec: &ContainerSpec) -> anyhow::Result<PathBuf> {
        spec.mounts
            .iter()
            .find(|(_, target)| target == RELAYER_HOME)
            .map(|(host, _)| host.clone())
            .with_context(|| format!("no volume mounted at {RELAYER_HOME}"))
    }

    fn host_path(home: &Path, container_path: &str) -> anyhow::Result<PathBuf> {
        let relative = container_path
            .strip_prefix(RELAYER_HOME)
            .with_context(|| format!("{container_path} is outside the relayer home"))?;
        Ok(home.join(relative.trim_start_matches('/')))
    }

    /// The `rly` arguments of `spec`, without the program name and `--home`.
    fn rly_args(spec: &ContainerSpec) -> anyhow::Result<Vec<String>> {
        let (program, rest) = spec
            .command
            .split_first()
            .context("container has no command")?;
        anyhow::ensure!(program == "rly", "unsupported program {program}");

        let mut args = Vec::with_capacity(rest.len());
        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            if arg == "--home" {
                iter.next();
            } else {
                args.push(arg.clone());
            }
        }
        Ok(args)
    }

    fn with_home<T>(
        &self,
        home: &Path,
        f: impl FnOnce(&mut RlyHome) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut homes = lock(&self.homes);
        let config = homes
            .get_mut(home)
            .with_context(|| format!("relayer home {} is not initialized", home.display()))?;
        f(config)
    }

    async fn rly(&self, home: &Path, args: &[String]) -> anyhow::Result<ExecOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut stdout = String::new();

        match args.as_slice() {
            ["config", "init"] => {
                lock(&self.homes).insert(home.to_path_buf(), RlyHome::default());
            }
            ["chains", "add", "--file", file, chain_id] => {
                let contents = tokio::fs::read_to_string(Self::host_path(home, file)?)
                    .await
                    .with_context(|| format!("reading {file}"))?;
                let config: serde_json::Value = serde_json::from_str(&contents)?;
                let configured = config["value"]["chain-id"].as_str().unwrap_or_default();
                anyhow::ensure!(
                    configured == *chain_id,
                    "{file} configures {configured}, not {chain_id}"
                );
                self.engine.network().chain(chain_id)?;
                self.with_home(home, |config| {
                    config.chains.insert(chain_id.to_string());
                    Ok(())
                })?;
            }
            ["keys", "restore", chain_id, key, _mnemonic] => self.with_home(home, |config| {
                anyhow::ensure!(config.chains.contains(*chain_id), "chain {chain_id} not configured");
                config.keys.insert(format!("{chain_id}/{key}"));
                Ok(())
            })?,
            ["paths", "new", a, b, name] => self.with_home(home, |config| {
                for chain_id in [a, b] {
                    anyhow::ensure!(config.chains.contains(*chain_id), "chain {chain_id} not configured");
                    anyhow::ensure!(
                        config.keys.iter().any(|key| key.starts_with(&format!("{chain_id}/"))),
                        "no key for chain {chain_id}"
                    );
                }
                config.paths.insert(name.to_string(), (a.to_string(), b.to_string()));
                Ok(())
            })?,
            ["tx", "link", name, ..] => {
                let (a, b) = self.with_home(home, |config| {
                    config
                        .paths
                        .get(*name)
                        .cloned()
                        .with_context(|| format!("path {name} not found"))
                })?;
                let linked = self.engine.link_chains(&a, &b)?;
                self.with_home(home, |config| {
                    config.linked.insert(name.to_string(), linked);
                    Ok(())
                })?;
            }
            ["paths", "show", name, "--json"] => {
                let linked = self.linked(home, name)?;
                stdout = json!({
                    "path": {
                        "src": {
                            "chain-id": linked.a.chain_id,
                            "client-id": linked.a.client_id,
                            "connection-id": linked.a.connection_id,
                        },
                        "dst": {
                            "chain-id": linked.b.chain_id,
                            "client-id": linked.b.client_id,
                            "connection-id": linked.b.connection_id,
                        },
                    },
                    "status": { "chains": true, "clients": true, "connection": true },
                })
                .to_string();
            }
            ["q", "channels", chain_id] => {
                let chain = self.engine.network().chain(chain_id)?;
                for (port_id, channel_id, end) in chain.channels()? {
                    let line = json!({
                        "state": format!("STATE_{}", end.state.to_string().replace('_', "")),
                        "ordering": "ORDER_UNORDERED",
                        "counterparty": {
                            "port_id": end.counterparty_port_id,
                            "channel_id": end.counterparty_channel_id.unwrap_or_default(),
                        },
                        "connection_hops": [end.connection_id],
                        "version": end.version,
                        "port_id": port_id,
                        "channel_id": channel_id,
                    });
                    stdout.push_str(&line.to_string());
                    stdout.push('\n');
                }
            }
            other => anyhow::bail!("unsupported rly command {other:?}"),
        }

        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
        })
    }

    fn linked(&self, home: &Path, name: &str) -> anyhow::Result<LinkedPath> {
        self.with_home(home, |config| {
            config
                .linked
                .get(name)
                .cloned()
                .with_context(|| format!("path {name} is not linked"))
        })
    }

    /// A container that does nothing until it is stopped.
    fn idle() -> MockContainer {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let (exit_tx, exit) = watch::channel(None);
        tokio::spawn(async move {
            // A dropped sender means the container was removed.
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
            exit_tx.send_replace(Some(0));
        });
        MockContainer { shutdown, exit }
    }

    /// `rly start <path>`: runs the engine's processor for the linked path.
    fn start_relayer(&self, spec: &ContainerSpec) -> anyhow::Result<MockContainer> {
        let home = Self::home_of(spec)?;
        let args = Self::rly_args(spec)?;
        let name = match args.as_slice() {
            [start, name, ..] if start == "start" => name.clone(),
            _ => anyhow::bail!("unsupported long-running command {args:?}"),
        };
        let strategy = ProcessingStrategy::from_flags(args.as_slice())?;
        let linked = self.linked(&home, &name)?;
        let processor = self.engine.build_processor(&linked, strategy)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (exit_tx, exit) = watch::channel(None);
        tokio::spawn(async move {
            let code = match processor.run(shutdown_rx).await {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "mock relayer failed");
                    1
                }
            };
            exit_tx.send_replace(Some(code));
        });
        Ok(MockContainer { shutdown, exit })
    }

    fn exit_with(code: i64) -> (watch::Sender<bool>, watch::Receiver<Option<i64>>) {
        let (shutdown, _) = watch::channel(false);
        let (_, exit) = watch::channel(Some(code));
        (shutdown, exit)
    }
}

impl ContainerRuntime for MockContainerRuntime {
    async fn image_exists(&self, image: &DockerImage) -> anyhow::Result<bool> {
        Ok(lock(&self.local_images).contains(image))
    }

    async fn pull_image(&self, image: &DockerImage) -> anyhow::Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(
            lock(&self.registry).contains(image),
            "manifest for {image} not found"
        );
        lock(&self.local_images).insert(image.clone());
        Ok(())
    }

    async fn build_image(
        &self,
        image: &DockerImage,
        context: &Path,
        _dockerfile: Option<&Path>,
    ) -> anyhow::Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to race.
        tokio::time::sleep(Duration::from_millis(20)).await;
        info!(%image, context = %context.display(), "mock image built");
        lock(&self.local_images).insert(image.clone());
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> anyhow::Result<()> {
        lock(&self.networks).insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
        lock(&self.networks).remove(name);
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> anyhow::Result<ExecOutput> {
        anyhow::ensure!(
            lock(&self.local_images).contains(&spec.image),
            "image {} not found",
            spec.image
        );
        let home = Self::home_of(spec)?;
        let args = Self::rly_args(spec)?;
        debug!(?args, "mock rly");
        self.rly(&home, &args).await
    }

    async fn spawn(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        anyhow::ensure!(
            lock(&self.local_images).contains(&spec.image),
            "image {} not found",
            spec.image
        );
        let id = match &spec.name {
            Some(name) => name.clone(),
            None => format!("mock-{}", self.next_container.fetch_add(1, Ordering::SeqCst)),
        };
        anyhow::ensure!(
            !lock(&self.containers).contains_key(&id),
            "container name {id} is already in use"
        );

        let container = if spec.command.first().map(String::as_str) != Some("rly") {
            Self::idle()
        } else if self.crash_on_start {
            let (shutdown, exit) = Self::exit_with(1);
            MockContainer { shutdown, exit }
        } else {
            self.start_relayer(spec)?
        };

        lock(&self.containers).insert(id.clone(), container);
        Ok(id)
    }

    async fn exec(
        &self,
        container: &str,
        _command: &[String],
        _stdin: Option<&str>,
    ) -> anyhow::Result<ExecOutput> {
        anyhow::bail!("exec into {container} is not supported by the mock runtime")
    }

    async fn exec_detached(&self, container: &str, _command: &[String]) -> anyhow::Result<()> {
        anyhow::bail!("exec into {container} is not supported by the mock runtime")
    }

    async fn host_port(&self, container: &str, port: u16) -> anyhow::Result<SocketAddr> {
        anyhow::bail!("{container} publishes no port {port} in the mock runtime")
    }

    async fn wait(&self, container: &str) -> anyhow::Result<i64> {
        let mut exit = lock(&self.containers)
            .get(container)
            .map(|c| c.exit.clone())
            .with_context(|| format!("no such container {container}"))?;

        loop {
            if let Some(code) = *exit.borrow_and_update() {
                return Ok(code);
            }
            exit.changed()
                .await
                .with_context(|| format!("container {container} vanished"))?;
        }
    }

    async fn stop(&self, container: &str, _grace: Duration) -> anyhow::Result<()> {
        anyhow::ensure!(!self.fail_stop, "cannot stop container {container}");
        let containers = lock(&self.containers);
        let container = containers
            .get(container)
            .with_context(|| format!("no such container {container}"))?;
        container.shutdown.send_replace(true);
        Ok(())
    }

    async fn remove(&self, container: &str) -> anyhow::Result<()> {
        if let Some(removed) = lock(&self.containers).remove(container) {
            removed.shutdown.send_replace(true);
        }
        Ok(())
    }
}
