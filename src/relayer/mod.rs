//! The relayer under test, in every execution variant the harness supports.

use core::fmt;
use core::future::Future;
use core::time::Duration;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::chain::{ChainInstance, ChainPair};
use crate::container::{ContainerRuntime, ImageCache, ImageSource};
use crate::error::{ConstructionError, HarnessError, Phase, Result};

pub mod container;
pub mod in_process;

pub use container::ContainerRelayer;
pub use in_process::{InProcessRelayer, PacketProcessor, RelayEngine};

/// How long a stopping relayer may take before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

/// How the relayer discovers packets to relay. Both strategies first
/// backfill `block_history` blocks committed before they started (0 disables
/// backfill).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessingStrategy {
    /// Reacts to a subscription stream of chain events.
    EventDriven { block_history: u64 },
    /// Scans committed blocks at a fixed cadence.
    LegacyScan { block_history: u64 },
}

impl ProcessingStrategy {
    /// Value of the relayer's `--processor` flag.
    pub fn processor_flag(&self) -> &'static str {
        match self {
            ProcessingStrategy::EventDriven { .. } => "events",
            ProcessingStrategy::LegacyScan { .. } => "legacy",
        }
    }

    pub fn block_history(&self) -> u64 {
        match *self {
            ProcessingStrategy::EventDriven { block_history }
            | ProcessingStrategy::LegacyScan { block_history } => block_history,
        }
    }

    pub fn startup_flags(&self) -> Vec<String> {
        vec![
            "--processor".to_string(),
            self.processor_flag().to_string(),
            "--block-history".to_string(),
            self.block_history().to_string(),
        ]
    }

    /// Inverse of [`ProcessingStrategy::startup_flags`]. Missing flags mean
    /// event-driven processing without backfill.
    pub fn from_flags<S: AsRef<str>>(args: &[S]) -> anyhow::Result<Self> {
        let value_of = |flag: &str| {
            args.iter()
                .position(|arg| arg.as_ref() == flag)
                .and_then(|index| args.get(index + 1))
                .map(|value| value.as_ref().to_string())
        };

        let block_history = match value_of("--block-history") {
            Some(depth) => depth.parse()?,
            None => 0,
        };
        match value_of("--processor").as_deref() {
            Some("events") | None => Ok(ProcessingStrategy::EventDriven { block_history }),
            Some("legacy") => Ok(ProcessingStrategy::LegacyScan { block_history }),
            Some(other) => anyhow::bail!("unknown processor {other}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Execution {
    InProcess,
    Containerized(ImageSource),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayerVariant {
    pub execution: Execution,
    pub strategy: ProcessingStrategy,
}

impl RelayerVariant {
    pub fn in_process(strategy: ProcessingStrategy) -> Self {
        Self {
            execution: Execution::InProcess,
            strategy,
        }
    }

    pub fn containerized(image: ImageSource, strategy: ProcessingStrategy) -> Self {
        Self {
            execution: Execution::Containerized(image),
            strategy,
        }
    }
}

impl fmt::Display for RelayerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let execution = match self.execution {
            Execution::InProcess => "in-process",
            Execution::Containerized(_) => "containerized",
        };
        match self.strategy.block_history() {
            0 => write!(f, "{execution}/{}", self.strategy.processor_flag()),
            depth => write!(f, "{execution}/{}(history={depth})", self.strategy.processor_flag()),
        }
    }
}

/// One end of a linked path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PathEnd {
    pub chain_id: String,
    pub client_id: String,
    pub connection_id: String,
    pub port_id: String,
    pub channel_id: String,
}

/// Identifiers the relayer created while linking the two chains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LinkedPath {
    pub name: String,
    pub a: PathEnd,
    pub b: PathEnd,
}

/// The capability set every relayer variant exposes to the driver.
pub trait RelayerHandle: Send + Sync {
    fn variant(&self) -> &RelayerVariant;

    /// Starts linking the path and then the packet-processing loop in the
    /// background.
    fn start(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Waits until the relayer reports its path as linked.
    fn await_ready(&mut self, timeout: Duration) -> impl Future<Output = Result<LinkedPath>> + Send;

    /// Fails if the background loop terminated without being asked to.
    fn ensure_running(&self) -> Result<()>;

    /// Stops the background loop. Safe to call repeatedly, before `start`,
    /// and after a failed start.
    fn stop(&mut self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone, Debug)]
pub(crate) enum Readiness {
    Pending,
    Linked(LinkedPath),
    Failed(String),
}

/// How the background task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TaskExit {
    /// Process exit code, `None` for in-process loops.
    pub code: Option<i64>,
    /// Whether the exit followed a stop request.
    pub requested: bool,
}

/// Cancellable background task shared by all relayer variants.
pub(crate) struct RelayerTask {
    shutdown: watch::Sender<bool>,
    readiness: watch::Receiver<Readiness>,
    handle: Option<JoinHandle<anyhow::Result<TaskExit>>>,
}

impl RelayerTask {
    pub fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(watch::Sender<Readiness>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = anyhow::Result<TaskExit>> + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ready_tx, readiness) = watch::channel(Readiness::Pending);
        let handle = tokio::spawn(task(ready_tx, shutdown_rx));

        Self {
            shutdown,
            readiness,
            handle: Some(handle),
        }
    }

    pub async fn await_ready(&mut self, timeout: Duration) -> Result<LinkedPath> {
        let readiness = &mut self.readiness;

        let wait = async {
            loop {
                match &*readiness.borrow_and_update() {
                    Readiness::Linked(path) => return Ok(path.clone()),
                    Readiness::Failed(cause) => {
                        return Err(HarnessError::assertion(
                            Phase::RelayerReady,
                            "paths linked",
                            cause,
                        ))
                    }
                    Readiness::Pending => {}
                }
                if readiness.changed().await.is_err() {
                    return Err(HarnessError::ProcessExit {
                        phase: Phase::RelayerReady,
                        code: None,
                        detail: "relayer terminated before linking its path".into(),
                    });
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::LivenessBoundExceeded {
                phase: Phase::RelayerReady,
                waiting_for: "paths linked".into(),
                attempts: 1,
                last_observed: format!("no readiness signal after {timeout:?}"),
            }),
        }
    }

    pub fn ensure_running(&self) -> Result<()> {
        match &self.handle {
            Some(handle) if handle.is_finished() && !*self.shutdown.borrow() => {
                Err(HarnessError::ProcessExit {
                    phase: Phase::RelayPacket,
                    code: None,
                    detail: "relayer terminated while the run was in progress".into(),
                })
            }
            _ => Ok(()),
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.send_replace(true);

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let abort = handle.abort_handle();

        let exit = match tokio::time::timeout(STOP_GRACE, handle).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(join_error)) if join_error.is_cancelled() => return Ok(()),
            Ok(Err(join_error)) => {
                return Err(HarnessError::ProcessExit {
                    phase: Phase::Teardown,
                    code: None,
                    detail: format!("relayer task panicked: {join_error}"),
                })
            }
            Err(_) => {
                abort.abort();
                return Err(HarnessError::ProcessExit {
                    phase: Phase::Teardown,
                    code: None,
                    detail: format!("relayer did not stop within {STOP_GRACE:?}"),
                });
            }
        };

        match exit {
            Ok(TaskExit {
                code: None | Some(0),
                requested: true,
            }) => {
                debug!("relayer stopped cleanly");
                Ok(())
            }
            Ok(TaskExit { code, requested }) => Err(HarnessError::ProcessExit {
                phase: Phase::Teardown,
                code,
                detail: if requested {
                    "non-zero exit status at stop".into()
                } else {
                    "relayer exited before stop was requested".into()
                },
            }),
            Err(e) => Err(HarnessError::ProcessExit {
                phase: Phase::Teardown,
                code: None,
                detail: format!("{e:#}"),
            }),
        }
    }
}

impl Drop for RelayerTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!("relayer handle dropped without stop; aborting its task");
            self.shutdown.send_replace(true);
            handle.abort();
        }
    }
}

/// The closed set of relayer variants behind one [`RelayerHandle`].
pub enum Relayer<E: RelayEngine, R: ContainerRuntime> {
    InProcess(InProcessRelayer<E>),
    Containerized(ContainerRelayer<R>),
}

impl<E: RelayEngine, R: ContainerRuntime> RelayerHandle for Relayer<E, R> {
    fn variant(&self) -> &RelayerVariant {
        match self {
            Relayer::InProcess(relayer) => relayer.variant(),
            Relayer::Containerized(relayer) => relayer.variant(),
        }
    }

    async fn start(&mut self) -> Result<()> {
        match self {
            Relayer::InProcess(relayer) => relayer.start().await,
            Relayer::Containerized(relayer) => relayer.start().await,
        }
    }

    async fn await_ready(&mut self, timeout: Duration) -> Result<LinkedPath> {
        match self {
            Relayer::InProcess(relayer) => relayer.await_ready(timeout).await,
            Relayer::Containerized(relayer) => relayer.await_ready(timeout).await,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self {
            Relayer::InProcess(relayer) => relayer.ensure_running(),
            Relayer::Containerized(relayer) => relayer.ensure_running(),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        match self {
            Relayer::InProcess(relayer) => relayer.stop().await,
            Relayer::Containerized(relayer) => relayer.stop().await,
        }
    }
}

/// Builds relayer handles for a chain pair.
pub struct RelayerFactory<E, R> {
    /// Absent when only containerized relayers can be built.
    engine: Option<E>,
    runtime: Arc<R>,
    images: ImageCache,
}

impl<E: RelayEngine, R: ContainerRuntime> RelayerFactory<E, R> {
    pub fn new(engine: E, runtime: Arc<R>, images: ImageCache) -> Self {
        Self {
            engine: Some(engine),
            runtime,
            images,
        }
    }

    /// A factory that only builds containerized relayers, for chains the
    /// in-process engine cannot reach.
    pub fn containerized_only(runtime: Arc<R>, images: ImageCache) -> Self {
        Self {
            engine: None,
            runtime,
            images,
        }
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub async fn build<C: ChainInstance>(
        &self,
        variant: &RelayerVariant,
        chains: &ChainPair<C>,
        run_id: &str,
    ) -> Result<Relayer<E, R>, ConstructionError> {
        let endpoints = [chains.a.endpoint(), chains.b.endpoint()];

        match &variant.execution {
            Execution::InProcess => {
                let engine = self.engine.clone().ok_or_else(|| {
                    ConstructionError::Configure(anyhow::anyhow!(
                        "no relay engine configured for in-process relayers"
                    ))
                })?;
                Ok(Relayer::InProcess(InProcessRelayer::new(
                    engine,
                    variant.clone(),
                    endpoints,
                )))
            }
            Execution::Containerized(source) => {
                let image = self.images.ensure(self.runtime.as_ref(), source).await?;
                let relayer = ContainerRelayer::new(
                    self.runtime.clone(),
                    image,
                    variant.clone(),
                    endpoints,
                    run_id,
                )
                .await?;
                Ok(Relayer::Containerized(relayer))
            }
        }
    }
}
