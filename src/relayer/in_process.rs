use core::future::Future;
use core::time::Duration;

use tokio::sync::watch;
use tracing::{info, Instrument};

use crate::chain::ChainEndpoint;
use crate::error::{ConstructionError, Result};
use crate::relayer::{
    LinkedPath, ProcessingStrategy, Readiness, RelayerHandle, RelayerTask, RelayerVariant,
    TaskExit,
};

/// The relayer library's packet-processing engine, driven directly without a
/// process boundary.
pub trait RelayEngine: Clone + Send + Sync + 'static {
    type Processor: PacketProcessor;

    /// Creates clients, a connection and a transfer channel between the two
    /// chains.
    fn link_path(
        &self,
        a: &ChainEndpoint,
        b: &ChainEndpoint,
    ) -> impl Future<Output = anyhow::Result<LinkedPath>> + Send;

    /// Prepares the processing loop for `path`. Once this returns, every
    /// packet committed afterwards is guaranteed to be seen by the loop.
    fn processor(
        &self,
        path: &LinkedPath,
        strategy: ProcessingStrategy,
    ) -> impl Future<Output = anyhow::Result<Self::Processor>> + Send;
}

pub trait PacketProcessor: Send + 'static {
    /// Relays packets until `shutdown` flips to true.
    fn run(self, shutdown: watch::Receiver<bool>) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub struct InProcessRelayer<E> {
    engine: E,
    variant: RelayerVariant,
    endpoints: [ChainEndpoint; 2],
    task: Option<RelayerTask>,
}

impl<E: RelayEngine> InProcessRelayer<E> {
    pub fn new(engine: E, variant: RelayerVariant, endpoints: [ChainEndpoint; 2]) -> Self {
        Self {
            engine,
            variant,
            endpoints,
            task: None,
        }
    }
}

impl<E: RelayEngine> RelayerHandle for InProcessRelayer<E> {
    fn variant(&self) -> &RelayerVariant {
        &self.variant
    }

    async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(ConstructionError::Launch(anyhow::anyhow!("relayer already started")).into());
        }

        let engine = self.engine.clone();
        let [a, b] = self.endpoints.clone();
        let strategy = self.variant.strategy;
        let span = tracing::info_span!("relayer", variant = %self.variant);

        self.task = Some(RelayerTask::spawn(move |ready, mut shutdown| {
            async move {
                let linked = tokio::select! {
                    linked = engine.link_path(&a, &b) => linked,
                    _ = shutdown.changed() => return Ok(TaskExit { code: None, requested: true }),
                };

                let prepared = match linked {
                    Ok(path) => engine
                        .processor(&path, strategy)
                        .await
                        .map(|processor| (path, processor)),
                    Err(e) => Err(e),
                };

                let (path, processor) = match prepared {
                    Ok(prepared) => prepared,
                    Err(e) => {
                        ready.send_replace(Readiness::Failed(format!("{e:#}")));
                        return Err(e);
                    }
                };

                info!(path = %path.name, "path linked, processing packets");
                ready.send_replace(Readiness::Linked(path));

                processor.run(shutdown.clone()).await?;

                Ok(TaskExit {
                    code: None,
                    requested: *shutdown.borrow(),
                })
            }
            .instrument(span)
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
        match self.task.as_mut() {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }
}
