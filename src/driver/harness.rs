use core::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, info, warn, Instrument};

use crate::chain::{resolve_chain_pair, ChainProvisioner, ChainSpec};
use crate::config::HarnessConfig;
use crate::container::ContainerRuntime;
use crate::driver::{ConformanceOutcome, Driver};
use crate::error::{HarnessError, Phase, Result};
use crate::relayer::{RelayEngine, RelayerFactory, RelayerHandle, RelayerVariant};
use crate::report::{ReportEvent, Reporter};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A run id unique within the process and across concurrent processes.
pub fn next_run_id() -> String {
    format!(
        "conformance-{}-{}",
        std::process::id(),
        RUN_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Resolves chains, builds the relayer, drives the conformance sequence and
/// releases everything afterwards, whatever the outcome.
pub struct Harness<P, E, R, Rep> {
    provisioner: P,
    factory: RelayerFactory<E, R>,
    config: HarnessConfig,
    reporter: Rep,
}

impl<P, E, R, Rep> Harness<P, E, R, Rep>
where
    P: ChainProvisioner,
    E: RelayEngine,
    R: ContainerRuntime,
    Rep: Reporter,
{
    pub fn new(
        provisioner: P,
        factory: RelayerFactory<E, R>,
        config: HarnessConfig,
        reporter: Rep,
    ) -> Self {
        Self {
            provisioner,
            factory,
            config,
            reporter,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    pub fn factory(&self) -> &RelayerFactory<E, R> {
        &self.factory
    }

    pub fn reporter(&self) -> &Rep {
        &self.reporter
    }

    /// One complete conformance run of `variant` against a fresh chain pair.
    pub async fn run(
        &self,
        specs: &[ChainSpec; 2],
        variant: &RelayerVariant,
    ) -> Result<ConformanceOutcome> {
        let run_id = next_run_id();
        let span = tracing::info_span!("conformance", run = %run_id, %variant);

        async {
            self.reporter.record(ReportEvent::RunStarted {
                run: run_id.clone(),
            });

            let result = self.execute(specs, variant, &run_id).await;
            match &result {
                Ok(_) => info!("conformance run passed"),
                Err(e) => error!(error = %e, "conformance run failed"),
            }

            self.reporter.record(ReportEvent::RunFinished {
                run: run_id.clone(),
                passed: result.is_ok(),
            });
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        specs: &[ChainSpec; 2],
        variant: &RelayerVariant,
        run_id: &str,
    ) -> Result<ConformanceOutcome> {
        let mut chains = match resolve_chain_pair(&self.provisioner, specs, run_id).await {
            Ok(chains) => chains,
            Err(e) => return Err(self.failed(run_id, e)),
        };
        self.passed(run_id, Phase::Provision);

        let mut relayer = match self.factory.build(variant, &chains, run_id).await {
            Ok(relayer) => relayer,
            Err(e) => {
                let e = self.failed(run_id, HarnessError::from(e));
                if let Err(teardown) = chains.teardown().await {
                    warn!(error = %teardown, "teardown after construction failure failed");
                    self.diagnostic(run_id, &teardown);
                }
                return Err(e);
            }
        };
        self.passed(run_id, Phase::Construct);

        let outcome = Driver::new(&chains, &mut relayer, &self.config, &self.reporter, run_id)
            .run()
            .await;

        let stopped = relayer.stop().await;
        let released = chains.teardown().await;

        let result = match (outcome, stopped) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(self.failed(run_id, e)),
            // A relayer that died explains why the driver stopped seeing progress.
            (Err(e), Err(exit @ HarnessError::ProcessExit { .. })) if e.is_liveness() => {
                Err(self.failed(run_id, exit))
            }
            (Err(e), Err(stop)) => {
                warn!(error = %stop, "stopping the relayer failed after the run failed");
                self.diagnostic(run_id, &stop);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        };

        match (result, released) {
            (Ok(outcome), Ok(())) => {
                self.passed(run_id, Phase::Teardown);
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(self.failed(run_id, e)),
            (Err(e), Err(teardown)) => {
                warn!(error = %teardown, "teardown failed after the run failed");
                self.diagnostic(run_id, &teardown);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    fn passed(&self, run_id: &str, phase: Phase) {
        self.reporter.record(ReportEvent::PhasePassed {
            run: run_id.to_string(),
            phase,
        });
    }

    /// Records a secondary failure that does not change the run's verdict.
    fn diagnostic(&self, run_id: &str, e: &HarnessError) {
        self.reporter.record(ReportEvent::Diagnostic {
            run: run_id.to_string(),
            message: e.to_string(),
        });
    }

    fn failed(&self, run_id: &str, e: HarnessError) -> HarnessError {
        self.reporter.record(ReportEvent::PhaseFailed {
            run: run_id.to_string(),
            phase: e.phase(),
            cause: e.to_string(),
        });
        e
    }
}
