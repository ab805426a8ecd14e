use std::sync::Once;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static INIT: Once = Once::new();

/// Installs the process-wide `tracing` subscriber. `RUST_LOG` overrides the
/// default INFO level and `NO_COLOR_LOG=1` disables ANSI colors.
///
/// Call before the first conformance run; later calls are no-ops.
pub fn install_logger() {
    INIT.call_once(|| {
        let with_color = std::env::var("NO_COLOR_LOG")
            .map(|val| val != "1")
            .unwrap_or(true);

        let env_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();

        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(with_color)
            .with_test_writer();

        // Another subscriber may already be installed by the embedding test binary.
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init();
    });
}
