use core::time::Duration;
use std::env;

use anyhow::Context;
use bon::Builder;

use crate::retry::RetryPolicy;

pub const DEFAULT_RELAYER_IMAGE: &str = "relayer";
pub const DEFAULT_RELAYER_IMAGE_VERSION: &str = "latest";
pub const DEFAULT_RELAYER_UID_GID: &str = "100:1000";

/// Knobs shared by every conformance run.
#[derive(Builder, Clone, Debug)]
pub struct HarnessConfig {
    #[builder(default)]
    pub retry: RetryPolicy,
    /// How long the relayer may take to report its path as linked.
    #[builder(default = Duration::from_secs(120))]
    pub ready_timeout: Duration,
    /// Amount moved by the relay and timeout packets.
    #[builder(default = 10_000)]
    pub transfer_amount: u128,
    /// Also exercise the timeout path after the relay path.
    #[builder(default = true)]
    pub test_timeout: bool,
    #[builder(default = "docker".into())]
    pub docker_bin: String,
    #[builder(default = DEFAULT_RELAYER_IMAGE.into())]
    pub relayer_image: String,
    #[builder(default = DEFAULT_RELAYER_IMAGE_VERSION.into())]
    pub relayer_image_version: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HarnessConfig {
    /// Defaults, overridden by `DOCKER_BIN`, `RELAYER_IMAGE`,
    /// `RELAYER_IMAGE_VERSION`, `HARNESS_RETRY_CEILING`,
    /// `HARNESS_POLL_INTERVAL_MS` and `HARNESS_READY_TIMEOUT_SECS`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Like [`HarnessConfig::from_env`], reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(docker_bin) = var("DOCKER_BIN") {
            config.docker_bin = docker_bin;
        }
        if let Some(image) = var("RELAYER_IMAGE") {
            config.relayer_image = image;
        }
        if let Some(version) = var("RELAYER_IMAGE_VERSION") {
            config.relayer_image_version = version;
        }
        if let Some(ceiling) = var("HARNESS_RETRY_CEILING") {
            let attempts: u32 = ceiling
                .parse()
                .context("HARNESS_RETRY_CEILING must be a positive integer")?;
            anyhow::ensure!(attempts > 0, "HARNESS_RETRY_CEILING must be a positive integer");
            config.retry.max_attempts = attempts;
        }
        if let Some(interval) = var("HARNESS_POLL_INTERVAL_MS") {
            let millis: u64 = interval
                .parse()
                .context("HARNESS_POLL_INTERVAL_MS must be an integer")?;
            config.retry.initial_delay = Duration::from_millis(millis);
        }
        if let Some(timeout) = var("HARNESS_READY_TIMEOUT_SECS") {
            let secs: u64 = timeout
                .parse()
                .context("HARNESS_READY_TIMEOUT_SECS must be an integer")?;
            config.ready_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
