use core::time::Duration;
use std::collections::HashMap;

use rstest::rstest;
use testresult::TestResult;

use crate::config::HarnessConfig;
use crate::retry::DEFAULT_RETRY_CEILING;

fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn unset_variables_keep_defaults() -> TestResult {
    let config = HarnessConfig::from_vars(vars(&[]))?;
    assert_eq!(config.retry.max_attempts, DEFAULT_RETRY_CEILING);
    assert_eq!(config.docker_bin, "docker");
    Ok(())
}

#[test]
fn variables_override_defaults() -> TestResult {
    let config = HarnessConfig::from_vars(vars(&[
        ("HARNESS_RETRY_CEILING", "7"),
        ("HARNESS_POLL_INTERVAL_MS", "25"),
        ("HARNESS_READY_TIMEOUT_SECS", "3"),
        ("RELAYER_IMAGE_VERSION", "v2.5.0"),
    ]))?;
    assert_eq!(config.retry.max_attempts, 7);
    assert_eq!(config.retry.initial_delay, Duration::from_millis(25));
    assert_eq!(config.ready_timeout, Duration::from_secs(3));
    assert_eq!(config.relayer_image_version, "v2.5.0");
    Ok(())
}

#[rstest]
#[case("0")]
#[case("-3")]
#[case("many")]
fn retry_ceiling_must_be_positive(#[case] ceiling: &str) {
    let result = HarnessConfig::from_vars(vars(&[("HARNESS_RETRY_CEILING", ceiling)]));
    assert!(result.is_err(), "ceiling {ceiling} accepted");
}
