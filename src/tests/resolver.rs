use core::time::Duration;

use rstest::rstest;
use testresult::TestResult;

use crate::chain::{
    format_go_duration, parse_gas_price, registry, resolve_chain_pair, ChainInstance, ChainSpec,
    ChainType, DockerImage, GenesisAmounts,
};
use crate::error::HarnessError;
use crate::logging::install_logger;
use crate::mock::MockProvisioner;
use crate::tests::{dymension, osmosis};

#[test]
fn registry_fills_dymension_defaults() -> TestResult {
    let config = dymension().resolve(0)?;

    assert_eq!(config.chain_id, "dymension_100-1");
    assert_eq!(config.chain_type, ChainType::Cosmos);
    assert_eq!(config.bin, "dymd");
    assert_eq!(config.bech32_prefix, "dym");
    assert_eq!(config.denom, "udym");
    assert_eq!(config.gas_prices, "0udym");
    assert_eq!(format_go_duration(config.trusting_period), "168h0m0s");
    assert_eq!(
        config.image,
        DockerImage::builder().repository("dymension").build()
    );
    assert_eq!(config.image.uid_gid, "1025:1025");
    assert_eq!(config.num_validators, 1);
    assert_eq!(config.num_full_nodes, 0);
    assert_eq!(config.gas_adjustment, 0.0);
    assert_eq!(config.genesis.faucet, 1_000_000_000_000_000_000_000_000);
    assert_eq!(config.genesis.validator, 500_000_000_000_000_000_000_000);
    Ok(())
}

#[test]
fn registry_supplies_dymension_genesis() -> TestResult {
    let config = ChainSpec::builder().name("dymension").build().resolve(0)?;

    assert_eq!(config.gas_adjustment, 0.0);
    assert_eq!(config.genesis, registry::DYMENSION_GENESIS);
    assert_eq!(
        ChainSpec::builder().name("gaia").build().resolve(0)?.genesis,
        GenesisAmounts::DEFAULT
    );
    Ok(())
}

#[test]
fn image_version_follows_spec_version() -> TestResult {
    let config = osmosis().resolve(1)?;

    assert_eq!(config.chain_id, "osmosis-1001");
    assert_eq!(config.image.version, "v7.2.0");
    assert_eq!(config.denom, "uosmo");
    assert_eq!(config.trusting_period, registry::DEFAULT_TRUSTING_PERIOD);
    Ok(())
}

#[rstest]
#[case(0, "gaia-1")]
#[case(1, "gaia-2")]
fn default_chain_id_follows_position(#[case] index: usize, #[case] expected: &str) -> TestResult {
    let config = ChainSpec::builder().name("gaia").build().resolve(index)?;
    assert_eq!(config.chain_id, expected);
    Ok(())
}

#[test]
fn resolution_is_deterministic() -> TestResult {
    assert_eq!(dymension().resolve(0)?, dymension().resolve(0)?);
    Ok(())
}

#[test]
fn explicit_fields_override_registry() -> TestResult {
    let config = ChainSpec::builder()
        .name("osmosis")
        .gas_prices("0.1uosmo")
        .trusting_period(Duration::from_secs(3600))
        .gas_adjustment(2.0)
        .build()
        .resolve(0)?;

    assert_eq!(config.gas_prices, "0.1uosmo");
    assert_eq!(config.trusting_period, Duration::from_secs(3600));
    assert_eq!(config.gas_adjustment, 2.0);
    assert_eq!(config.bin, "osmosisd");
    Ok(())
}

#[test]
fn unknown_chain_needs_every_field() {
    let result = ChainSpec::builder().name("juno").build().resolve(0);
    assert!(result.is_err());
}

#[test]
fn unknown_chain_resolves_when_fully_specified() -> TestResult {
    let config = ChainSpec::builder()
        .name("juno")
        .image(DockerImage::builder().repository("juno").version("v14").build())
        .bin("junod")
        .bech32_prefix("juno")
        .denom("ujuno")
        .gas_prices("0.025ujuno")
        .build()
        .resolve(0)?;

    assert_eq!(config.chain_id, "juno-1");
    assert_eq!(config.trusting_period, registry::DEFAULT_TRUSTING_PERIOD);
    Ok(())
}

#[test]
fn chain_needs_a_validator() {
    let result = ChainSpec::builder()
        .name("gaia")
        .num_validators(0)
        .build()
        .resolve(0);
    assert!(result.is_err());
}

#[rstest]
#[case("0.0025uosmo", 0.0025, "uosmo")]
#[case("0udym", 0.0, "udym")]
#[case("1ibc/27394FB092D2ECCD56123C74F36E4C1F926001CEADA9CA97EA622B25F41E5EB2", 1.0, "ibc/27394FB092D2ECCD56123C74F36E4C1F926001CEADA9CA97EA622B25F41E5EB2")]
fn gas_price_splits_amount_and_denom(
    #[case] input: &str,
    #[case] amount: f64,
    #[case] denom: &str,
) -> TestResult {
    assert_eq!(parse_gas_price(input)?, (amount, denom.to_string()));
    Ok(())
}

#[rstest]
#[case("100")]
#[case("uosmo")]
#[case("1.2.3uosmo")]
fn malformed_gas_price_is_rejected(#[case] input: &str) {
    assert!(parse_gas_price(input).is_err());
}

#[tokio::test]
async fn same_chain_id_twice_is_rejected() {
    install_logger();
    let provisioner = MockProvisioner::default();

    let result = resolve_chain_pair(&provisioner, &[dymension(), dymension()], "dup").await;

    assert!(matches!(result, Err(HarnessError::Provisioning { .. })));
    assert!(provisioner.network().running_chains().is_empty());
}

#[tokio::test]
async fn failed_chain_releases_the_other() {
    install_logger();
    let provisioner = MockProvisioner::builder()
        .failing_chains(vec!["osmosis-1001".to_string()])
        .build();

    let result = resolve_chain_pair(&provisioner, &[dymension(), osmosis()], "partial").await;

    match result {
        Err(HarnessError::Provisioning { chain, .. }) => assert_eq!(chain, "osmosis-1001"),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("provisioning should fail"),
    }
    assert!(provisioner.network().running_chains().is_empty());
}

#[tokio::test]
async fn teardown_is_idempotent() -> TestResult {
    install_logger();
    let provisioner = MockProvisioner::default();

    let mut chains = resolve_chain_pair(&provisioner, &[dymension(), osmosis()], "idem").await?;
    assert!(chains.is_running());
    assert_eq!(
        provisioner.network().running_chains(),
        vec!["dymension_100-1".to_string(), "osmosis-1001".to_string()]
    );

    chains.teardown().await?;
    chains.teardown().await?;

    assert!(!chains.a.is_running());
    assert!(!chains.b.is_running());
    assert!(provisioner.network().running_chains().is_empty());
    Ok(())
}

#[tokio::test]
async fn provisioned_chains_produce_blocks() -> TestResult {
    install_logger();
    let provisioner = MockProvisioner::builder()
        .block_time(Duration::from_millis(10))
        .build();
    let mut chains = resolve_chain_pair(&provisioner, &[dymension(), osmosis()], "blocks").await?;

    let start = chains.a.latest_height().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = chains.a.latest_height().await?;
    chains.a.health_check().await?;

    chains.teardown().await?;
    assert!(later > start);
    Ok(())
}
