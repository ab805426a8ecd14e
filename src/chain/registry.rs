//! Defaults for chains the harness knows by name.

use core::time::Duration;

use crate::chain::GenesisAmounts;

pub const DEFAULT_TRUSTING_PERIOD: Duration = Duration::from_secs(336 * 3600);

#[derive(Clone, Copy, Debug)]
pub struct KnownChain {
    pub name: &'static str,
    pub image_repository: &'static str,
    pub bin: &'static str,
    pub bech32_prefix: &'static str,
    pub denom: &'static str,
    pub gas_prices: &'static str,
    pub gas_adjustment: f64,
    pub trusting_period: Duration,
    pub genesis: GenesisAmounts,
}

/// 18-decimal denom: 1M DYM for the faucet, 500K DYM for the validator.
pub const DYMENSION_GENESIS: GenesisAmounts = GenesisAmounts {
    faucet: 1_000_000_000_000_000_000_000_000,
    validator: 500_000_000_000_000_000_000_000,
};

const KNOWN_CHAINS: &[KnownChain] = &[
    KnownChain {
        name: "gaia",
        image_repository: "ghcr.io/strangelove-ventures/heighliner/gaia",
        bin: "gaiad",
        bech32_prefix: "cosmos",
        denom: "uatom",
        gas_prices: "0.01uatom",
        gas_adjustment: 1.3,
        trusting_period: Duration::from_secs(504 * 3600),
        genesis: GenesisAmounts::DEFAULT,
    },
    KnownChain {
        name: "osmosis",
        image_repository: "ghcr.io/strangelove-ventures/heighliner/osmosis",
        bin: "osmosisd",
        bech32_prefix: "osmo",
        denom: "uosmo",
        gas_prices: "0.0025uosmo",
        gas_adjustment: 1.3,
        trusting_period: DEFAULT_TRUSTING_PERIOD,
        genesis: GenesisAmounts::DEFAULT,
    },
    KnownChain {
        name: "dymension",
        image_repository: "dymension",
        bin: "dymd",
        bech32_prefix: "dym",
        denom: "udym",
        gas_prices: "0udym",
        gas_adjustment: 0.0,
        trusting_period: Duration::from_secs(168 * 3600),
        genesis: DYMENSION_GENESIS,
    },
];

pub fn lookup(name: &str) -> Option<&'static KnownChain> {
    KNOWN_CHAINS.iter().find(|chain| chain.name == name)
}
