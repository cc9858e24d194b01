//! # Node Configuration
//!
//! The deployment file read by `keystone-node run --config` and written by
//! `keystone-node init`. It fixes the escrow parties and seeds the devnet
//! bank with genesis balances.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use keystone_contracts::config::{coins, EscrowConfig};
use keystone_contracts::{Address, DevnetLedger};

/// Genesis allocation for each devnet party, in whole coins.
const DEVNET_GENESIS_COINS: u64 = 1_000;

/// Label of the devnet buyer account that receives a genesis balance.
pub const DEVNET_BUYER_LABEL: &str = "keystone:buyer";

/// On-disk node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network identifier reported by `/status`.
    #[serde(default = "default_network")]
    pub network: String,
    /// Escrow deployment parameters.
    pub escrow: EscrowConfig,
    /// Balances minted into the bank at startup.
    #[serde(default)]
    pub genesis_balances: BTreeMap<Address, u64>,
    /// Accounts that refuse incoming currency transfers.
    #[serde(default)]
    pub rejecting: Vec<Address>,
}

fn default_network() -> String {
    "devnet".to_string()
}

impl NodeConfig {
    /// The built-in devnet deployment with funded buyer and lender accounts.
    pub fn devnet() -> Self {
        let escrow = EscrowConfig::devnet();
        let allocation = coins(DEVNET_GENESIS_COINS).unwrap_or(u64::MAX);

        let mut genesis_balances = BTreeMap::new();
        genesis_balances.insert(Address::from_label(DEVNET_BUYER_LABEL), allocation);
        genesis_balances.insert(escrow.lender, allocation);

        Self {
            network: default_network(),
            escrow,
            genesis_balances,
            rejecting: Vec::new(),
        }
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .escrow
            .validate()
            .with_context(|| format!("invalid escrow deployment in {}", path.display()))?;
        Ok(config)
    }

    /// Writes the config as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    /// Deploys a fresh in-memory ledger and applies the genesis state.
    pub fn deploy(&self) -> Result<DevnetLedger> {
        let mut ledger =
            DevnetLedger::in_memory(self.escrow.clone()).context("failed to deploy ledger")?;

        for (account, amount) in &self.genesis_balances {
            ledger
                .fund(*account, *amount)
                .with_context(|| format!("failed to credit genesis balance to {account}"))?;
        }
        for account in &self.rejecting {
            ledger
                .set_rejecting(*account, true)
                .with_context(|| format!("cannot mark {account} as rejecting"))?;
        }

        tracing::info!(
            ledger = %ledger.address(),
            accounts = self.genesis_balances.len(),
            "ledger deployed"
        );
        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_contracts::Bank;

    #[test]
    fn devnet_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystone.json");

        let config = NodeConfig::devnet();
        config.save(&path).unwrap();
        let loaded = NodeConfig::load(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn deploy_applies_genesis_state() {
        let mut config = NodeConfig::devnet();
        let refuser = Address::from_label("test:refuser");
        config.rejecting.push(refuser);

        let ledger = config.deploy().unwrap();
        let lender = config.escrow.lender;

        assert_eq!(ledger.bank().balance_of(&lender), coins(1_000).unwrap());
        assert!(ledger.bank().is_rejecting(&refuser));
        assert_eq!(ledger.get_balance(), 0);
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let escrow = serde_json::to_value(EscrowConfig::devnet()).unwrap();
        let raw = serde_json::json!({ "escrow": escrow });

        let config: NodeConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.network, "devnet");
        assert!(config.genesis_balances.is_empty());
        assert!(config.rejecting.is_empty());
    }

    #[test]
    fn load_rejects_invalid_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");

        let mut config = NodeConfig::devnet();
        config.escrow.seller = config.escrow.ledger;
        config.save(&path).unwrap();

        assert!(NodeConfig::load(&path).is_err());
    }
}
