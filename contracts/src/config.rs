//! # Configuration & Constants
//!
//! Every constant the escrow contracts and the devnet node share lives here,
//! together with [`EscrowConfig`], the deployment-time parameters of a
//! single escrow ledger.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Contract interface version reported by the node.
pub const CONTRACT_VERSION: &str = "0.1.0";

/// Length of an account address in bytes.
pub const ADDRESS_LENGTH: usize = 20;

/// Decimal places of the native currency. Amounts on the wire are always in
/// the smallest unit, so `1 * 10^9` is one whole coin.
pub const CURRENCY_DECIMALS: u8 = 9;

/// The first asset id handed out by the title registry.
pub const FIRST_ASSET_ID: u64 = 1;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Default JSON-RPC / REST port.
pub const DEFAULT_RPC_PORT: u16 = 9841;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

/// Broadcast channel capacity for live escrow events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Labels used to derive the default devnet deployment.
pub const DEVNET_LEDGER_LABEL: &str = "keystone:escrow-ledger";
pub const DEVNET_REGISTRY_LABEL: &str = "keystone:title-registry";
pub const DEVNET_SELLER_LABEL: &str = "keystone:seller";
pub const DEVNET_INSPECTOR_LABEL: &str = "keystone:inspector";
pub const DEVNET_LENDER_LABEL: &str = "keystone:lender";

/// Converts whole coins into the smallest currency unit.
///
/// Returns `None` on overflow.
pub fn coins(whole: u64) -> Option<u64> {
    whole.checked_mul(10u64.checked_pow(CURRENCY_DECIMALS as u32)?)
}

// ---------------------------------------------------------------------------
// Escrow deployment
// ---------------------------------------------------------------------------

/// Errors raised while validating an [`EscrowConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required address was left as the zero address.
    #[error("{0} address must not be zero")]
    ZeroAddress(&'static str),

    /// The ledger's own address collides with a party or the registry.
    #[error("ledger address collides with the {0} address")]
    LedgerCollision(&'static str),

    /// The registry handed to the ledger is not the one configured.
    #[error("registry mismatch: configured {configured}, got {actual}")]
    RegistryMismatch {
        /// Registry address from the configuration.
        configured: Address,
        /// Address reported by the registry instance.
        actual: Address,
    },
}

/// Deployment parameters of an escrow ledger.
///
/// These are fixed for the lifetime of the ledger, the way constructor
/// arguments are fixed for a deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// The ledger's own custody account.
    pub ledger: Address,
    /// Address of the title registry the ledger takes custody from.
    pub nft_address: Address,
    /// The seller this ledger is deployed for. Only this party may list.
    pub seller: Address,
    /// The party that records inspection results.
    pub inspector: Address,
    /// The party financing the remainder of the purchase price.
    pub lender: Address,
}

impl EscrowConfig {
    /// The default devnet deployment, derived from fixed labels.
    pub fn devnet() -> Self {
        Self {
            ledger: Address::from_label(DEVNET_LEDGER_LABEL),
            nft_address: Address::from_label(DEVNET_REGISTRY_LABEL),
            seller: Address::from_label(DEVNET_SELLER_LABEL),
            inspector: Address::from_label(DEVNET_INSPECTOR_LABEL),
            lender: Address::from_label(DEVNET_LENDER_LABEL),
        }
    }

    /// Checks that no address is zero and that the ledger's custody account
    /// is distinct from every other participant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("ledger", self.ledger),
            ("registry", self.nft_address),
            ("seller", self.seller),
            ("inspector", self.inspector),
            ("lender", self.lender),
        ];

        for (name, address) in named {
            if address.is_zero() {
                return Err(ConfigError::ZeroAddress(name));
            }
        }

        for (name, address) in &named[1..] {
            if *address == self.ledger {
                return Err(ConfigError::LedgerCollision(name));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devnet_config_is_valid() {
        assert_eq!(EscrowConfig::devnet().validate(), Ok(()));
    }

    #[test]
    fn zero_party_rejected() {
        let mut config = EscrowConfig::devnet();
        config.inspector = Address::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroAddress("inspector")));
    }

    #[test]
    fn ledger_must_not_be_a_party() {
        let mut config = EscrowConfig::devnet();
        config.lender = config.ledger;
        assert_eq!(config.validate(), Err(ConfigError::LedgerCollision("lender")));
    }

    #[test]
    fn coins_scales_by_decimals() {
        assert_eq!(coins(1), Some(1_000_000_000));
        assert_eq!(coins(0), Some(0));
        assert_eq!(coins(u64::MAX), None);
    }

    #[test]
    fn ports_are_distinct() {
        assert_ne!(DEFAULT_RPC_PORT, DEFAULT_METRICS_PORT);
    }
}
