//! Escrow event journal.
//!
//! Each successful state-mutating call appends one [`EscrowEvent`]. Events
//! from a reverted call are discarded with the rest of its state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::Role;
use crate::address::Address;
use crate::registry::AssetId;

/// A state change recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscrowEvent {
    Listed {
        asset_id: AssetId,
        seller: Address,
        buyer: Address,
        purchase_price: u64,
        escrow_amount: u64,
    },
    EarnestDeposited {
        asset_id: AssetId,
        buyer: Address,
        amount: u64,
    },
    FundsContributed {
        asset_id: AssetId,
        contributor: Address,
        amount: u64,
    },
    InspectionUpdated {
        asset_id: AssetId,
        passed: bool,
    },
    SaleApproved {
        asset_id: AssetId,
        party: Address,
        roles: Vec<Role>,
    },
    SaleFinalized {
        asset_id: AssetId,
        buyer: Address,
        seller: Address,
        purchase_price: u64,
        /// Excess custody returned to the buyer.
        refunded: u64,
    },
    SaleCancelled {
        asset_id: AssetId,
        /// Earnest forfeited to the seller (zero when inspection had not passed).
        forfeited: u64,
        /// Total returned to contributors.
        refunded: u64,
    },
}

impl EscrowEvent {
    /// The asset this event concerns.
    pub fn asset_id(&self) -> AssetId {
        match self {
            EscrowEvent::Listed { asset_id, .. }
            | EscrowEvent::EarnestDeposited { asset_id, .. }
            | EscrowEvent::FundsContributed { asset_id, .. }
            | EscrowEvent::InspectionUpdated { asset_id, .. }
            | EscrowEvent::SaleApproved { asset_id, .. }
            | EscrowEvent::SaleFinalized { asset_id, .. }
            | EscrowEvent::SaleCancelled { asset_id, .. } => *asset_id,
        }
    }
}

/// A journaled event with its position and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier for this record.
    pub id: Uuid,
    /// Position in the journal, starting at 0.
    pub sequence: u64,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// The event itself.
    #[serde(flatten)]
    pub event: EscrowEvent,
}

impl EventRecord {
    pub fn new(sequence: u64, event: EscrowEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            event,
        }
    }
}
