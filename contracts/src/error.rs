//! Errors returned by the escrow ledger.
//!
//! Every failed call surfaces exactly one of these. A failed call never
//! leaves partial state behind; see [`crate::escrow::EscrowLedger`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::Operation;
use crate::address::Address;
use crate::bank::BankError;
use crate::registry::{AssetId, RegistryError};

/// A gate that must be open before a sale can be finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleCondition {
    /// The inspector has not recorded a passing inspection.
    InspectionPassed,
    /// The buyer has not approved.
    BuyerApproved,
    /// The seller has not approved.
    SellerApproved,
    /// The lender has not approved.
    LenderApproved,
    /// Custody for the listing is below the purchase price.
    FullyFunded,
}

impl fmt::Display for SaleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaleCondition::InspectionPassed => write!(f, "inspection passed"),
            SaleCondition::BuyerApproved => write!(f, "buyer approval"),
            SaleCondition::SellerApproved => write!(f, "seller approval"),
            SaleCondition::LenderApproved => write!(f, "lender approval"),
            SaleCondition::FullyFunded => write!(f, "full funding"),
        }
    }
}

/// An external transfer that the ledger attempted and that was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// A currency transfer failed.
    #[error("currency transfer failed: {0}")]
    Currency(#[from] BankError),

    /// An asset transfer failed.
    #[error("asset transfer failed: {0}")]
    Asset(#[from] RegistryError),
}

/// Errors that can occur during escrow operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowError {
    /// The caller does not hold a role allowed to perform the operation.
    #[error("unauthorized: {caller} may not call {operation}")]
    Unauthorized {
        /// The operation that was attempted.
        operation: Operation,
        /// The address that attempted it.
        caller: Address,
    },

    /// The listing terms violate a structural precondition.
    #[error("invalid terms: {0}")]
    InvalidTerms(String),

    /// The attached payment is below the required threshold.
    #[error("insufficient payment: required {required}, provided {provided}")]
    InsufficientPayment {
        /// Minimum accepted amount.
        required: u64,
        /// Amount attached to the call.
        provided: u64,
    },

    /// Finalization was attempted before every gate was open.
    #[error("sale not ready, waiting on: {}", join_conditions(.unmet))]
    NotReady {
        /// Every condition that is still unmet.
        unmet: Vec<SaleCondition>,
    },

    /// An external currency or asset transfer was rejected.
    #[error("transfer failed: {0}")]
    TransferFailed(#[from] TransferError),

    /// The asset has no pending listing (never listed, finalized, or cancelled).
    #[error("asset {0} is not listed")]
    NotListed(AssetId),

    /// The asset already has a listing record.
    #[error("asset {0} has already been listed")]
    AlreadyListed(AssetId),

    /// The registry has never minted this asset.
    #[error("unknown asset: {0}")]
    UnknownAsset(AssetId),

    /// Custody arithmetic would overflow.
    #[error("amount overflow: operation would exceed allowed limits")]
    AmountOverflow,
}

impl From<BankError> for EscrowError {
    fn from(err: BankError) -> Self {
        EscrowError::TransferFailed(TransferError::Currency(err))
    }
}

impl From<RegistryError> for EscrowError {
    fn from(err: RegistryError) -> Self {
        EscrowError::TransferFailed(TransferError::Asset(err))
    }
}

fn join_conditions(unmet: &[SaleCondition]) -> String {
    unmet
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
