// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Keystone Escrow Contracts
//!
//! Contract logic for trustless title escrow. A seller lists a tokenized
//! real-estate title, a buyer pays earnest money, an inspector signs off, a
//! lender finances the rest, and the ledger swaps title for payment once
//! everyone has agreed:
//!
//! - **escrow**: the escrow ledger and its listing state machine.
//! - **access**: the operation-to-role authorization table.
//! - **registry**: the title registry the ledger takes custody from.
//! - **bank**: native currency accounts, including the custody account.
//! - **events**: the journal of state changes.
//! - **config**: constants and deployment parameters.
//!
//! ## Design Principles
//!
//! 1. Every monetary operation is overflow-checked with `checked_add` and
//!    `checked_sub`.
//! 2. Each call is all-or-nothing. A failed call restores the ledger,
//!    registry, and bank to their state before the call.
//! 3. Listing state is moved to its final shape before funds or titles
//!    leave custody.
//! 4. Every public type is serializable (serde) for wire transport.

pub mod access;
pub mod address;
pub mod bank;
pub mod config;
pub mod error;
pub mod escrow;
pub mod events;
pub mod registry;

pub use access::{Operation, Role};
pub use address::Address;
pub use bank::{Bank, BankError, NativeBank};
pub use config::EscrowConfig;
pub use error::{EscrowError, SaleCondition, TransferError};
pub use escrow::{Approvals, DevnetLedger, EscrowLedger, Listing, ListingStatus};
pub use events::{EscrowEvent, EventRecord};
pub use registry::{AssetId, AssetRegistry, RegistryError, TitleRegistry};
