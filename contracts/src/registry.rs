//! # Title Registry
//!
//! The asset registry mints and tracks ownership of tokenized titles. The
//! escrow ledger treats it as an external collaborator and talks to it only
//! through the [`AssetRegistry`] trait.
//!
//! [`TitleRegistry`] is the in-memory implementation used by the devnet
//! node and the test suite. It follows the usual non-fungible token rules:
//!
//! - ids are assigned sequentially starting at [`FIRST_ASSET_ID`];
//! - only the owner may approve an operator, and each token has at most one
//!   approved operator;
//! - `transfer_from` is allowed for the owner or the approved operator, and
//!   clears the approval.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;
use crate::config::FIRST_ASSET_ID;

/// Identifier of a minted title.
pub type AssetId = u64;

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No token with this id has been minted.
    #[error("unknown asset: {0}")]
    UnknownAsset(AssetId),

    /// The caller does not own the token.
    #[error("{caller} does not own asset {asset_id}")]
    NotOwner {
        /// The asset in question.
        asset_id: AssetId,
        /// The address that attempted the operation.
        caller: Address,
    },

    /// The caller is neither owner nor approved operator.
    #[error("{caller} is not approved to transfer asset {asset_id}")]
    NotApproved {
        /// The asset in question.
        asset_id: AssetId,
        /// The address that attempted the transfer.
        caller: Address,
    },

    /// `from` does not match the current owner.
    #[error("asset {asset_id} is owned by {owner}, not {from}")]
    WrongOwner {
        /// The asset in question.
        asset_id: AssetId,
        /// The actual owner.
        owner: Address,
        /// The owner claimed by the caller.
        from: Address,
    },

    /// Transfers to the zero address are burns, which titles do not support.
    #[error("cannot transfer asset {0} to the zero address")]
    ZeroRecipient(AssetId),

    /// The escrow custody account only moves titles through the ledger.
    #[error("{0} is the escrow custody account")]
    ReservedCaller(Address),
}

/// The registry interface consumed by the escrow ledger.
pub trait AssetRegistry {
    /// Address of the registry contract itself.
    fn address(&self) -> Address;

    /// Mints a new title owned by `caller` and returns its id.
    fn mint(&mut self, caller: Address, uri: &str) -> Result<AssetId, RegistryError>;

    /// Returns the current owner of `asset_id`.
    fn owner_of(&self, asset_id: AssetId) -> Result<Address, RegistryError>;

    /// Approves `operator` to transfer `asset_id` on the owner's behalf.
    fn approve(
        &mut self,
        caller: Address,
        operator: Address,
        asset_id: AssetId,
    ) -> Result<(), RegistryError>;

    /// Moves `asset_id` from `from` to `to`. `caller` must be the owner or
    /// the approved operator.
    fn transfer_from(
        &mut self,
        caller: Address,
        from: Address,
        to: Address,
        asset_id: AssetId,
    ) -> Result<(), RegistryError>;
}

/// A minted title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    /// Current owner.
    pub owner: Address,
    /// Metadata URI (typically an IPFS document describing the property).
    pub uri: String,
    /// The single approved operator, if any.
    pub approved: Option<Address>,
}

/// In-memory title registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleRegistry {
    address: Address,
    next_id: AssetId,
    titles: BTreeMap<AssetId, Title>,
}

impl TitleRegistry {
    /// Creates an empty registry deployed at `address`.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            next_id: FIRST_ASSET_ID,
            titles: BTreeMap::new(),
        }
    }

    /// Returns the metadata URI of a title.
    pub fn token_uri(&self, asset_id: AssetId) -> Result<&str, RegistryError> {
        self.title(asset_id).map(|t| t.uri.as_str())
    }

    /// Returns the approved operator of a title, if any.
    pub fn get_approved(&self, asset_id: AssetId) -> Result<Option<Address>, RegistryError> {
        self.title(asset_id).map(|t| t.approved)
    }

    /// Number of titles minted so far.
    pub fn total_supply(&self) -> u64 {
        self.titles.len() as u64
    }

    fn title(&self, asset_id: AssetId) -> Result<&Title, RegistryError> {
        self.titles
            .get(&asset_id)
            .ok_or(RegistryError::UnknownAsset(asset_id))
    }

    fn title_mut(&mut self, asset_id: AssetId) -> Result<&mut Title, RegistryError> {
        self.titles
            .get_mut(&asset_id)
            .ok_or(RegistryError::UnknownAsset(asset_id))
    }
}

impl AssetRegistry for TitleRegistry {
    fn address(&self) -> Address {
        self.address
    }

    fn mint(&mut self, caller: Address, uri: &str) -> Result<AssetId, RegistryError> {
        let asset_id = self.next_id;
        self.titles.insert(
            asset_id,
            Title {
                owner: caller,
                uri: uri.to_string(),
                approved: None,
            },
        );
        self.next_id += 1;

        tracing::debug!(asset_id, owner = %caller, "title minted");
        Ok(asset_id)
    }

    fn owner_of(&self, asset_id: AssetId) -> Result<Address, RegistryError> {
        self.title(asset_id).map(|t| t.owner)
    }

    fn approve(
        &mut self,
        caller: Address,
        operator: Address,
        asset_id: AssetId,
    ) -> Result<(), RegistryError> {
        let title = self.title_mut(asset_id)?;
        if title.owner != caller {
            return Err(RegistryError::NotOwner { asset_id, caller });
        }
        title.approved = Some(operator);
        Ok(())
    }

    fn transfer_from(
        &mut self,
        caller: Address,
        from: Address,
        to: Address,
        asset_id: AssetId,
    ) -> Result<(), RegistryError> {
        if to.is_zero() {
            return Err(RegistryError::ZeroRecipient(asset_id));
        }

        let title = self.title_mut(asset_id)?;
        if title.owner != from {
            return Err(RegistryError::WrongOwner {
                asset_id,
                owner: title.owner,
                from,
            });
        }
        if caller != title.owner && title.approved != Some(caller) {
            return Err(RegistryError::NotApproved { asset_id, caller });
        }

        title.owner = to;
        title.approved = None;

        tracing::debug!(asset_id, %from, %to, "title transferred");
        Ok(())
    }
}
