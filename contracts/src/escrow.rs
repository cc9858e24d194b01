//! # Title Escrow Ledger
//!
//! Custodies a tokenized title and the purchase funds while a sale between
//! a buyer and a seller is pending, with an inspector and a lender taking
//! part. The lifecycle of a listing is:
//!
//! 1. **List**: the seller hands the title to the ledger and fixes the
//!    buyer, purchase price, and required earnest deposit.
//! 2. **Deposit**: the buyer pays at least the earnest amount; the buyer
//!    or the lender may contribute further funds towards the price.
//! 3. **Inspect**: the inspector records pass or fail (revisable).
//! 4. **Approve**: buyer, seller, and lender each approve independently.
//! 5. **Finalize**: with inspection passed, all three approvals, and full
//!    funding, the seller closes the sale. The seller is paid and the title
//!    moves to the buyer.
//!
//! Instead of finalizing, the buyer or seller may **cancel**: the title goes
//! back to the seller and funds are refunded, except that once inspection
//! has passed the buyer's earnest is forfeited to the seller.
//!
//! ## Transactions
//!
//! Every state-mutating call runs as a transaction. The ledger snapshots its
//! listings, the registry, the bank, and the event journal before the call
//! and restores the snapshot if the call fails, so a failed call never
//! leaves partial state behind. Within a call, state is moved to its final
//! shape before any external transfer is attempted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::{authorize, Operation, Parties, Role};
use crate::address::Address;
use crate::bank::{Bank, BankError, NativeBank};
use crate::config::{ConfigError, EscrowConfig};
use crate::error::{EscrowError, SaleCondition};
use crate::events::{EscrowEvent, EventRecord};
use crate::registry::{AssetId, AssetRegistry, RegistryError, TitleRegistry};

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Coarse lifecycle state of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    /// Listed and awaiting deposit, inspection, and approvals.
    Pending,
    /// Sold. Terminal.
    Finalized,
    /// Aborted. Terminal.
    Cancelled,
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListingStatus::Pending => write!(f, "Pending"),
            ListingStatus::Finalized => write!(f, "Finalized"),
            ListingStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// The three approval slots of a listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approvals {
    pub buyer: bool,
    pub seller: bool,
    pub lender: bool,
}

impl Approvals {
    /// Returns the slot for `role`. The inspector has no slot.
    pub fn get(&self, role: Role) -> bool {
        match role {
            Role::Buyer => self.buyer,
            Role::Seller => self.seller,
            Role::Lender => self.lender,
            Role::Inspector => false,
        }
    }

    fn set(&mut self, role: Role) {
        match role {
            Role::Buyer => self.buyer = true,
            Role::Seller => self.seller = true,
            Role::Lender => self.lender = true,
            Role::Inspector => {}
        }
    }

    /// `true` once all three parties have approved.
    pub fn unanimous(&self) -> bool {
        self.buyer && self.seller && self.lender
    }
}

/// Escrow record for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    /// The listed asset.
    pub asset_id: AssetId,
    /// Prior owner of the asset. Receives the purchase price.
    pub seller: Address,
    /// The only party allowed to deposit earnest and receive the asset.
    pub buyer: Address,
    /// Total amount owed, in the smallest currency unit.
    pub purchase_price: u64,
    /// Minimum earnest deposit.
    pub escrow_amount: u64,
    /// Lifecycle state.
    pub status: ListingStatus,
    /// Latest inspection result.
    pub inspection_passed: bool,
    /// Approval slots.
    pub approvals: Approvals,
    /// Funds in custody for this listing, by contributor.
    pub deposits: BTreeMap<Address, u64>,
    /// Portion of the buyer's deposits paid as earnest.
    pub earnest_paid: u64,
    /// When the listing was created.
    pub listed_at: DateTime<Utc>,
    /// When the listing last changed.
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    /// `true` while the listing is pending.
    pub fn is_listed(&self) -> bool {
        self.status == ListingStatus::Pending
    }

    /// Total funds in custody for this listing.
    pub fn deposited(&self) -> u64 {
        self.deposits
            .values()
            .fold(0u64, |acc, amount| acc.saturating_add(*amount))
    }

    /// Every finalization gate that is still closed, in a fixed order.
    pub fn unmet_conditions(&self) -> Vec<SaleCondition> {
        let mut unmet = Vec::new();
        if !self.inspection_passed {
            unmet.push(SaleCondition::InspectionPassed);
        }
        if !self.approvals.buyer {
            unmet.push(SaleCondition::BuyerApproved);
        }
        if !self.approvals.seller {
            unmet.push(SaleCondition::SellerApproved);
        }
        if !self.approvals.lender {
            unmet.push(SaleCondition::LenderApproved);
        }
        if self.deposited() < self.purchase_price {
            unmet.push(SaleCondition::FullyFunded);
        }
        unmet
    }

    /// `true` when the sale can be finalized.
    pub fn is_ready(&self) -> bool {
        self.is_listed() && self.unmet_conditions().is_empty()
    }

    fn credit(&mut self, contributor: Address, amount: u64) -> Result<(), EscrowError> {
        self.deposited()
            .checked_add(amount)
            .ok_or(EscrowError::AmountOverflow)?;
        let entry = self.deposits.entry(contributor).or_insert(0);
        *entry = entry
            .checked_add(amount)
            .ok_or(EscrowError::AmountOverflow)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The escrow ledger, generic over its asset registry and currency bank.
#[derive(Debug, Clone)]
pub struct EscrowLedger<R, B> {
    config: EscrowConfig,
    registry: R,
    bank: B,
    listings: BTreeMap<AssetId, Listing>,
    journal: Vec<EventRecord>,
}

/// The fully in-memory ledger used by the devnet node and tests.
pub type DevnetLedger = EscrowLedger<TitleRegistry, NativeBank>;

impl DevnetLedger {
    /// Deploys a ledger with a fresh [`TitleRegistry`] at the configured
    /// registry address and an empty [`NativeBank`].
    pub fn in_memory(config: EscrowConfig) -> Result<Self, ConfigError> {
        let registry = TitleRegistry::new(config.nft_address);
        EscrowLedger::new(config, registry, NativeBank::new())
    }

    /// Mints currency into `account` (genesis allocation or faucet).
    /// Returns the new balance.
    ///
    /// # Errors
    ///
    /// [`BankError::ReservedAccount`] for the custody account, or
    /// [`BankError::Overflow`].
    pub fn fund(&mut self, account: Address, amount: u64) -> Result<u64, BankError> {
        if account == self.config.ledger {
            return Err(BankError::ReservedAccount(account));
        }
        self.bank.credit(account, amount)
    }

    /// Flags `account` as refusing incoming payments, or clears the flag.
    ///
    /// # Errors
    ///
    /// [`BankError::ReservedAccount`] for the custody account.
    pub fn set_rejecting(&mut self, account: Address, rejecting: bool) -> Result<(), BankError> {
        if account == self.config.ledger {
            return Err(BankError::ReservedAccount(account));
        }
        self.bank.set_rejecting(account, rejecting);
        Ok(())
    }
}

impl<R, B> EscrowLedger<R, B>
where
    R: AssetRegistry + Clone,
    B: Bank + Clone,
{
    /// Deploys a ledger over the given registry and bank.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid or the
    /// registry's address does not match `config.nft_address`.
    pub fn new(config: EscrowConfig, registry: R, bank: B) -> Result<Self, ConfigError> {
        config.validate()?;
        if registry.address() != config.nft_address {
            return Err(ConfigError::RegistryMismatch {
                configured: config.nft_address,
                actual: registry.address(),
            });
        }

        tracing::info!(
            ledger = %config.ledger,
            registry = %config.nft_address,
            seller = %config.seller,
            inspector = %config.inspector,
            lender = %config.lender,
            "escrow ledger deployed"
        );

        Ok(Self {
            config,
            registry,
            bank,
            listings: BTreeMap::new(),
            journal: Vec::new(),
        })
    }

    // -- Mutating operations ------------------------------------------------

    /// Lists `asset_id` for sale to `buyer` and takes custody of it.
    ///
    /// The caller must be the configured seller and the asset's current
    /// owner, and must have approved the ledger on the registry beforehand.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::Unauthorized`] if the caller is not the seller or
    ///   does not own the asset.
    /// - [`EscrowError::AlreadyListed`] if the asset was ever listed here.
    /// - [`EscrowError::InvalidTerms`] for a zero price, an earnest above
    ///   the price, or an invalid buyer.
    /// - [`EscrowError::UnknownAsset`] if the registry never minted it.
    /// - [`EscrowError::TransferFailed`] if the registry refuses custody.
    pub fn list(
        &mut self,
        caller: Address,
        asset_id: AssetId,
        buyer: Address,
        purchase_price: u64,
        escrow_amount: u64,
    ) -> Result<(), EscrowError> {
        self.transact(Operation::List, asset_id, |ledger| {
            authorize(Operation::List, &caller, &ledger.parties(None))?;

            if ledger.listings.contains_key(&asset_id) {
                return Err(EscrowError::AlreadyListed(asset_id));
            }
            validate_terms(
                &ledger.config.ledger,
                &caller,
                &buyer,
                purchase_price,
                escrow_amount,
            )?;

            let owner = match ledger.registry.owner_of(asset_id) {
                Ok(owner) => owner,
                Err(RegistryError::UnknownAsset(_)) => {
                    return Err(EscrowError::UnknownAsset(asset_id))
                }
                Err(other) => return Err(other.into()),
            };
            if owner != caller {
                return Err(EscrowError::Unauthorized {
                    operation: Operation::List,
                    caller,
                });
            }

            let now = Utc::now();
            ledger.listings.insert(
                asset_id,
                Listing {
                    asset_id,
                    seller: caller,
                    buyer,
                    purchase_price,
                    escrow_amount,
                    status: ListingStatus::Pending,
                    inspection_passed: false,
                    approvals: Approvals::default(),
                    deposits: BTreeMap::new(),
                    earnest_paid: 0,
                    listed_at: now,
                    updated_at: now,
                },
            );
            ledger.emit(EscrowEvent::Listed {
                asset_id,
                seller: caller,
                buyer,
                purchase_price,
                escrow_amount,
            });

            let custody = ledger.config.ledger;
            ledger
                .registry
                .transfer_from(custody, caller, custody, asset_id)?;

            tracing::info!(asset_id, seller = %caller, %buyer, purchase_price, escrow_amount, "asset listed");
            Ok(())
        })
    }

    /// Buyer pays the earnest deposit. `value` is the attached payment.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::NotListed`] if there is no pending listing.
    /// - [`EscrowError::Unauthorized`] if the caller is not the buyer.
    /// - [`EscrowError::InsufficientPayment`] if `value` is below the
    ///   listing's escrow amount.
    /// - [`EscrowError::TransferFailed`] if the buyer cannot pay.
    pub fn deposit_earnest(
        &mut self,
        caller: Address,
        asset_id: AssetId,
        value: u64,
    ) -> Result<(), EscrowError> {
        self.transact(Operation::DepositEarnest, asset_id, |ledger| {
            let required = {
                let listing = ledger.pending_listing(asset_id)?;
                authorize(
                    Operation::DepositEarnest,
                    &caller,
                    &ledger.parties(Some(listing)),
                )?;
                listing.escrow_amount
            };
            if value < required {
                return Err(EscrowError::InsufficientPayment {
                    required,
                    provided: value,
                });
            }

            let listing = ledger.pending_listing_mut(asset_id)?;
            listing.credit(caller, value)?;
            listing.earnest_paid = listing
                .earnest_paid
                .checked_add(value)
                .ok_or(EscrowError::AmountOverflow)?;
            ledger.emit(EscrowEvent::EarnestDeposited {
                asset_id,
                buyer: caller,
                amount: value,
            });

            let custody = ledger.config.ledger;
            ledger.bank.transfer(caller, custody, value)?;

            tracing::info!(asset_id, buyer = %caller, amount = value, "earnest deposited");
            Ok(())
        })
    }

    /// Buyer or lender adds funds towards the purchase price.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::NotListed`] if there is no pending listing.
    /// - [`EscrowError::Unauthorized`] if the caller is neither buyer nor lender.
    /// - [`EscrowError::InsufficientPayment`] for a zero contribution.
    /// - [`EscrowError::TransferFailed`] if the contributor cannot pay.
    pub fn contribute(
        &mut self,
        caller: Address,
        asset_id: AssetId,
        value: u64,
    ) -> Result<(), EscrowError> {
        self.transact(Operation::Contribute, asset_id, |ledger| {
            {
                let listing = ledger.pending_listing(asset_id)?;
                authorize(
                    Operation::Contribute,
                    &caller,
                    &ledger.parties(Some(listing)),
                )?;
            }
            if value == 0 {
                return Err(EscrowError::InsufficientPayment {
                    required: 1,
                    provided: 0,
                });
            }

            ledger.pending_listing_mut(asset_id)?.credit(caller, value)?;
            ledger.emit(EscrowEvent::FundsContributed {
                asset_id,
                contributor: caller,
                amount: value,
            });

            let custody = ledger.config.ledger;
            ledger.bank.transfer(caller, custody, value)?;

            tracing::info!(asset_id, contributor = %caller, amount = value, "funds contributed");
            Ok(())
        })
    }

    /// Inspector records the inspection result. May be revised until the
    /// listing becomes terminal.
    ///
    /// # Errors
    ///
    /// [`EscrowError::NotListed`] or [`EscrowError::Unauthorized`].
    pub fn update_inspection_status(
        &mut self,
        caller: Address,
        asset_id: AssetId,
        passed: bool,
    ) -> Result<(), EscrowError> {
        self.transact(Operation::UpdateInspection, asset_id, |ledger| {
            {
                let listing = ledger.pending_listing(asset_id)?;
                authorize(
                    Operation::UpdateInspection,
                    &caller,
                    &ledger.parties(Some(listing)),
                )?;
            }

            let listing = ledger.pending_listing_mut(asset_id)?;
            listing.inspection_passed = passed;
            listing.updated_at = Utc::now();
            ledger.emit(EscrowEvent::InspectionUpdated { asset_id, passed });

            tracing::info!(asset_id, passed, "inspection status updated");
            Ok(())
        })
    }

    /// Buyer, seller, or lender approves the sale. Idempotent.
    ///
    /// Returns the approval slots that the caller filled.
    ///
    /// # Errors
    ///
    /// [`EscrowError::NotListed`] or [`EscrowError::Unauthorized`].
    pub fn approve_sale(
        &mut self,
        caller: Address,
        asset_id: AssetId,
    ) -> Result<Vec<Role>, EscrowError> {
        self.transact(Operation::ApproveSale, asset_id, |ledger| {
            let roles = {
                let listing = ledger.pending_listing(asset_id)?;
                authorize(
                    Operation::ApproveSale,
                    &caller,
                    &ledger.parties(Some(listing)),
                )?
            };

            let listing = ledger.pending_listing_mut(asset_id)?;
            for role in &roles {
                listing.approvals.set(*role);
            }
            listing.updated_at = Utc::now();
            ledger.emit(EscrowEvent::SaleApproved {
                asset_id,
                party: caller,
                roles: roles.clone(),
            });

            tracing::info!(asset_id, party = %caller, ?roles, "sale approved");
            Ok(roles)
        })
    }

    /// Seller closes the sale: pays the seller, returns any excess custody to
    /// the buyer, and transfers the asset to the buyer.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::NotListed`] if there is no pending listing.
    /// - [`EscrowError::Unauthorized`] if the caller is not the seller.
    /// - [`EscrowError::NotReady`] listing every unmet condition.
    /// - [`EscrowError::TransferFailed`] if any payout or the asset transfer
    ///   is refused; nothing changes in that case.
    pub fn finalize_sale(&mut self, caller: Address, asset_id: AssetId) -> Result<(), EscrowError> {
        self.transact(Operation::FinalizeSale, asset_id, |ledger| {
            {
                let listing = ledger.pending_listing(asset_id)?;
                authorize(
                    Operation::FinalizeSale,
                    &caller,
                    &ledger.parties(Some(listing)),
                )?;
                let unmet = listing.unmet_conditions();
                if !unmet.is_empty() {
                    return Err(EscrowError::NotReady { unmet });
                }
            }

            // Effects: the listing is terminal before any payout.
            let listing = ledger.pending_listing_mut(asset_id)?;
            let held = listing.deposited();
            let (seller, buyer, price) = (listing.seller, listing.buyer, listing.purchase_price);
            let excess = held
                .checked_sub(price)
                .ok_or(EscrowError::AmountOverflow)?;
            listing.deposits.clear();
            listing.status = ListingStatus::Finalized;
            listing.updated_at = Utc::now();
            ledger.emit(EscrowEvent::SaleFinalized {
                asset_id,
                buyer,
                seller,
                purchase_price: price,
                refunded: excess,
            });

            // Interactions.
            let custody = ledger.config.ledger;
            ledger.bank.transfer(custody, seller, price)?;
            if excess > 0 {
                ledger.bank.transfer(custody, buyer, excess)?;
            }
            ledger
                .registry
                .transfer_from(custody, custody, buyer, asset_id)?;

            tracing::info!(asset_id, %seller, %buyer, price, excess, "sale finalized");
            Ok(())
        })
    }

    /// Buyer or seller aborts the sale and the asset returns to the seller.
    ///
    /// Before inspection has passed every contributor is refunded in full.
    /// After it has passed, the buyer's earnest is forfeited to the seller
    /// and all other deposits are refunded.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::NotListed`] if there is no pending listing.
    /// - [`EscrowError::Unauthorized`] if the caller is neither buyer nor seller.
    /// - [`EscrowError::TransferFailed`] if a refund, the forfeit, or the
    ///   asset return is refused; nothing changes in that case.
    pub fn cancel_sale(&mut self, caller: Address, asset_id: AssetId) -> Result<(), EscrowError> {
        self.transact(Operation::CancelSale, asset_id, |ledger| {
            {
                let listing = ledger.pending_listing(asset_id)?;
                authorize(
                    Operation::CancelSale,
                    &caller,
                    &ledger.parties(Some(listing)),
                )?;
            }

            let listing = ledger.pending_listing_mut(asset_id)?;
            let (seller, buyer) = (listing.seller, listing.buyer);
            let mut refunds = std::mem::take(&mut listing.deposits);
            let forfeited = if listing.inspection_passed {
                let buyer_share = refunds.entry(buyer).or_insert(0);
                let forfeit = listing.earnest_paid.min(*buyer_share);
                *buyer_share -= forfeit;
                forfeit
            } else {
                0
            };
            let refunded = refunds
                .values()
                .try_fold(0u64, |acc, amount| acc.checked_add(*amount))
                .ok_or(EscrowError::AmountOverflow)?;
            listing.status = ListingStatus::Cancelled;
            listing.updated_at = Utc::now();
            ledger.emit(EscrowEvent::SaleCancelled {
                asset_id,
                forfeited,
                refunded,
            });

            let custody = ledger.config.ledger;
            if forfeited > 0 {
                ledger.bank.transfer(custody, seller, forfeited)?;
            }
            for (contributor, amount) in refunds {
                if amount > 0 {
                    ledger.bank.transfer(custody, contributor, amount)?;
                }
            }
            ledger
                .registry
                .transfer_from(custody, custody, seller, asset_id)?;

            tracing::info!(asset_id, cancelled_by = %caller, forfeited, refunded, "sale cancelled");
            Ok(())
        })
    }

    // -- Queries ------------------------------------------------------------

    /// `true` while `asset_id` has a pending listing.
    pub fn is_listed(&self, asset_id: AssetId) -> bool {
        self.listings
            .get(&asset_id)
            .map(Listing::is_listed)
            .unwrap_or(false)
    }

    pub fn buyer(&self, asset_id: AssetId) -> Option<Address> {
        self.listings.get(&asset_id).map(|l| l.buyer)
    }

    pub fn purchase_price(&self, asset_id: AssetId) -> Option<u64> {
        self.listings.get(&asset_id).map(|l| l.purchase_price)
    }

    pub fn escrow_amount(&self, asset_id: AssetId) -> Option<u64> {
        self.listings.get(&asset_id).map(|l| l.escrow_amount)
    }

    pub fn inspection_passed(&self, asset_id: AssetId) -> bool {
        self.listings
            .get(&asset_id)
            .map(|l| l.inspection_passed)
            .unwrap_or(false)
    }

    /// Whether `party` has approved the sale of `asset_id`.
    ///
    /// `false` for addresses that hold no approving role.
    pub fn approval(&self, asset_id: AssetId, party: &Address) -> bool {
        let Some(listing) = self.listings.get(&asset_id) else {
            return false;
        };
        self.parties(Some(listing))
            .roles_of(party)
            .into_iter()
            .any(|role| listing.approvals.get(role))
    }

    /// Funds held for pending listings, summed over all listings.
    pub fn get_balance(&self) -> u64 {
        self.listings
            .values()
            .filter(|l| l.is_listed())
            .fold(0u64, |acc, l| acc.saturating_add(l.deposited()))
    }

    /// The ledger's actual balance in the bank.
    pub fn custody_balance(&self) -> u64 {
        self.bank.balance_of(&self.config.ledger)
    }

    /// Checks that listing deposits are fully backed by the custody account.
    pub fn verify_custody(&self) -> bool {
        self.get_balance() <= self.custody_balance()
    }

    pub fn nft_address(&self) -> Address {
        self.config.nft_address
    }

    pub fn seller(&self) -> Address {
        self.config.seller
    }

    pub fn inspector(&self) -> Address {
        self.config.inspector
    }

    pub fn lender(&self) -> Address {
        self.config.lender
    }

    /// The ledger's own custody address.
    pub fn address(&self) -> Address {
        self.config.ledger
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    /// The full listing record, including terminal ones.
    pub fn listing(&self, asset_id: AssetId) -> Option<&Listing> {
        self.listings.get(&asset_id)
    }

    /// All listing records ordered by asset id.
    pub fn listings(&self) -> impl Iterator<Item = &Listing> {
        self.listings.values()
    }

    /// The full event journal.
    pub fn events(&self) -> &[EventRecord] {
        &self.journal
    }

    /// Events with `sequence >= from`.
    pub fn events_since(&self, from: u64) -> &[EventRecord] {
        let start = usize::try_from(from)
            .unwrap_or(usize::MAX)
            .min(self.journal.len());
        &self.journal[start..]
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn bank(&self) -> &B {
        &self.bank
    }

    // -- Registry calls made by parties ---------------------------------------

    /// Mints a new title to `caller`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ReservedCaller`] if `caller` is the custody account.
    pub fn mint_title(&mut self, caller: Address, uri: &str) -> Result<AssetId, RegistryError> {
        self.refuse_custody_caller(caller)?;
        let asset_id = self.registry.mint(caller, uri)?;
        tracing::debug!(asset_id, owner = %caller, "title minted");
        Ok(asset_id)
    }

    /// Owner approves `operator` to move one of its titles. Sellers call this
    /// with the ledger's address before listing.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ReservedCaller`] if `caller` is the custody account,
    /// otherwise whatever the registry reports.
    pub fn approve_title(
        &mut self,
        caller: Address,
        operator: Address,
        asset_id: AssetId,
    ) -> Result<(), RegistryError> {
        self.refuse_custody_caller(caller)?;
        self.registry.approve(caller, operator, asset_id)
    }

    fn refuse_custody_caller(&self, caller: Address) -> Result<(), RegistryError> {
        if caller == self.config.ledger {
            return Err(RegistryError::ReservedCaller(caller));
        }
        Ok(())
    }

    // -- Internals ----------------------------------------------------------

    /// Runs `call` as an all-or-nothing transaction.
    fn transact<T>(
        &mut self,
        operation: Operation,
        asset_id: AssetId,
        call: impl FnOnce(&mut Self) -> Result<T, EscrowError>,
    ) -> Result<T, EscrowError> {
        let registry = self.registry.clone();
        let bank = self.bank.clone();
        let listings = self.listings.clone();
        let journal_len = self.journal.len();

        match call(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.registry = registry;
                self.bank = bank;
                self.listings = listings;
                self.journal.truncate(journal_len);
                tracing::warn!(%operation, asset_id, error = %err, "escrow call reverted");
                Err(err)
            }
        }
    }

    fn parties(&self, listing: Option<&Listing>) -> Parties {
        Parties {
            seller: listing.map(|l| l.seller).unwrap_or(self.config.seller),
            buyer: listing.map(|l| l.buyer),
            inspector: self.config.inspector,
            lender: self.config.lender,
        }
    }

    fn pending_listing(&self, asset_id: AssetId) -> Result<&Listing, EscrowError> {
        self.listings
            .get(&asset_id)
            .filter(|l| l.is_listed())
            .ok_or(EscrowError::NotListed(asset_id))
    }

    fn pending_listing_mut(&mut self, asset_id: AssetId) -> Result<&mut Listing, EscrowError> {
        self.listings
            .get_mut(&asset_id)
            .filter(|l| l.is_listed())
            .ok_or(EscrowError::NotListed(asset_id))
    }

    fn emit(&mut self, event: EscrowEvent) {
        let sequence = self.journal.len() as u64;
        self.journal.push(EventRecord::new(sequence, event));
    }
}

fn validate_terms(
    custody: &Address,
    seller: &Address,
    buyer: &Address,
    purchase_price: u64,
    escrow_amount: u64,
) -> Result<(), EscrowError> {
    if purchase_price == 0 {
        return Err(EscrowError::InvalidTerms(
            "purchase price must be greater than zero".into(),
        ));
    }
    if escrow_amount > purchase_price {
        return Err(EscrowError::InvalidTerms(format!(
            "escrow amount {escrow_amount} exceeds purchase price {purchase_price}"
        )));
    }
    if buyer.is_zero() {
        return Err(EscrowError::InvalidTerms("buyer must not be zero".into()));
    }
    if buyer == seller {
        return Err(EscrowError::InvalidTerms(
            "buyer must differ from seller".into(),
        ));
    }
    if buyer == custody {
        return Err(EscrowError::InvalidTerms(
            "buyer must not be the escrow custody account".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "ipfs://title/1";

    struct Fixture {
        ledger: DevnetLedger,
        buyer: Address,
        asset_id: AssetId,
    }

    fn fixture(price: u64, escrow: u64) -> Fixture {
        let config = EscrowConfig::devnet();
        let mut ledger = DevnetLedger::in_memory(config.clone()).unwrap();
        let buyer = Address::from_label("buyer");

        let asset_id = ledger.mint_title(config.seller, URI).unwrap();
        ledger
            .approve_title(config.seller, config.ledger, asset_id)
            .unwrap();
        ledger.fund(buyer, 1_000).unwrap();
        ledger.fund(config.lender, 1_000).unwrap();
        ledger
            .list(config.seller, asset_id, buyer, price, escrow)
            .unwrap();

        Fixture {
            ledger,
            buyer,
            asset_id,
        }
    }

    #[test]
    fn list_takes_custody() {
        let f = fixture(10, 5);
        assert!(f.ledger.is_listed(f.asset_id));
        assert_eq!(
            f.ledger.registry().owner_of(f.asset_id).unwrap(),
            f.ledger.address()
        );
        let listing = f.ledger.listing(f.asset_id).unwrap();
        assert_eq!(listing.status, ListingStatus::Pending);
        assert_eq!(listing.approvals, Approvals::default());
        assert!(!listing.inspection_passed);
    }

    #[test]
    fn list_without_registry_approval_fails_and_leaves_no_record() {
        let config = EscrowConfig::devnet();
        let mut ledger = DevnetLedger::in_memory(config.clone()).unwrap();
        let id = ledger.mint_title(config.seller, URI).unwrap();

        let err = ledger
            .list(config.seller, id, Address::from_label("buyer"), 10, 5)
            .unwrap_err();
        assert!(matches!(err, EscrowError::TransferFailed(_)));
        assert!(ledger.listing(id).is_none());
        assert!(ledger.events().is_empty());
        assert_eq!(ledger.registry().owner_of(id).unwrap(), config.seller);
    }

    #[test]
    fn list_rejects_bad_terms() {
        let config = EscrowConfig::devnet();
        let mut ledger = DevnetLedger::in_memory(config.clone()).unwrap();
        let id = ledger.mint_title(config.seller, URI).unwrap();
        let buyer = Address::from_label("buyer");

        assert!(matches!(
            ledger.list(config.seller, id, buyer, 5, 10),
            Err(EscrowError::InvalidTerms(_))
        ));
        assert!(matches!(
            ledger.list(config.seller, id, buyer, 0, 0),
            Err(EscrowError::InvalidTerms(_))
        ));
        assert!(matches!(
            ledger.list(config.seller, id, config.seller, 10, 5),
            Err(EscrowError::InvalidTerms(_))
        ));
        assert!(matches!(
            ledger.list(config.seller, id, config.ledger, 10, 5),
            Err(EscrowError::InvalidTerms(_))
        ));
        assert!(ledger.listing(id).is_none());
    }

    #[test]
    fn custody_account_cannot_act_outside_the_ledger() {
        let mut f = fixture(10, 5);
        let custody = f.ledger.address();
        let thief = Address::from_label("thief");
        f.ledger.deposit_earnest(f.buyer, f.asset_id, 5).unwrap();

        assert_eq!(
            f.ledger.approve_title(custody, thief, f.asset_id),
            Err(RegistryError::ReservedCaller(custody))
        );
        assert_eq!(
            f.ledger.mint_title(custody, URI),
            Err(RegistryError::ReservedCaller(custody))
        );
        assert_eq!(
            f.ledger.fund(custody, 1),
            Err(BankError::ReservedAccount(custody))
        );
        assert_eq!(
            f.ledger.set_rejecting(custody, true),
            Err(BankError::ReservedAccount(custody))
        );

        assert_eq!(f.ledger.registry().owner_of(f.asset_id).unwrap(), custody);
        assert_eq!(f.ledger.custody_balance(), 5);
        assert!(f.ledger.verify_custody());
        f.ledger.cancel_sale(f.buyer, f.asset_id).unwrap();
        assert_eq!(f.ledger.bank().balance_of(&f.buyer), 1_000);
    }

    #[test]
    fn list_unknown_asset() {
        let config = EscrowConfig::devnet();
        let mut ledger = DevnetLedger::in_memory(config.clone()).unwrap();
        assert_eq!(
            ledger.list(config.seller, 42, Address::from_label("buyer"), 10, 5),
            Err(EscrowError::UnknownAsset(42))
        );
    }

    #[test]
    fn relisting_is_rejected() {
        let mut f = fixture(10, 5);
        let seller = f.ledger.seller();
        assert_eq!(
            f.ledger.list(seller, f.asset_id, f.buyer, 10, 5),
            Err(EscrowError::AlreadyListed(f.asset_id))
        );
    }

    #[test]
    fn approvals_accumulate_by_role() {
        let mut f = fixture(10, 5);
        let (seller, lender) = (f.ledger.seller(), f.ledger.lender());

        assert_eq!(
            f.ledger.approve_sale(f.buyer, f.asset_id).unwrap(),
            vec![Role::Buyer]
        );
        f.ledger.approve_sale(seller, f.asset_id).unwrap();
        assert!(!f.ledger.listing(f.asset_id).unwrap().approvals.unanimous());
        f.ledger.approve_sale(lender, f.asset_id).unwrap();
        assert!(f.ledger.listing(f.asset_id).unwrap().approvals.unanimous());
        assert!(f.ledger.approval(f.asset_id, &lender));
        assert!(!f.ledger.approval(f.asset_id, &f.ledger.inspector()));
    }

    #[test]
    fn unmet_conditions_shrink_as_gates_open() {
        let mut f = fixture(10, 5);
        let (inspector, seller, lender) = (
            f.ledger.inspector(),
            f.ledger.seller(),
            f.ledger.lender(),
        );
        assert_eq!(
            f.ledger.listing(f.asset_id).unwrap().unmet_conditions().len(),
            5
        );

        f.ledger
            .update_inspection_status(inspector, f.asset_id, true)
            .unwrap();
        f.ledger.approve_sale(f.buyer, f.asset_id).unwrap();
        f.ledger.approve_sale(seller, f.asset_id).unwrap();
        f.ledger.approve_sale(lender, f.asset_id).unwrap();
        f.ledger.deposit_earnest(f.buyer, f.asset_id, 5).unwrap();
        assert_eq!(
            f.ledger.listing(f.asset_id).unwrap().unmet_conditions(),
            vec![SaleCondition::FullyFunded]
        );

        f.ledger.contribute(lender, f.asset_id, 5).unwrap();
        assert!(f.ledger.listing(f.asset_id).unwrap().is_ready());
    }

    #[test]
    fn excess_funding_is_returned_to_buyer() {
        let mut f = fixture(10, 5);
        let (inspector, seller, lender) = (
            f.ledger.inspector(),
            f.ledger.seller(),
            f.ledger.lender(),
        );
        f.ledger.deposit_earnest(f.buyer, f.asset_id, 8).unwrap();
        f.ledger.contribute(lender, f.asset_id, 5).unwrap();
        f.ledger
            .update_inspection_status(inspector, f.asset_id, true)
            .unwrap();
        for party in [f.buyer, seller, lender] {
            f.ledger.approve_sale(party, f.asset_id).unwrap();
        }

        f.ledger.finalize_sale(seller, f.asset_id).unwrap();
        assert_eq!(f.ledger.bank().balance_of(&seller), 10);
        assert_eq!(f.ledger.bank().balance_of(&f.buyer), 1_000 - 8 + 3);
        assert_eq!(f.ledger.custody_balance(), 0);
        match &f.ledger.events().last().unwrap().event {
            EscrowEvent::SaleFinalized { refunded, .. } => assert_eq!(*refunded, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn failed_call_discards_its_events() {
        let mut f = fixture(10, 5);
        let before = f.ledger.events().len();
        assert!(f.ledger.deposit_earnest(f.buyer, f.asset_id, 2_000).is_err());
        assert_eq!(f.ledger.events().len(), before);
        assert_eq!(f.ledger.get_balance(), 0);
    }

    #[test]
    fn events_since_slices_journal() {
        let mut f = fixture(10, 5);
        f.ledger.deposit_earnest(f.buyer, f.asset_id, 5).unwrap();
        assert_eq!(f.ledger.events().len(), 2);
        assert_eq!(f.ledger.events_since(1).len(), 1);
        assert_eq!(f.ledger.events_since(1)[0].sequence, 1);
        assert!(f.ledger.events_since(99).is_empty());
    }

    #[test]
    fn registry_mismatch_rejected() {
        let config = EscrowConfig::devnet();
        let registry = TitleRegistry::new(Address::from_label("elsewhere"));
        let err = EscrowLedger::new(config, registry, NativeBank::new()).unwrap_err();
        assert!(matches!(err, ConfigError::RegistryMismatch { .. }));
    }
}
