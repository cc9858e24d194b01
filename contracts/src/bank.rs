//! # Native Currency Bank
//!
//! Holds the native currency balance of every address, including the escrow
//! ledger's own custody account. The ledger never keeps coins "inside" a
//! listing: it moves them between bank accounts and keeps a per-listing
//! record of who contributed what.
//!
//! A recipient can refuse an incoming payment (think of a contract without a
//! payable fallback). [`NativeBank`] models this with a set of rejecting
//! addresses, which is how the escrow's `TransferFailed` path gets exercised.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;

/// Errors that can occur during currency transfers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BankError {
    /// The sender does not hold enough funds.
    #[error("insufficient funds in {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        /// The account being debited.
        account: Address,
        /// Its current balance.
        available: u64,
        /// The amount requested.
        requested: u64,
    },

    /// The recipient refused the payment.
    #[error("recipient {0} rejected the payment")]
    Rejected(Address),

    /// Crediting the recipient would overflow `u64`.
    #[error("balance overflow crediting {account}: current {current}, credit {credit}")]
    Overflow {
        /// The account being credited.
        account: Address,
        /// Its balance before the failed credit.
        current: u64,
        /// The amount that caused the overflow.
        credit: u64,
    },

    /// The escrow custody account only moves funds through the ledger.
    #[error("{0} is the escrow custody account")]
    ReservedAccount(Address),
}

/// The currency interface consumed by the escrow ledger.
pub trait Bank {
    /// Current balance of `account`. Unknown accounts hold zero.
    fn balance_of(&self, account: &Address) -> u64;

    /// Moves `amount` from `from` to `to`. All-or-nothing.
    fn transfer(&mut self, from: Address, to: Address, amount: u64) -> Result<(), BankError>;
}

/// In-memory currency ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NativeBank {
    balances: BTreeMap<Address, u64>,
    rejecting: BTreeSet<Address>,
}

impl NativeBank {
    /// Creates an empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints `amount` into `account` (genesis allocation or devnet faucet).
    ///
    /// Returns the new balance.
    pub fn credit(&mut self, account: Address, amount: u64) -> Result<u64, BankError> {
        let balance = self.balances.entry(account).or_insert(0);
        let updated = balance.checked_add(amount).ok_or(BankError::Overflow {
            account,
            current: *balance,
            credit: amount,
        })?;
        *balance = updated;
        Ok(updated)
    }

    /// Marks `account` as refusing (or accepting again) incoming payments.
    pub fn set_rejecting(&mut self, account: Address, rejecting: bool) {
        if rejecting {
            self.rejecting.insert(account);
        } else {
            self.rejecting.remove(&account);
        }
    }

    /// Returns `true` if `account` refuses incoming payments.
    pub fn is_rejecting(&self, account: &Address) -> bool {
        self.rejecting.contains(account)
    }

    /// Sum of all balances.
    pub fn total_supply(&self) -> u64 {
        self.balances.values().fold(0u64, |acc, b| acc.saturating_add(*b))
    }
}

impl Bank for NativeBank {
    fn balance_of(&self, account: &Address) -> u64 {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn transfer(&mut self, from: Address, to: Address, amount: u64) -> Result<(), BankError> {
        if self.rejecting.contains(&to) {
            return Err(BankError::Rejected(to));
        }

        let available = self.balance_of(&from);
        if available < amount {
            return Err(BankError::InsufficientFunds {
                account: from,
                available,
                requested: amount,
            });
        }
        if from == to {
            return Ok(());
        }

        let current = self.balance_of(&to);
        let credited = current.checked_add(amount).ok_or(BankError::Overflow {
            account: to,
            current,
            credit: amount,
        })?;

        self.balances.insert(from, available - amount);
        self.balances.insert(to, credited);
        Ok(())
    }
}
