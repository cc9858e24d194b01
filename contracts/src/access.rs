//! # Access Policy
//!
//! Which role may call which operation is a table, not a scatter of inline
//! `if caller != ...` checks. The ledger resolves the caller against the
//! parties of the listing and asks [`authorize`] before running any
//! operation body.
//!
//! One address may hold several roles (a buyer who is also the lender, for
//! instance). [`authorize`] returns every permitted role the caller holds so
//! that `approve_sale` can fill all of the caller's approval slots at once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::EscrowError;

/// A party role in an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Prior owner of the asset.
    Seller,
    /// The party authorized to purchase.
    Buyer,
    /// The party recording the inspection result.
    Inspector,
    /// The party financing the purchase.
    Lender,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Seller => write!(f, "seller"),
            Role::Buyer => write!(f, "buyer"),
            Role::Inspector => write!(f, "inspector"),
            Role::Lender => write!(f, "lender"),
        }
    }
}

/// A state-mutating ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    List,
    DepositEarnest,
    Contribute,
    UpdateInspection,
    ApproveSale,
    FinalizeSale,
    CancelSale,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::List => "list",
            Operation::DepositEarnest => "depositEarnest",
            Operation::Contribute => "contribute",
            Operation::UpdateInspection => "updateInspectionStatus",
            Operation::ApproveSale => "approveSale",
            Operation::FinalizeSale => "finalizeSale",
            Operation::CancelSale => "cancelSale",
        };
        f.write_str(name)
    }
}

/// The authorization table: each operation and the roles allowed to call it.
pub const POLICY: &[(Operation, &[Role])] = &[
    (Operation::List, &[Role::Seller]),
    (Operation::DepositEarnest, &[Role::Buyer]),
    (Operation::Contribute, &[Role::Buyer, Role::Lender]),
    (Operation::UpdateInspection, &[Role::Inspector]),
    (
        Operation::ApproveSale,
        &[Role::Buyer, Role::Seller, Role::Lender],
    ),
    (Operation::FinalizeSale, &[Role::Seller]),
    (Operation::CancelSale, &[Role::Seller, Role::Buyer]),
];

/// Returns the roles allowed to call `operation`.
pub fn allowed_roles(operation: Operation) -> &'static [Role] {
    POLICY
        .iter()
        .find(|(op, _)| *op == operation)
        .map(|(_, roles)| *roles)
        .unwrap_or(&[])
}

/// The addresses holding each role for one call.
///
/// `buyer` is `None` before a listing exists (i.e. for `list` itself).
#[derive(Debug, Clone, Copy)]
pub struct Parties {
    pub seller: Address,
    pub buyer: Option<Address>,
    pub inspector: Address,
    pub lender: Address,
}

impl Parties {
    /// Returns `true` if `caller` holds `role`.
    pub fn holds(&self, caller: &Address, role: Role) -> bool {
        match role {
            Role::Seller => self.seller == *caller,
            Role::Buyer => self.buyer.as_ref() == Some(caller),
            Role::Inspector => self.inspector == *caller,
            Role::Lender => self.lender == *caller,
        }
    }

    /// Every role `caller` holds, regardless of operation.
    pub fn roles_of(&self, caller: &Address) -> Vec<Role> {
        [Role::Seller, Role::Buyer, Role::Inspector, Role::Lender]
            .into_iter()
            .filter(|role| self.holds(caller, *role))
            .collect()
    }
}

/// Checks `caller` against the policy table.
///
/// Returns the permitted roles the caller holds (never empty on success).
pub fn authorize(
    operation: Operation,
    caller: &Address,
    parties: &Parties,
) -> Result<Vec<Role>, EscrowError> {
    let granted: Vec<Role> = allowed_roles(operation)
        .iter()
        .copied()
        .filter(|role| parties.holds(caller, *role))
        .collect();

    if granted.is_empty() {
        return Err(EscrowError::Unauthorized {
            operation,
            caller: *caller,
        });
    }
    Ok(granted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parties() -> Parties {
        Parties {
            seller: Address::from_label("seller"),
            buyer: Some(Address::from_label("buyer")),
            inspector: Address::from_label("inspector"),
            lender: Address::from_label("lender"),
        }
    }

    #[test]
    fn every_operation_has_a_policy_entry() {
        let ops = [
            Operation::List,
            Operation::DepositEarnest,
            Operation::Contribute,
            Operation::UpdateInspection,
            Operation::ApproveSale,
            Operation::FinalizeSale,
            Operation::CancelSale,
        ];
        for op in ops {
            assert!(!allowed_roles(op).is_empty(), "{op} has no roles");
        }
    }

    #[test]
    fn inspector_cannot_approve() {
        let p = parties();
        let err = authorize(Operation::ApproveSale, &p.inspector, &p).unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Unauthorized {
                operation: Operation::ApproveSale,
                ..
            }
        ));
    }

    #[test]
    fn only_inspector_updates_inspection() {
        let p = parties();
        assert_eq!(
            authorize(Operation::UpdateInspection, &p.inspector, &p).unwrap(),
            vec![Role::Inspector]
        );
        assert!(authorize(Operation::UpdateInspection, &p.seller, &p).is_err());
    }

    #[test]
    fn missing_buyer_never_matches() {
        let mut p = parties();
        p.buyer = None;
        let someone = Address::from_label("buyer");
        assert!(authorize(Operation::DepositEarnest, &someone, &p).is_err());
    }

    #[test]
    fn dual_role_caller_gets_both_slots() {
        let mut p = parties();
        p.lender = p.buyer.unwrap();
        let caller = p.lender;
        assert_eq!(
            authorize(Operation::ApproveSale, &caller, &p).unwrap(),
            vec![Role::Buyer, Role::Lender]
        );
        assert_eq!(p.roles_of(&caller), vec![Role::Buyer, Role::Lender]);
    }
}
