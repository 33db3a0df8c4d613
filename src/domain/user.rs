use super::money::Balance;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = u64;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Worker,
    Auditor,
    Administrator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Publisher => "publisher",
            Role::Worker => "worker",
            Role::Auditor => "auditor",
            Role::Administrator => "administrator",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "publisher" => Ok(Role::Publisher),
            "worker" => Ok(Role::Worker),
            "auditor" => Ok(Role::Auditor),
            "administrator" | "admin" => Ok(Role::Administrator),
            other => Err(crate::error::DispatchError::Validation(format!(
                "Unknown role: {other}"
            ))),
        }
    }
}

/// A user together with their wallet.
///
/// The balance is readable by anyone but only the wallet service rewrites it,
/// always in the same transaction as the ledger entry that explains it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct User {
    pub id: UserId,
    pub role: Role,
    /// External identity handle at the payment gateway (payer / payee).
    pub handle: String,
    pub name: String,
    balance: Balance,
}

impl User {
    pub fn new(id: UserId, role: Role, handle: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            role,
            handle: handle.into(),
            name: name.into(),
            balance: Balance::ZERO,
        }
    }

    pub fn balance(&self) -> Balance {
        self.balance
    }

    pub(crate) fn set_balance(&mut self, balance: Balance) {
        self.balance = balance;
    }
}
