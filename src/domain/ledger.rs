use super::money::{Amount, Balance};
use super::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Idempotency key of a money movement: an order id, a sub-order id, or a
/// generated id for recharges and withdrawals.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradeId(pub String);

impl TradeId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<uuid::Uuid> for TradeId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for TradeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    Recharge,
    Withdraw,
    PublishOrder,
    CompleteOrder,
    ReturnOrder,
    RechargeInProgress,
    WithdrawInProgress,
    RechargeFailed,
    WithdrawFailed,
}

/// Groups a marker type with the terminal types it may become. A trade id
/// holds at most one ledger entry per family.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TradeFamily {
    Recharge,
    Withdraw,
    PublishOrder,
    CompleteOrder,
    ReturnOrder,
}

impl TradeFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeFamily::Recharge => "recharge",
            TradeFamily::Withdraw => "withdraw",
            TradeFamily::PublishOrder => "publish_order",
            TradeFamily::CompleteOrder => "complete_order",
            TradeFamily::ReturnOrder => "return_order",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    Credit,
    Debit,
}

impl TradeType {
    pub fn family(self) -> TradeFamily {
        match self {
            TradeType::Recharge | TradeType::RechargeInProgress | TradeType::RechargeFailed => {
                TradeFamily::Recharge
            }
            TradeType::Withdraw | TradeType::WithdrawInProgress | TradeType::WithdrawFailed => {
                TradeFamily::Withdraw
            }
            TradeType::PublishOrder => TradeFamily::PublishOrder,
            TradeType::CompleteOrder => TradeFamily::CompleteOrder,
            TradeType::ReturnOrder => TradeFamily::ReturnOrder,
        }
    }

    pub fn direction(self) -> Direction {
        match self.family() {
            TradeFamily::Recharge | TradeFamily::CompleteOrder | TradeFamily::ReturnOrder => {
                Direction::Credit
            }
            TradeFamily::Withdraw | TradeFamily::PublishOrder => Direction::Debit,
        }
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            TradeType::RechargeInProgress | TradeType::WithdrawInProgress
        )
    }

    /// Whether an entry of this type currently counts towards the balance.
    pub fn is_effective(self) -> bool {
        !matches!(
            self,
            TradeType::RechargeInProgress | TradeType::RechargeFailed | TradeType::WithdrawFailed
        )
    }

    /// Types that may be written through the plain debit/credit entry points.
    pub fn is_direct(self) -> bool {
        matches!(
            self,
            TradeType::Recharge
                | TradeType::Withdraw
                | TradeType::PublishOrder
                | TradeType::CompleteOrder
                | TradeType::ReturnOrder
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub trade_id: TradeId,
    pub family: TradeFamily,
}

impl LedgerKey {
    pub fn new(trade_id: TradeId, family: TradeFamily) -> Self {
        Self { trade_id, family }
    }

    /// Byte encoding used as a storage key.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}/{}", self.trade_id, self.family.as_str()).into_bytes()
    }
}

/// One money movement of one user.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerEntry {
    pub trade_id: TradeId,
    pub user: UserId,
    pub trade_type: TradeType,
    /// Signed amount in minor units: positive credits, negative debits.
    pub amount: i64,
    /// Balance of the user once this entry was applied.
    pub balance_after: Balance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        trade_id: TradeId,
        user: UserId,
        trade_type: TradeType,
        amount: Amount,
        balance_after: Balance,
        now: DateTime<Utc>,
    ) -> Self {
        let signed = match trade_type.direction() {
            Direction::Credit => amount.value(),
            Direction::Debit => -amount.value(),
        };
        Self {
            trade_id,
            user,
            trade_type,
            amount: signed,
            balance_after,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.trade_id.clone(), self.trade_type.family())
    }

    /// Contribution of this entry to the user's balance.
    pub fn effective_amount(&self) -> i64 {
        if self.trade_type.is_effective() {
            self.amount
        } else {
            0
        }
    }

    /// The unsigned amount this entry moves (or would move).
    pub fn magnitude(&self) -> Result<Amount, crate::error::DispatchError> {
        Amount::new(self.amount.abs())
    }
}

/// Sum of the effective amounts, which must equal the user's balance.
pub fn ledger_total<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> i64 {
    entries.into_iter().map(LedgerEntry::effective_amount).sum()
}

#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub user: Option<UserId>,
    pub trade_types: Vec<TradeType>,
}

impl LedgerFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.user.is_none_or(|user| entry.user == user)
            && (self.trade_types.is_empty() || self.trade_types.contains(&entry.trade_type))
    }
}
