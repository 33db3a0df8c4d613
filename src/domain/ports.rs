use super::gateway::{
    BatchId, GatewayError, PaymentOutcome, PrepayToken, RawNotification, SettlementEvent,
    TransferStatus,
};
use super::ledger::{LedgerEntry, LedgerFilter, LedgerKey, TradeId};
use super::money::Amount;
use super::order::{
    MasterOrder, MasterOrderFilter, OrderId, SubOrder, SubOrderFilter, SubOrderId,
};
use super::user::{User, UserId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user(&self, id: UserId) -> Result<Option<User>>;
    async fn users(&self) -> Result<Vec<User>>;
    /// Fails with a validation error when the id is taken.
    async fn insert_user(&mut self, user: User) -> Result<()>;
    async fn update_user(&mut self, user: User) -> Result<()>;
}

/// Append-only money movement history.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Appends an entry unless one with the same key already exists.
    /// Returns `false` on a key collision, leaving the existing entry untouched.
    async fn append(&mut self, entry: LedgerEntry) -> Result<bool>;
    async fn ledger_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>>;
    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>>;
    /// Rewrites an existing entry. Only used to move an in-progress marker to
    /// its terminal type.
    async fn replace_entry(&mut self, entry: LedgerEntry) -> Result<()>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn master_order(&self, id: OrderId) -> Result<Option<MasterOrder>>;
    async fn master_orders(&self, filter: &MasterOrderFilter) -> Result<Vec<MasterOrder>>;
    async fn insert_master_order(&mut self, order: MasterOrder) -> Result<()>;
    async fn update_master_order(&mut self, order: MasterOrder) -> Result<()>;
    async fn sub_order(&self, id: SubOrderId) -> Result<Option<SubOrder>>;
    async fn sub_orders(&self, filter: &SubOrderFilter) -> Result<Vec<SubOrder>>;
    /// Inserts a sub-order, enforcing that a worker holds at most one
    /// capacity-holding sub-order per master order.
    async fn insert_sub_order(&mut self, sub: SubOrder) -> Result<()>;
    async fn update_sub_order(&mut self, sub: SubOrder) -> Result<()>;
}

/// One store transaction.
///
/// Reads observe the transaction's own writes. Nothing is visible to other
/// transactions until `commit`; dropping the value without committing rolls
/// every write back.
#[async_trait]
pub trait UnitOfWork: UserStore + LedgerStore + OrderRepository {
    async fn commit(&mut self) -> Result<()>;
}

/// The transactional store shared by every service and scheduler worker.
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_prepay_order(
        &self,
        payer: &str,
        trade_id: &TradeId,
        description: &str,
        amount: Amount,
    ) -> std::result::Result<PrepayToken, GatewayError>;

    async fn initiate_transfer(
        &self,
        payee: &str,
        trade_id: &TradeId,
        description: &str,
        amount: Amount,
    ) -> std::result::Result<BatchId, GatewayError>;

    async fn poll_transfer_status(
        &self,
        trade_id: &TradeId,
    ) -> std::result::Result<TransferStatus, GatewayError>;

    async fn poll_payment_status(
        &self,
        trade_id: &TradeId,
    ) -> std::result::Result<PaymentOutcome, GatewayError>;

    async fn verify_and_parse_payment_notification(
        &self,
        raw: &RawNotification,
    ) -> std::result::Result<SettlementEvent, GatewayError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type DatabaseRef = Arc<dyn Database>;
pub type GatewayRef = Arc<dyn PaymentGateway>;
pub type ClockRef = Arc<dyn Clock>;
