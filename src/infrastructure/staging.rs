//! Write staging shared by the store adapters.
//!
//! A `StagedTx` buffers every write of one unit of work on top of a
//! `Snapshot` of the committed data. Reads merge the buffer over the
//! snapshot, so a transaction sees its own writes. `commit` hands the whole
//! buffer to the backend in one call; dropping the transaction discards it.
//! Adapters hold their writer lock inside the snapshot for the lifetime of
//! the transaction, which makes transactions serializable.

use crate::domain::ledger::{LedgerEntry, LedgerFilter, LedgerKey};
use crate::domain::order::{
    MasterOrder, MasterOrderFilter, OrderId, SubOrder, SubOrderFilter, SubOrderId,
};
use crate::domain::ports::{LedgerStore, OrderRepository, UnitOfWork, UserStore};
use crate::domain::user::{User, UserId};
use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

/// Buffered writes of one transaction.
#[derive(Debug, Default)]
pub struct Staged {
    pub users: HashMap<UserId, User>,
    pub master_orders: HashMap<OrderId, MasterOrder>,
    pub sub_orders: HashMap<SubOrderId, SubOrder>,
    pub ledger: BTreeMap<LedgerKey, LedgerEntry>,
}

impl Staged {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.master_orders.is_empty()
            && self.sub_orders.is_empty()
            && self.ledger.is_empty()
    }
}

/// Committed state as seen by one transaction.
pub trait Snapshot: Send + Sync {
    fn user(&self, id: UserId) -> Result<Option<User>>;
    fn users(&self) -> Result<Vec<User>>;
    fn master_order(&self, id: OrderId) -> Result<Option<MasterOrder>>;
    fn master_orders(&self) -> Result<Vec<MasterOrder>>;
    fn sub_order(&self, id: SubOrderId) -> Result<Option<SubOrder>>;
    fn sub_orders(&self) -> Result<Vec<SubOrder>>;
    fn ledger_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>>;
    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>>;
    /// Makes the staged writes durable, all or nothing.
    fn apply(&mut self, staged: Staged) -> Result<()>;
}

pub struct StagedTx<S: Snapshot> {
    snapshot: S,
    staged: Staged,
}

impl<S: Snapshot> StagedTx<S> {
    pub fn new(snapshot: S) -> Self {
        Self {
            snapshot,
            staged: Staged::default(),
        }
    }
}

/// Overlays staged values on committed ones, keyed by `key`.
fn merge<K, V>(committed: Vec<V>, staged: &HashMap<K, V>, key: impl Fn(&V) -> K) -> Vec<V>
where
    K: std::hash::Hash + Eq,
    V: Clone,
{
    let mut merged: Vec<V> = committed
        .into_iter()
        .filter(|value| !staged.contains_key(&key(value)))
        .collect();
    merged.extend(staged.values().cloned());
    merged
}

#[async_trait]
impl<S: Snapshot> UserStore for StagedTx<S> {
    async fn user(&self, id: UserId) -> Result<Option<User>> {
        match self.staged.users.get(&id) {
            Some(user) => Ok(Some(user.clone())),
            None => self.snapshot.user(id),
        }
    }

    async fn users(&self) -> Result<Vec<User>> {
        let mut users = merge(self.snapshot.users()?, &self.staged.users, |u| u.id);
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn insert_user(&mut self, user: User) -> Result<()> {
        if UserStore::user(self, user.id).await?.is_some() {
            return Err(DispatchError::Validation(format!(
                "User {} already exists",
                user.id
            )));
        }
        self.staged.users.insert(user.id, user);
        Ok(())
    }

    async fn update_user(&mut self, user: User) -> Result<()> {
        if UserStore::user(self, user.id).await?.is_none() {
            return Err(DispatchError::NotFound(format!("User {}", user.id)));
        }
        self.staged.users.insert(user.id, user);
        Ok(())
    }
}

#[async_trait]
impl<S: Snapshot> LedgerStore for StagedTx<S> {
    async fn append(&mut self, entry: LedgerEntry) -> Result<bool> {
        let key = entry.key();
        if LedgerStore::ledger_entry(self, &key).await?.is_some() {
            return Ok(false);
        }
        self.staged.ledger.insert(key, entry);
        Ok(true)
    }

    async fn ledger_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        match self.staged.ledger.get(key) {
            Some(entry) => Ok(Some(entry.clone())),
            None => self.snapshot.ledger_entry(key),
        }
    }

    async fn ledger_entries(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .snapshot
            .ledger_entries()?
            .into_iter()
            .filter(|entry| !self.staged.ledger.contains_key(&entry.key()))
            .chain(self.staged.ledger.values().cloned())
            .filter(|entry| filter.matches(entry))
            .collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.trade_id.cmp(&b.trade_id))
        });
        Ok(entries)
    }

    async fn replace_entry(&mut self, entry: LedgerEntry) -> Result<()> {
        let key = entry.key();
        if LedgerStore::ledger_entry(self, &key).await?.is_none() {
            return Err(DispatchError::NotFound(format!(
                "Ledger entry {}",
                entry.trade_id
            )));
        }
        self.staged.ledger.insert(key, entry);
        Ok(())
    }
}

#[async_trait]
impl<S: Snapshot> OrderRepository for StagedTx<S> {
    async fn master_order(&self, id: OrderId) -> Result<Option<MasterOrder>> {
        match self.staged.master_orders.get(&id) {
            Some(order) => Ok(Some(order.clone())),
            None => self.snapshot.master_order(id),
        }
    }

    async fn master_orders(&self, filter: &MasterOrderFilter) -> Result<Vec<MasterOrder>> {
        let mut orders: Vec<MasterOrder> = merge(
            self.snapshot.master_orders()?,
            &self.staged.master_orders,
            |o| o.id,
        )
        .into_iter()
        .filter(|order| filter.matches(order))
        .collect();
        // Newest first.
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(orders)
    }

    async fn insert_master_order(&mut self, order: MasterOrder) -> Result<()> {
        if OrderRepository::master_order(self, order.id).await?.is_some() {
            return Err(DispatchError::Persistence(format!(
                "Duplicate master order id {}",
                order.id
            )));
        }
        self.staged.master_orders.insert(order.id, order);
        Ok(())
    }

    async fn update_master_order(&mut self, order: MasterOrder) -> Result<()> {
        if OrderRepository::master_order(self, order.id).await?.is_none() {
            return Err(DispatchError::NotFound(format!("Master order {}", order.id)));
        }
        self.staged.master_orders.insert(order.id, order);
        Ok(())
    }

    async fn sub_order(&self, id: SubOrderId) -> Result<Option<SubOrder>> {
        match self.staged.sub_orders.get(&id) {
            Some(sub) => Ok(Some(sub.clone())),
            None => self.snapshot.sub_order(id),
        }
    }

    async fn sub_orders(&self, filter: &SubOrderFilter) -> Result<Vec<SubOrder>> {
        let mut subs: Vec<SubOrder> =
            merge(self.snapshot.sub_orders()?, &self.staged.sub_orders, |s| s.id)
                .into_iter()
                .filter(|sub| filter.matches(sub))
                .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(subs)
    }

    async fn insert_sub_order(&mut self, sub: SubOrder) -> Result<()> {
        let siblings = OrderRepository::sub_orders(
            self,
            &SubOrderFilter {
                master: Some(sub.master),
                worker: Some(sub.worker),
                states: Vec::new(),
            },
        )
        .await?;
        if siblings.iter().any(|s| s.state().holds_capacity()) {
            return Err(DispatchError::DuplicateAcceptance {
                order: sub.master,
                worker: sub.worker,
            });
        }
        self.staged.sub_orders.insert(sub.id, sub);
        Ok(())
    }

    async fn update_sub_order(&mut self, sub: SubOrder) -> Result<()> {
        if OrderRepository::sub_order(self, sub.id).await?.is_none() {
            return Err(DispatchError::NotFound(format!("Sub-order {}", sub.id)));
        }
        self.staged.sub_orders.insert(sub.id, sub);
        Ok(())
    }
}

#[async_trait]
impl<S: Snapshot> UnitOfWork for StagedTx<S> {
    async fn commit(&mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(());
        }
        self.snapshot.apply(staged)
    }
}
