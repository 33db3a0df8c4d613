use super::staging::{Snapshot, Staged, StagedTx};
use crate::domain::ledger::{LedgerEntry, LedgerKey};
use crate::domain::order::{MasterOrder, OrderId, SubOrder, SubOrderId};
use crate::domain::ports::{Database, UnitOfWork};
use crate::domain::user::{User, UserId};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    master_orders: HashMap<OrderId, MasterOrder>,
    sub_orders: HashMap<SubOrderId, SubOrder>,
    ledger: BTreeMap<LedgerKey, LedgerEntry>,
}

/// A thread-safe in-memory database.
///
/// Uses `Arc<Mutex<..>>` so clones share the same tables. A transaction
/// holds the lock from `begin` until it is committed or dropped, so
/// transactions never interleave. Ideal for tests and the replay CLI.
#[derive(Default, Clone)]
pub struct InMemoryDatabase {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryDatabase {
    /// Creates a new, empty in-memory database.
    pub fn new() -> Self {
        Self::default()
    }
}

struct LockedTables(OwnedMutexGuard<Tables>);

impl Snapshot for LockedTables {
    fn user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.0.users.get(&id).cloned())
    }

    fn users(&self) -> Result<Vec<User>> {
        Ok(self.0.users.values().cloned().collect())
    }

    fn master_order(&self, id: OrderId) -> Result<Option<MasterOrder>> {
        Ok(self.0.master_orders.get(&id).cloned())
    }

    fn master_orders(&self) -> Result<Vec<MasterOrder>> {
        Ok(self.0.master_orders.values().cloned().collect())
    }

    fn sub_order(&self, id: SubOrderId) -> Result<Option<SubOrder>> {
        Ok(self.0.sub_orders.get(&id).cloned())
    }

    fn sub_orders(&self) -> Result<Vec<SubOrder>> {
        Ok(self.0.sub_orders.values().cloned().collect())
    }

    fn ledger_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        Ok(self.0.ledger.get(key).cloned())
    }

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.0.ledger.values().cloned().collect())
    }

    fn apply(&mut self, staged: Staged) -> Result<()> {
        let tables = &mut *self.0;
        tables.users.extend(staged.users);
        tables.master_orders.extend(staged.master_orders);
        tables.sub_orders.extend(staged.sub_orders);
        tables.ledger.extend(staged.ledger);
        Ok(())
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let guard = self.tables.clone().lock_owned().await;
        Ok(Box::new(StagedTx::new(LockedTables(guard))))
    }
}
