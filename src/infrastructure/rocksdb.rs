use super::staging::{Snapshot, Staged, StagedTx};
use crate::domain::ledger::{LedgerEntry, LedgerKey};
use crate::domain::order::{MasterOrder, OrderId, SubOrder, SubOrderId};
use crate::domain::ports::{Database, UnitOfWork};
use crate::domain::user::{User, UserId};
use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Column Family for storing users and their balances.
pub const CF_USERS: &str = "users";
/// Column Family for storing master orders.
pub const CF_MASTER_ORDERS: &str = "master_orders";
/// Column Family for storing sub-orders.
pub const CF_SUB_ORDERS: &str = "sub_orders";
/// Column Family for storing ledger entries, keyed by trade id and family.
pub const CF_LEDGER: &str = "ledger";

const COLUMN_FAMILIES: [&str; 4] = [CF_USERS, CF_MASTER_ORDERS, CF_SUB_ORDERS, CF_LEDGER];

/// A persistent store implementation using RocksDB.
///
/// Each entity kind lives in its own Column Family, serialized as JSON.
/// A transaction takes the process-wide writer lock and commits all of its
/// writes in a single `WriteBatch`, so a commit is atomic on disk and
/// transactions are serialized.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    writer: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating the
    /// column families on first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }
}

struct RocksSnapshot {
    db: Arc<DB>,
    _writer: OwnedMutexGuard<()>,
}

impl RocksSnapshot {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            DispatchError::Persistence(format!("Column family {name} not found"))
        })
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_pinned_cf(handle, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let handle = self.cf(cf)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(handle, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn put<T: Serialize>(&self, batch: &mut WriteBatch, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let handle = self.cf(cf)?;
        batch.put_cf(handle, key, serde_json::to_vec(value)?);
        Ok(())
    }
}

impl Snapshot for RocksSnapshot {
    fn user(&self, id: UserId) -> Result<Option<User>> {
        self.get(CF_USERS, &id.to_be_bytes())
    }

    fn users(&self) -> Result<Vec<User>> {
        self.scan(CF_USERS)
    }

    fn master_order(&self, id: OrderId) -> Result<Option<MasterOrder>> {
        self.get(CF_MASTER_ORDERS, id.as_bytes())
    }

    fn master_orders(&self) -> Result<Vec<MasterOrder>> {
        self.scan(CF_MASTER_ORDERS)
    }

    fn sub_order(&self, id: SubOrderId) -> Result<Option<SubOrder>> {
        self.get(CF_SUB_ORDERS, id.as_bytes())
    }

    fn sub_orders(&self) -> Result<Vec<SubOrder>> {
        self.scan(CF_SUB_ORDERS)
    }

    fn ledger_entry(&self, key: &LedgerKey) -> Result<Option<LedgerEntry>> {
        self.get(CF_LEDGER, &key.encode())
    }

    fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        self.scan(CF_LEDGER)
    }

    fn apply(&mut self, staged: Staged) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (id, user) in &staged.users {
            self.put(&mut batch, CF_USERS, &id.to_be_bytes(), user)?;
        }
        for (id, order) in &staged.master_orders {
            self.put(&mut batch, CF_MASTER_ORDERS, id.as_bytes(), order)?;
        }
        for (id, sub) in &staged.sub_orders {
            self.put(&mut batch, CF_SUB_ORDERS, id.as_bytes(), sub)?;
        }
        for (key, entry) in &staged.ledger {
            self.put(&mut batch, CF_LEDGER, &key.encode(), entry)?;
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[async_trait]
impl Database for RocksDBStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let writer = self.writer.clone().lock_owned().await;
        Ok(Box::new(StagedTx::new(RocksSnapshot {
            db: self.db.clone(),
            _writer: writer,
        })))
    }
}
