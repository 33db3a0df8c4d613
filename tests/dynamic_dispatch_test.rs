use chrono::Utc;
use dispatch::domain::ledger::{LedgerEntry, LedgerKey, TradeId, TradeType};
use dispatch::domain::money::{Amount, Balance};
use dispatch::domain::ports::{DatabaseRef, LedgerStore, UnitOfWork, UserStore};
use dispatch::domain::user::{Role, User};
use dispatch::infrastructure::in_memory::InMemoryDatabase;
use std::sync::Arc;

async fn exercise(db: DatabaseRef) {
    // Verify Send + Sync by working from spawned tasks
    let writer = db.clone();
    tokio::spawn(async move {
        let mut tx = writer.begin().await.unwrap();
        tx.insert_user(User::new(1, Role::Worker, "wx-1", "one"))
            .await
            .unwrap();
        let entry = LedgerEntry::new(
            TradeId::from("t1"),
            1,
            TradeType::CompleteOrder,
            Amount::new(300).unwrap(),
            Balance::new(300),
            Utc::now(),
        );
        assert!(tx.append(entry.clone()).await.unwrap());
        assert!(!tx.append(entry).await.unwrap());
        tx.commit().await.unwrap();
    })
    .await
    .unwrap();

    let reader = db.clone();
    let (user, entry) = tokio::spawn(async move {
        let tx: Box<dyn UnitOfWork> = reader.begin().await.unwrap();
        let user = tx.user(1).await.unwrap().unwrap();
        let entry = tx
            .ledger_entry(&LedgerKey::new(
                TradeId::from("t1"),
                TradeType::CompleteOrder.family(),
            ))
            .await
            .unwrap()
            .unwrap();
        (user, entry)
    })
    .await
    .unwrap();

    assert_eq!(user.handle, "wx-1");
    assert_eq!(entry.amount, 300);
    assert_eq!(entry.balance_after, Balance::new(300));
}

#[tokio::test]
async fn test_in_memory_database_as_trait_object() {
    exercise(Arc::new(InMemoryDatabase::new())).await;
}

#[cfg(feature = "storage-rocksdb")]
#[tokio::test]
async fn test_rocksdb_database_as_trait_object() {
    use dispatch::infrastructure::rocksdb::RocksDBStore;

    let dir = tempfile::tempdir().unwrap();
    let store = RocksDBStore::open(dir.path().join("db")).unwrap();
    exercise(Arc::new(store)).await;
}
