#![allow(dead_code)]

use chrono::{Duration, Utc};
use dispatch::application::orders::OrderService;
use dispatch::application::scheduler::ReconciliationScheduler;
use dispatch::application::wallet::WalletService;
use dispatch::config::DispatchConfig;
use dispatch::domain::ledger::{LedgerFilter, TradeId, TradeType, ledger_total};
use dispatch::domain::money::Amount;
use dispatch::domain::order::{OrderSpec, Platform};
use dispatch::domain::ports::{Clock, DatabaseRef};
use dispatch::domain::user::{Role, UserId};
use dispatch::infrastructure::clock::ManualClock;
use dispatch::infrastructure::in_memory::InMemoryDatabase;
use dispatch::infrastructure::sandbox_gateway::SandboxGateway;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

/// Services wired over an in-memory database, a manual clock and the sandbox
/// gateway.
pub struct Harness {
    pub db: DatabaseRef,
    pub orders: OrderService,
    pub scheduler: ReconciliationScheduler,
    pub gateway: Arc<SandboxGateway>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(config: DispatchConfig) -> Self {
        let db: DatabaseRef = Arc::new(InMemoryDatabase::new());
        let clock = ManualClock::new(Utc::now());
        let gateway = Arc::new(SandboxGateway::new(
            config.gateway.notification_secret.clone(),
        ));
        let interval = config.scan_interval;
        let config = Arc::new(config);
        let wallet = WalletService::new(
            db.clone(),
            gateway.clone(),
            Arc::new(clock.clone()),
            config.clone(),
        );
        let orders = OrderService::new(db.clone(), wallet, Arc::new(clock.clone()), config);
        let scheduler =
            ReconciliationScheduler::new(orders.clone(), Arc::new(clock.clone()), interval);
        Self {
            db,
            orders,
            scheduler,
            gateway,
            clock,
        }
    }

    pub fn wallet(&self) -> &WalletService {
        self.orders.wallet()
    }

    pub async fn register(&self, id: UserId, role: Role) {
        self.wallet()
            .register_user(id, role, &format!("wx-{id}"), &format!("user-{id}"))
            .await
            .unwrap();
    }

    /// Seeds a settled recharge of `minor` units.
    pub async fn fund(&self, id: UserId, minor: i64) {
        self.wallet()
            .credit(
                id,
                Amount::new(minor).unwrap(),
                TradeType::Recharge,
                TradeId::from(format!("seed-{id}-{minor}").as_str()),
            )
            .await
            .unwrap();
    }

    pub fn spec(&self, total: u32, deadline_in: Duration) -> OrderSpec {
        OrderSpec {
            name: "five star review".to_string(),
            content: "Leave a photo review".to_string(),
            remark: String::new(),
            platform: Platform::Taobao,
            total,
            deadline: self.clock.now() + deadline_in,
        }
    }

    /// Every user's balance equals the sum of their effective ledger amounts.
    pub async fn assert_ledger_consistent(&self) {
        for user in self.wallet().users().await.unwrap() {
            let entries = self
                .wallet()
                .ledger(&LedgerFilter {
                    user: Some(user.id),
                    trade_types: vec![],
                })
                .await
                .unwrap();
            assert!(user.balance().value() >= 0, "negative balance: {user:?}");
            assert_eq!(
                user.balance().value(),
                ledger_total(&entries),
                "balance of user {} drifted from its ledger",
                user.id
            );
        }
    }
}

pub const PUBLISHERS: std::ops::RangeInclusive<u64> = 1..=3;
pub const WORKERS: std::ops::RangeInclusive<u64> = 10..=19;
pub const AUDITOR: u64 = 99;

/// Writes a random but well-formed command file: users are registered and
/// funded first, then `orders` orders are published and worked on by random
/// workers while the clock moves forward. Some rows are expected to be
/// rejected (full orders, duplicate acceptances, unknown sub-order labels).
pub fn generate_commands_csv(path: &Path, orders: usize, seed: u64) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    let mut rng = StdRng::seed_from_u64(seed);

    wtr.write_record(["op", "actor", "order", "sub", "amount", "detail"])?;

    for id in PUBLISHERS {
        wtr.write_record(["register", &id.to_string(), "", "", "", "publisher"])?;
        let label = format!("fund-{id}");
        wtr.write_record(["recharge", &id.to_string(), &label, "", "1000.00", ""])?;
        wtr.write_record(["settle", "", &label, "", "", "success"])?;
    }
    for id in WORKERS {
        wtr.write_record(["register", &id.to_string(), "", "", "", "worker"])?;
    }
    wtr.write_record(["register", &AUDITOR.to_string(), "", "", "", "auditor"])?;

    for i in 0..orders {
        let owner = rng.gen_range(PUBLISHERS);
        let total: u32 = rng.gen_range(1..=4);
        let deadline: u32 = rng.gen_range(600..=7200);
        let order = format!("o{i}");
        wtr.write_record([
            "publish",
            &owner.to_string(),
            &order,
            "",
            "",
            &format!("taobao:{total}:{deadline}"),
        ])?;

        let mut subs = Vec::new();
        for k in 0..rng.gen_range(0..=5) {
            let worker = rng.gen_range(WORKERS);
            let sub = format!("s{i}-{k}");
            wtr.write_record(["accept", &worker.to_string(), &order, &sub, "", ""])?;
            subs.push((worker, sub));
        }
        for (worker, sub) in &subs {
            if rng.gen_bool(0.3) {
                continue;
            }
            wtr.write_record(["submit", "", &order, sub, "", "proof"])?;
            let decision = if rng.gen_bool(0.8) { "approve" } else { "reject" };
            wtr.write_record(["review", &AUDITOR.to_string(), &order, sub, "", decision])?;

            if decision == "approve" && rng.gen_bool(0.2) {
                let trade = format!("w{i}-{worker}-{sub}");
                wtr.write_record(["withdraw", &worker.to_string(), &trade, "", "0.50", ""])?;
                let outcome = if rng.gen_bool(0.7) { "success" } else { "fail" };
                wtr.write_record(["settle", "", &trade, "", "", outcome])?;
            }
        }

        if rng.gen_bool(0.25) {
            let seconds: u32 = rng.gen_range(0..=900);
            wtr.write_record(["advance", "", "", "", "", &seconds.to_string()])?;
            wtr.write_record(["tick", "", "", "", "", ""])?;
        }
    }

    wtr.write_record(["advance", "", "", "", "", "7200"])?;
    wtr.write_record(["tick", "", "", "", "", ""])?;
    wtr.flush()?;
    Ok(())
}
