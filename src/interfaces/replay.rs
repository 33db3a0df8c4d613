//! Replays a command file against the services.
//!
//! Time is a [`ManualClock`] moved only by `advance` rows, and payments go
//! through the [`SandboxGateway`], so a replay is deterministic apart from
//! the generated ids. Command files name orders, sub-orders and trades by
//! labels; the replay maps each label to the id the services generated.

use super::csv::command_reader::{Command, Op};
use crate::application::orders::{OrderService, ReviewDecision};
use crate::application::scheduler::ReconciliationScheduler;
use crate::application::wallet::WalletService;
use crate::config::DispatchConfig;
use crate::domain::gateway::{PaymentOutcome, TransferOutcome};
use crate::domain::ledger::TradeId;
use crate::domain::money::Amount;
use crate::domain::order::{OrderId, OrderSpec, Platform, SubOrderId};
use crate::domain::ports::{Clock, DatabaseRef};
use crate::domain::user::{Role, User};
use crate::error::{DispatchError, Result};
use crate::infrastructure::clock::ManualClock;
use crate::infrastructure::sandbox_gateway::SandboxGateway;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
enum Trade {
    Recharge(TradeId),
    Withdraw(TradeId),
}

pub struct Replay {
    orders: OrderService,
    scheduler: ReconciliationScheduler,
    gateway: Arc<SandboxGateway>,
    clock: ManualClock,
    order_labels: HashMap<String, OrderId>,
    sub_labels: HashMap<String, SubOrderId>,
    trade_labels: HashMap<String, Trade>,
}

impl Replay {
    pub fn new(db: DatabaseRef, config: DispatchConfig, start: DateTime<Utc>) -> Self {
        let clock = ManualClock::new(start);
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
        let orders = OrderService::new(db, wallet, Arc::new(clock.clone()), config);
        let scheduler =
            ReconciliationScheduler::new(orders.clone(), Arc::new(clock.clone()), interval);
        Self {
            orders,
            scheduler,
            gateway,
            clock,
            order_labels: HashMap::new(),
            sub_labels: HashMap::new(),
            trade_labels: HashMap::new(),
        }
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Final state of every wallet, ordered by user id.
    pub async fn wallets(&self) -> Result<Vec<User>> {
        self.orders.wallet().users().await
    }

    pub async fn apply(&mut self, command: &Command) -> Result<()> {
        debug!(?command, "Applying command");
        let wallet = self.orders.wallet();
        match command.op {
            Op::Register => {
                let id = command.actor()?;
                let role: Role = command.detail()?.parse()?;
                wallet
                    .register_user(id, role, &format!("wx-{id}"), &format!("user-{id}"))
                    .await?;
            }
            Op::Recharge => {
                let amount = Amount::from_major(command.amount()?)?;
                if let Some(label) = &command.order {
                    ensure_unlabelled(&self.trade_labels, "Trade", label)?;
                }
                let token = wallet.recharge(command.actor()?, amount).await?;
                if let Some(label) = &command.order {
                    self.label_trade(label, Trade::Recharge(token.trade_id))?;
                }
            }
            Op::Withdraw => {
                let amount = Amount::from_major(command.amount()?)?;
                if let Some(label) = &command.order {
                    ensure_unlabelled(&self.trade_labels, "Trade", label)?;
                }
                let trade_id = wallet.withdraw(command.actor()?, amount).await?;
                if let Some(label) = &command.order {
                    self.label_trade(label, Trade::Withdraw(trade_id))?;
                }
            }
            Op::Settle => self.settle(command.order()?, command.detail()?).await?,
            Op::Create => {
                ensure_unlabelled(&self.order_labels, "Order", command.order()?)?;
                let spec = self.order_spec(command.order()?, command.detail()?)?;
                let order = self.orders.create_order(command.actor()?, spec).await?;
                self.label_order(command.order()?, order.id)?;
            }
            Op::Publish => {
                ensure_unlabelled(&self.order_labels, "Order", command.order()?)?;
                let spec = self.order_spec(command.order()?, command.detail()?)?;
                let order = self.orders.create_order(command.actor()?, spec).await?;
                // The label refers to the order even when the payment fails.
                self.label_order(command.order()?, order.id)?;
                self.orders.pay_order(order.id).await?;
            }
            Op::Pay => {
                self.orders.pay_order(self.order_id(command)?).await?;
            }
            Op::Modify => {
                let spec = self.order_spec(command.order()?, command.detail()?)?;
                self.orders.modify_order(self.order_id(command)?, spec).await?;
            }
            Op::Accept => {
                let label = command.sub()?;
                ensure_unlabelled(&self.sub_labels, "Sub-order", label)?;
                let sub = self
                    .orders
                    .accept_sub_order(self.order_id(command)?, command.actor()?)
                    .await?;
                self.sub_labels.insert(label.to_string(), sub.id);
            }
            Op::Submit => {
                let content = command.detail.as_deref().unwrap_or_default();
                self.orders
                    .submit_sub_order(self.order_id(command)?, self.sub_id(command)?, content)
                    .await?;
            }
            Op::Review => {
                let decision: ReviewDecision = command.detail()?.parse()?;
                self.orders
                    .review_sub_order(
                        self.order_id(command)?,
                        self.sub_id(command)?,
                        command.actor()?,
                        decision,
                    )
                    .await?;
            }
            Op::Advance => {
                let seconds: i64 = command.detail()?.parse().map_err(|_| {
                    DispatchError::Validation(format!(
                        "Invalid number of seconds: {:?}",
                        command.detail
                    ))
                })?;
                if seconds < 0 {
                    return Err(DispatchError::Validation(
                        "The clock cannot move backwards".to_string(),
                    ));
                }
                self.clock.checked_advance(to_seconds(seconds)?).ok_or_else(|| {
                    DispatchError::Validation(format!(
                        "Advancing by {seconds} seconds is past the end of time"
                    ))
                })?;
            }
            Op::Tick => {
                let report = self.scheduler.tick().await;
                info!(now = %self.clock.now(), ?report, "Reconciliation tick");
            }
        }
        Ok(())
    }

    /// Reports a gateway outcome for a labelled trade. A recharge outcome is
    /// delivered as a signed payment notification right away; a transfer
    /// outcome is picked up by the next reconciliation tick.
    async fn settle(&self, label: &str, outcome: &str) -> Result<()> {
        let trade = self
            .trade_labels
            .get(label)
            .ok_or_else(|| DispatchError::Validation(format!("Unknown trade label {label}")))?;
        match trade {
            Trade::Recharge(trade_id) => {
                let outcome = match outcome {
                    "success" => PaymentOutcome::Success,
                    "closed" => PaymentOutcome::Closed,
                    "fail" => PaymentOutcome::PayError,
                    other => return Err(invalid_outcome(other)),
                };
                self.gateway.settle_payment(trade_id, outcome).await?;
                let raw = self.gateway.payment_notification(trade_id).await?;
                self.orders
                    .wallet()
                    .handle_payment_notification(&raw)
                    .await?;
            }
            Trade::Withdraw(trade_id) => {
                let outcome = match outcome {
                    "success" => TransferOutcome::Success,
                    "fail" | "closed" => TransferOutcome::Fail,
                    other => return Err(invalid_outcome(other)),
                };
                self.gateway.settle_transfer(trade_id, outcome).await?;
            }
        }
        Ok(())
    }

    fn order_spec(&self, name: &str, detail: &str) -> Result<OrderSpec> {
        let mut parts = detail.split(':');
        let (Some(platform), Some(total), Some(deadline), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(DispatchError::Validation(format!(
                "Expected platform:total:deadline_seconds, got {detail:?}"
            )));
        };
        let platform: Platform = platform.parse()?;
        let total: u32 = total
            .parse()
            .map_err(|_| DispatchError::Validation(format!("Invalid total: {total:?}")))?;
        let seconds: i64 = deadline.parse().map_err(|_| {
            DispatchError::Validation(format!("Invalid deadline seconds: {deadline:?}"))
        })?;
        let deadline = self
            .clock
            .now()
            .checked_add_signed(to_seconds(seconds)?)
            .ok_or_else(|| {
                DispatchError::Validation(format!("Deadline in {seconds} seconds is out of range"))
            })?;
        Ok(OrderSpec {
            name: name.to_string(),
            content: String::new(),
            remark: String::new(),
            platform,
            total,
            deadline,
        })
    }

    fn order_id(&self, command: &Command) -> Result<OrderId> {
        let label = command.order()?;
        self.order_labels
            .get(label)
            .copied()
            .ok_or_else(|| DispatchError::Validation(format!("Unknown order label {label}")))
    }

    fn sub_id(&self, command: &Command) -> Result<SubOrderId> {
        let label = command.sub()?;
        self.sub_labels
            .get(label)
            .copied()
            .ok_or_else(|| DispatchError::Validation(format!("Unknown sub-order label {label}")))
    }

    fn label_order(&mut self, label: &str, id: OrderId) -> Result<()> {
        ensure_unlabelled(&self.order_labels, "Order", label)?;
        self.order_labels.insert(label.to_string(), id);
        Ok(())
    }

    fn label_trade(&mut self, label: &str, trade: Trade) -> Result<()> {
        ensure_unlabelled(&self.trade_labels, "Trade", label)?;
        self.trade_labels.insert(label.to_string(), trade);
        Ok(())
    }
}

/// Labels are checked before the service call so a taken label never
/// leaves an unnamed order, sub-order or trade behind.
fn ensure_unlabelled<V>(labels: &HashMap<String, V>, kind: &str, label: &str) -> Result<()> {
    if labels.contains_key(label) {
        return Err(DispatchError::Validation(format!(
            "{kind} label {label} is already taken"
        )));
    }
    Ok(())
}

fn to_seconds(seconds: i64) -> Result<Duration> {
    Duration::try_seconds(seconds)
        .ok_or_else(|| DispatchError::Validation(format!("{seconds} seconds is out of range")))
}

fn invalid_outcome(outcome: &str) -> DispatchError {
    DispatchError::Validation(format!(
        "Unknown outcome {outcome:?}, expected success, fail or closed"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{MasterOrderFilter, MasterState, SubOrderFilter};
    use crate::infrastructure::in_memory::InMemoryDatabase;
    use crate::interfaces::csv::command_reader::CommandReader;

    async fn replay(script: &str) -> (Replay, Vec<Result<()>>) {
        let mut replay = Replay::new(
            Arc::new(InMemoryDatabase::new()),
            DispatchConfig::default(),
            Utc::now(),
        );
        let mut results = Vec::new();
        for command in CommandReader::new(script.as_bytes()).commands() {
            let command = command.unwrap();
            results.push(replay.apply(&command).await);
        }
        (replay, results)
    }

    fn balance_of(users: &[User], id: u64) -> i64 {
        users
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.balance().value())
            .unwrap()
    }

    #[tokio::test]
    async fn test_order_scenario() {
        let script = "op,actor,order,sub,amount,detail\n\
                      register,1,,,,publisher\n\
                      register,2,,,,worker\n\
                      register,3,,,,auditor\n\
                      recharge,1,top-up,,10.00,\n\
                      settle,,top-up,,,success\n\
                      publish,1,o1,,,taobao:2:3600\n\
                      accept,2,o1,s1,,\n\
                      submit,,o1,s1,,screenshot\n\
                      review,3,o1,s1,,approve\n\
                      advance,,,,,3600\n\
                      tick,,,,,";
        let (replay, results) = replay(script).await;
        assert!(results.iter().all(|r| r.is_ok()), "{results:?}");

        let users = replay.wallets().await.unwrap();
        assert_eq!(balance_of(&users, 1), 600);
        assert_eq!(balance_of(&users, 2), 100);
        let orders = replay
            .orders()
            .list_orders(&MasterOrderFilter::in_state(MasterState::Finish))
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].completed(), 1);
    }

    #[tokio::test]
    async fn test_failing_rows_do_not_stop_the_replay() {
        let script = "op,actor,order,sub,amount,detail\n\
                      register,1,,,,publisher\n\
                      pay,,missing,,,\n\
                      publish,1,o1,,,jd:1:3600\n\
                      advance,,,,,601\n\
                      tick,,,,,";
        let (replay, results) = replay(script).await;
        assert!(results[1].is_err());
        assert!(matches!(
            results[2],
            Err(DispatchError::InsufficientBalance { .. })
        ));
        assert!(results[3].is_ok() && results[4].is_ok());
        let cancelled = replay
            .orders()
            .list_orders(&MasterOrderFilter::in_state(MasterState::Cancel))
            .await
            .unwrap();
        assert_eq!(cancelled.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_withdrawal_is_refunded_on_tick() {
        let script = "op,actor,order,sub,amount,detail\n\
                      register,2,,,,worker\n\
                      recharge,2,r,,5.00,\n\
                      settle,,r,,,success\n\
                      withdraw,2,w,,3.00,\n\
                      settle,,w,,,fail\n\
                      tick,,,,,";
        let (replay, results) = replay(script).await;
        assert!(results.iter().all(|r| r.is_ok()), "{results:?}");
        let users = replay.wallets().await.unwrap();
        assert_eq!(balance_of(&users, 2), 500);
    }

    #[tokio::test]
    async fn test_taken_labels_leave_no_orphans() {
        let script = "op,actor,order,sub,amount,detail\n\
                      register,1,,,,publisher\n\
                      register,2,,,,worker\n\
                      register,3,,,,worker\n\
                      recharge,1,r,,10.00,\n\
                      settle,,r,,,success\n\
                      publish,1,o1,,,taobao:2:3600\n\
                      accept,2,o1,s1,,\n\
                      accept,3,o1,s1,,\n\
                      create,1,o1,,,jd:1:3600\n\
                      publish,1,o1,,,jd:1:3600\n\
                      recharge,1,r,,1.00,";
        let (replay, results) = replay(script).await;
        assert!(results[..7].iter().all(|r| r.is_ok()), "{results:?}");
        for result in &results[7..] {
            assert!(matches!(result, Err(DispatchError::Validation(_))), "{result:?}");
        }

        let orders = replay
            .orders()
            .list_orders(&MasterOrderFilter::default())
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        let subs = replay
            .orders()
            .list_sub_orders(&SubOrderFilter::of_master(orders[0].id))
            .await
            .unwrap();
        assert_eq!(subs.len(), 1);
        // The second unit is still free for worker 3.
        replay.orders().accept_sub_order(orders[0].id, 3).await.unwrap();

        let wallet = replay.orders().wallet();
        assert!(wallet.pending_trades().await.unwrap().is_empty());
        assert_eq!(wallet.balance(1).await.unwrap().value(), 600);
    }

    #[tokio::test]
    async fn test_out_of_range_seconds_are_rejected() {
        let script = "op,actor,order,sub,amount,detail\n\
                      register,1,,,,publisher\n\
                      advance,,,,,9223372036854775807\n\
                      create,1,o1,,,jd:1:9223372036854775807\n\
                      create,1,o2,,,jd:1:9000000000000000\n\
                      create,1,o3,,,jd:1:3600\n\
                      advance,,,,,60\n\
                      advance,,,,,8000000000000000\n\
                      advance,,,,,60";
        let start = Utc::now();
        let mut replay = Replay::new(
            Arc::new(InMemoryDatabase::new()),
            DispatchConfig::default(),
            start,
        );
        let mut results = Vec::new();
        for command in CommandReader::new(script.as_bytes()).commands() {
            results.push(replay.apply(&command.unwrap()).await);
        }

        for i in [1, 2, 3, 6] {
            assert!(
                matches!(results[i], Err(DispatchError::Validation(_))),
                "row {i}: {:?}",
                results[i]
            );
        }
        for i in [0, 4, 5, 7] {
            assert!(results[i].is_ok(), "row {i}: {:?}", results[i]);
        }
        assert_eq!(replay.clock().now(), start + Duration::seconds(120));

        let orders = replay
            .orders()
            .list_orders(&MasterOrderFilter::default())
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].spec.name, "o3");
    }
}
