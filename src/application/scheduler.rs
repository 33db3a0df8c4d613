//! Periodic reconciliation.
//!
//! Four independent scans:
//! - unpaid master orders older than the payment timeout are cancelled
//! - master orders past their deadline are closed
//! - stale sub-orders are timed out, freeing their unit
//! - pending recharges and withdrawals are polled at the gateway
//!
//! Each scan only picks candidates; the order and wallet services re-check
//! every condition inside their own unit of work, so a record that changed in
//! between is skipped and re-running a scan is harmless.

use super::orders::{OrderService, to_chrono};
use super::wallet::Settlement;
use crate::domain::order::{MasterOrderFilter, MasterState, SubOrderFilter};
use crate::domain::ports::ClockRef;
use crate::error::{DispatchError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    UnpaidOrders,
    Deadlines,
    StaleSubOrders,
    PendingTrades,
}

impl Scan {
    pub const ALL: [Scan; 4] = [
        Scan::UnpaidOrders,
        Scan::Deadlines,
        Scan::StaleSubOrders,
        Scan::PendingTrades,
    ];
}

impl fmt::Display for Scan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scan::UnpaidOrders => "unpaid-orders",
            Scan::Deadlines => "deadlines",
            Scan::StaleSubOrders => "stale-sub-orders",
            Scan::PendingTrades => "pending-trades",
        };
        f.write_str(name)
    }
}

/// What one scan did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Candidates picked by the scan.
    pub examined: usize,
    /// Candidates that changed state.
    pub changed: usize,
    /// Candidates whose handling failed; they are retried on the next pass.
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub unpaid_orders: ScanReport,
    pub deadlines: ScanReport,
    pub stale_sub_orders: ScanReport,
    pub pending_trades: ScanReport,
}

pub struct ReconciliationScheduler {
    orders: OrderService,
    clock: ClockRef,
    interval: Duration,
}

impl ReconciliationScheduler {
    pub fn new(orders: OrderService, clock: ClockRef, interval: Duration) -> Self {
        Self {
            orders,
            clock,
            interval,
        }
    }

    /// Runs every scan once, in order.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        for scan in Scan::ALL {
            let result = match self.run_scan(scan).await {
                Ok(result) => result,
                Err(e) => {
                    error!(%scan, error = %e, "Scan failed");
                    ScanReport::default()
                }
            };
            match scan {
                Scan::UnpaidOrders => report.unpaid_orders = result,
                Scan::Deadlines => report.deadlines = result,
                Scan::StaleSubOrders => report.stale_sub_orders = result,
                Scan::PendingTrades => report.pending_trades = result,
            }
        }
        debug!(?report, "Reconciliation tick finished");
        report
    }

    pub async fn run_scan(&self, scan: Scan) -> Result<ScanReport> {
        match scan {
            Scan::UnpaidOrders => self.scan_unpaid_orders().await,
            Scan::Deadlines => self.scan_deadlines().await,
            Scan::StaleSubOrders => self.scan_stale_sub_orders().await,
            Scan::PendingTrades => self.scan_pending_trades().await,
        }
    }

    /// Starts one periodic worker per scan. Workers stop once `shutdown`
    /// turns true or its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        Scan::ALL
            .into_iter()
            .map(|scan| {
                let scheduler = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(%scan, interval = ?scheduler.interval, "Scan worker started");
                    let mut ticker = interval(scheduler.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        tokio::select! {
                            _ = ticker.tick() => {
                                match scheduler.run_scan(scan).await {
                                    Ok(report) => debug!(%scan, ?report, "Scan finished"),
                                    Err(e) => error!(%scan, error = %e, "Scan failed"),
                                }
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    info!(%scan, "Scan worker stopped");
                })
            })
            .collect()
    }

    async fn scan_unpaid_orders(&self) -> Result<ScanReport> {
        let now = self.clock.now();
        let timeout = to_chrono(self.orders.config().payment_timeout)?;
        let candidates = self
            .orders
            .list_orders(&MasterOrderFilter::in_state(MasterState::Created))
            .await?
            .into_iter()
            .filter(|order| now - order.updated_at >= timeout)
            .map(|order| order.id);

        let mut report = ScanReport::default();
        for id in candidates {
            report.record(Scan::UnpaidOrders, id, self.orders.expire_unpaid(id).await);
        }
        Ok(report)
    }

    async fn scan_deadlines(&self) -> Result<ScanReport> {
        let now = self.clock.now();
        let candidates = self
            .orders
            .list_orders(&MasterOrderFilter::in_state(MasterState::Doing))
            .await?
            .into_iter()
            .filter(|order| now >= order.spec.deadline)
            .map(|order| order.id);

        let mut report = ScanReport::default();
        for id in candidates {
            let result = self
                .orders
                .finish_at_deadline(id)
                .await
                .map(|closed| closed.is_some());
            report.record(Scan::Deadlines, id, result);
        }
        Ok(report)
    }

    async fn scan_stale_sub_orders(&self) -> Result<ScanReport> {
        let now = self.clock.now();
        let timeout = to_chrono(self.orders.config().sub_order_timeout)?;
        let candidates = self
            .orders
            .list_sub_orders(&SubOrderFilter {
                states: self.orders.timeout_states(),
                ..SubOrderFilter::default()
            })
            .await?
            .into_iter()
            .filter(|sub| now - sub.created_at >= timeout)
            .map(|sub| sub.id);

        let mut report = ScanReport::default();
        for id in candidates {
            report.record(
                Scan::StaleSubOrders,
                id,
                self.orders.time_out_sub_order(id).await,
            );
        }
        Ok(report)
    }

    async fn scan_pending_trades(&self) -> Result<ScanReport> {
        let wallet = self.orders.wallet();
        let pending = wallet.pending_trades().await?;

        let mut report = ScanReport::default();
        for entry in &pending {
            let result = wallet
                .reconcile(entry)
                .await
                .map(|settlement| matches!(settlement, Settlement::Settled(_)));
            report.record(Scan::PendingTrades, &entry.trade_id, result);
        }
        Ok(report)
    }
}

impl ScanReport {
    fn record(&mut self, scan: Scan, record: impl fmt::Display, result: Result<bool>) {
        self.examined += 1;
        match result {
            Ok(true) => self.changed += 1,
            Ok(false) => {}
            Err(e) => {
                self.failed += 1;
                log_failure(scan, &record, &e);
            }
        }
    }
}

fn log_failure(scan: Scan, record: &dyn fmt::Display, e: &DispatchError) {
    if e.is_rejection() {
        warn!(%scan, %record, error = %e, "Record skipped");
    } else {
        error!(%scan, %record, error = %e, "Record failed");
    }
}
