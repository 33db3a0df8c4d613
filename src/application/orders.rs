use super::wallet::{LedgerWrite, WalletService};
use crate::config::{DeadlinePolicy, DispatchConfig};
use crate::domain::ledger::{TradeId, TradeType};
use crate::domain::order::{
    MasterOrder, MasterOrderFilter, MasterState, OrderId, OrderSpec, SubOrder, SubOrderFilter,
    SubOrderId, SubState,
};
use crate::domain::ports::{ClockRef, DatabaseRef, OrderRepository, UnitOfWork, UserStore};
use crate::domain::user::{Role, UserId};
use crate::error::{DispatchError, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl std::str::FromStr for ReviewDecision {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "complete" => Ok(ReviewDecision::Approve),
            "reject" => Ok(ReviewDecision::Reject),
            other => Err(DispatchError::Validation(format!(
                "Unknown review decision: {other}"
            ))),
        }
    }
}

/// Drives the master order and sub-order state machines.
///
/// Every operation reads, checks and writes inside one unit of work. Money
/// moves through the [`WalletService`] in that same unit of work, so an order
/// transition and its ledger entry commit together or not at all.
#[derive(Clone)]
pub struct OrderService {
    db: DatabaseRef,
    wallet: WalletService,
    clock: ClockRef,
    config: Arc<DispatchConfig>,
}

impl OrderService {
    pub fn new(
        db: DatabaseRef,
        wallet: WalletService,
        clock: ClockRef,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            db,
            wallet,
            clock,
            config,
        }
    }

    pub fn wallet(&self) -> &WalletService {
        &self.wallet
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub async fn create_order(&self, owner: UserId, spec: OrderSpec) -> Result<MasterOrder> {
        let now = self.clock.now();
        spec.validate(now)?;

        let mut tx = self.db.begin().await?;
        if tx.user(owner).await?.is_none() {
            return Err(DispatchError::NotFound(format!("User {owner}")));
        }
        let order = MasterOrder::new(owner, spec, now);
        tx.insert_master_order(order.clone()).await?;
        tx.commit().await?;
        info!(order = %order.id, owner, total = order.total(), "Master order created");
        Ok(order)
    }

    /// Charges the owner `total × unit price` and opens the order to workers.
    pub async fn pay_order(&self, id: OrderId) -> Result<MasterOrder> {
        let mut tx = self.db.begin().await?;
        let mut order = master_in(tx.as_ref(), id).await?;
        if order.state() != MasterState::Created {
            return Err(DispatchError::StateConflict(format!(
                "Master order {id} cannot be paid while {}",
                order.state()
            )));
        }

        let fee = self.config.publish_unit_price.times(order.total())?;
        let write = self
            .wallet
            .debit_in(
                tx.as_mut(),
                order.owner,
                fee,
                TradeType::PublishOrder,
                TradeId::from(id),
            )
            .await?;
        if write == LedgerWrite::AlreadyApplied {
            info!(order = %id, "Publishing fee already charged");
        }

        order.transition(MasterState::Doing, self.clock.now())?;
        tx.update_master_order(order.clone()).await?;
        tx.commit().await?;
        info!(order = %id, %fee, "Master order paid");
        Ok(order)
    }

    /// Creates and pays an order. A failed payment leaves the order created.
    pub async fn publish_order(&self, owner: UserId, spec: OrderSpec) -> Result<MasterOrder> {
        let order = self.create_order(owner, spec).await?;
        self.pay_order(order.id).await
    }

    pub async fn modify_order(&self, id: OrderId, spec: OrderSpec) -> Result<MasterOrder> {
        let now = self.clock.now();
        spec.validate(now)?;

        let mut tx = self.db.begin().await?;
        let mut order = master_in(tx.as_ref(), id).await?;
        order.replace_spec(spec, now)?;
        tx.update_master_order(order.clone()).await?;
        tx.commit().await?;
        info!(order = %id, "Master order modified");
        Ok(order)
    }

    pub async fn get_order(&self, id: OrderId) -> Result<MasterOrder> {
        let tx = self.db.begin().await?;
        master_in(tx.as_ref(), id).await
    }

    pub async fn list_orders(&self, filter: &MasterOrderFilter) -> Result<Vec<MasterOrder>> {
        let tx = self.db.begin().await?;
        tx.master_orders(filter).await
    }

    pub async fn get_sub_order(&self, id: SubOrderId) -> Result<SubOrder> {
        let tx = self.db.begin().await?;
        tx.sub_order(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Sub-order {id}")))
    }

    pub async fn list_sub_orders(&self, filter: &SubOrderFilter) -> Result<Vec<SubOrder>> {
        let tx = self.db.begin().await?;
        tx.sub_orders(filter).await
    }

    /// Claims one unit of a master order for a worker.
    pub async fn accept_sub_order(&self, master: OrderId, worker: UserId) -> Result<SubOrder> {
        let mut tx = self.db.begin().await?;
        let user = tx
            .user(worker)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("User {worker}")))?;
        if user.role != Role::Worker {
            return Err(DispatchError::Forbidden(format!(
                "User {worker} is a {}, only workers accept sub-orders",
                user.role
            )));
        }

        let order = master_in(tx.as_ref(), master).await?;
        if order.state() != MasterState::Doing {
            return Err(DispatchError::StateConflict(format!(
                "Master order {master} is not accepting workers while {}",
                order.state()
            )));
        }
        if order.is_filled() {
            return Err(DispatchError::CapacityExceeded(master));
        }

        let holding: Vec<SubOrder> = tx
            .sub_orders(&SubOrderFilter::of_master(master))
            .await?
            .into_iter()
            .filter(|sub| sub.state().holds_capacity())
            .collect();
        if holding.iter().any(|sub| sub.worker == worker) {
            return Err(DispatchError::DuplicateAcceptance {
                order: master,
                worker,
            });
        }
        if holding.len() >= order.total() as usize {
            return Err(DispatchError::CapacityExceeded(master));
        }

        let sub = SubOrder::new(master, worker, self.clock.now());
        tx.insert_sub_order(sub.clone()).await?;
        tx.commit().await?;
        info!(order = %master, sub = %sub.id, worker, "Sub-order accepted");
        Ok(sub)
    }

    pub async fn submit_sub_order(
        &self,
        master: OrderId,
        id: SubOrderId,
        content: &str,
    ) -> Result<SubOrder> {
        let mut tx = self.db.begin().await?;
        let mut sub = sub_in(tx.as_ref(), master, id).await?;
        sub.transition(SubState::Submit, self.clock.now())?;
        sub.content = content.to_string();
        tx.update_sub_order(sub.clone()).await?;
        tx.commit().await?;
        info!(order = %master, sub = %id, "Sub-order submitted");
        Ok(sub)
    }

    pub async fn review_sub_order(
        &self,
        master: OrderId,
        id: SubOrderId,
        auditor: UserId,
        decision: ReviewDecision,
    ) -> Result<SubOrder> {
        let mut tx = self.db.begin().await?;
        let reviewer = tx
            .user(auditor)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("User {auditor}")))?;
        if reviewer.role != Role::Auditor {
            return Err(DispatchError::Forbidden(format!(
                "User {auditor} is a {}, only auditors review sub-orders",
                reviewer.role
            )));
        }

        match decision {
            ReviewDecision::Approve => {
                let sub = self.approve_in(tx.as_mut(), master, id).await?;
                tx.commit().await?;
                Ok(sub)
            }
            ReviewDecision::Reject => {
                let mut sub = sub_in(tx.as_ref(), master, id).await?;
                if sub.state() != SubState::Submit {
                    return Err(DispatchError::StateConflict(format!(
                        "Sub-order {id} can only be reviewed once submitted, it is {}",
                        sub.state()
                    )));
                }
                sub.transition(SubState::Reject, self.clock.now())?;
                tx.update_sub_order(sub.clone()).await?;
                tx.commit().await?;
                info!(order = %master, sub = %id, auditor, "Sub-order rejected");
                Ok(sub)
            }
        }
    }

    /// Completes a submitted sub-order and pays the worker's commission.
    pub async fn approve_sub_order(&self, master: OrderId, id: SubOrderId) -> Result<SubOrder> {
        let mut tx = self.db.begin().await?;
        let sub = self.approve_in(tx.as_mut(), master, id).await?;
        tx.commit().await?;
        Ok(sub)
    }

    async fn approve_in(
        &self,
        tx: &mut dyn UnitOfWork,
        master: OrderId,
        id: SubOrderId,
    ) -> Result<SubOrder> {
        let now = self.clock.now();
        let mut order = master_in(tx, master).await?;
        if order.is_filled() {
            return Err(DispatchError::StateConflict(format!(
                "Master order {master} is already complete"
            )));
        }
        let mut sub = sub_in(tx, master, id).await?;
        if sub.state() != SubState::Submit {
            return Err(DispatchError::StateConflict(format!(
                "Sub-order {id} can only be approved once submitted, it is {}",
                sub.state()
            )));
        }

        sub.transition(SubState::Complete, now)?;
        order.record_completion(now)?;
        let write = self
            .wallet
            .credit_in(
                tx,
                sub.worker,
                self.config.commission,
                TradeType::CompleteOrder,
                TradeId::from(id),
            )
            .await?;
        if write == LedgerWrite::AlreadyApplied {
            return Err(DispatchError::StateConflict(format!(
                "Commission for sub-order {id} was already paid"
            )));
        }
        tx.update_sub_order(sub.clone()).await?;
        tx.update_master_order(order.clone()).await?;
        info!(
            order = %master,
            sub = %id,
            worker = sub.worker,
            completed = order.completed(),
            total = order.total(),
            "Sub-order approved"
        );
        Ok(sub)
    }

    /// Cancels a created order left unpaid for longer than the payment
    /// timeout. Returns `false` when the order no longer qualifies.
    pub async fn expire_unpaid(&self, id: OrderId) -> Result<bool> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut order = master_in(tx.as_ref(), id).await?;
        if order.state() != MasterState::Created
            || now - order.updated_at < to_chrono(self.config.payment_timeout)?
        {
            return Ok(false);
        }
        order.transition(MasterState::Cancel, now)?;
        tx.update_master_order(order).await?;
        tx.commit().await?;
        info!(order = %id, "Unpaid master order cancelled");
        Ok(true)
    }

    /// Closes an order whose deadline has passed: `Done` when every unit was
    /// completed, `Finish` otherwise. Under [`DeadlinePolicy::RefundUnfilled`]
    /// the owner gets the fee of the uncompleted units back in the same unit
    /// of work.
    pub async fn finish_at_deadline(&self, id: OrderId) -> Result<Option<MasterState>> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut order = master_in(tx.as_ref(), id).await?;
        if order.state() != MasterState::Doing || now < order.spec.deadline {
            return Ok(None);
        }

        let next = if order.is_filled() {
            MasterState::Done
        } else {
            MasterState::Finish
        };
        order.transition(next, now)?;

        if next == MasterState::Finish && self.config.deadline_policy == DeadlinePolicy::RefundUnfilled
        {
            let refund = self.config.publish_unit_price.times(order.remaining())?;
            self.wallet
                .credit_in(
                    tx.as_mut(),
                    order.owner,
                    refund,
                    TradeType::ReturnOrder,
                    TradeId::from(id),
                )
                .await?;
            info!(order = %id, %refund, "Unfilled units refunded");
        }

        tx.update_master_order(order.clone()).await?;
        tx.commit().await?;
        info!(
            order = %id,
            state = %next,
            completed = order.completed(),
            total = order.total(),
            "Master order closed at deadline"
        );
        Ok(Some(next))
    }

    /// Times out a sub-order still open once the sub-order timeout has
    /// passed since it was accepted, freeing its unit. Submitting or being
    /// rejected does not restart the timeout. Returns `false` when it no
    /// longer qualifies.
    pub async fn time_out_sub_order(&self, id: SubOrderId) -> Result<bool> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut sub = tx
            .sub_order(id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Sub-order {id}")))?;
        if !self.timeout_states().contains(&sub.state())
            || now - sub.created_at < to_chrono(self.config.sub_order_timeout)?
        {
            return Ok(false);
        }
        sub.transition(SubState::Timeout, now)?;
        tx.update_sub_order(sub.clone()).await?;
        tx.commit().await?;
        info!(order = %sub.master, sub = %id, worker = sub.worker, "Sub-order timed out");
        Ok(true)
    }

    /// States the stale sub-order scan looks at.
    pub fn timeout_states(&self) -> Vec<SubState> {
        if self.config.timeout_rejected {
            vec![SubState::Accept, SubState::Reject]
        } else {
            vec![SubState::Accept]
        }
    }
}

async fn master_in(tx: &dyn UnitOfWork, id: OrderId) -> Result<MasterOrder> {
    tx.master_order(id)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("Master order {id}")))
}

async fn sub_in(tx: &dyn UnitOfWork, master: OrderId, id: SubOrderId) -> Result<SubOrder> {
    tx.sub_order(id)
        .await?
        .filter(|sub| sub.master == master)
        .ok_or_else(|| DispatchError::NotFound(format!("Sub-order {id} of master order {master}")))
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> Result<Duration> {
    Duration::from_std(duration)
        .map_err(|e| DispatchError::Validation(format!("Duration out of range: {e}")))
}
