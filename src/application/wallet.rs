use crate::config::DispatchConfig;
use crate::domain::gateway::{GatewayError, PaymentOutcome, PrepayToken, RawNotification, TransferOutcome, TransferStatus};
use crate::domain::ledger::{Direction, LedgerEntry, LedgerFilter, LedgerKey, TradeFamily, TradeId, TradeType};
use crate::domain::money::{Amount, Balance};
use crate::domain::ports::{ClockRef, DatabaseRef, GatewayRef, LedgerStore, UnitOfWork, UserStore};
use crate::domain::user::{Role, User, UserId};
use crate::error::{DispatchError, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a debit or credit.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerWrite {
    Applied(LedgerEntry),
    /// An entry with the same trade id and family exists; nothing changed.
    AlreadyApplied,
}

impl LedgerWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, LedgerWrite::Applied(_))
    }
}

/// Outcome of settling a pending recharge or withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The marker row moved to this terminal type.
    Settled(TradeType),
    /// The gateway has no final answer yet.
    Pending,
    /// The row was already terminal; nothing changed.
    AlreadySettled,
}

/// Owns every balance mutation.
///
/// A balance and the ledger entry that explains it are always written in the
/// same unit of work. The `*_in` variants join a caller's transaction so an
/// order state change and its money movement commit together.
#[derive(Clone)]
pub struct WalletService {
    db: DatabaseRef,
    gateway: GatewayRef,
    clock: ClockRef,
    config: Arc<DispatchConfig>,
}

impl WalletService {
    pub fn new(
        db: DatabaseRef,
        gateway: GatewayRef,
        clock: ClockRef,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            db,
            gateway,
            clock,
            config,
        }
    }

    pub async fn register_user(
        &self,
        id: UserId,
        role: Role,
        handle: &str,
        name: &str,
    ) -> Result<User> {
        let user = User::new(id, role, handle, name);
        let mut tx = self.db.begin().await?;
        tx.insert_user(user.clone()).await?;
        tx.commit().await?;
        info!(user = id, %role, "User registered");
        Ok(user)
    }

    pub async fn user(&self, id: UserId) -> Result<User> {
        let tx = self.db.begin().await?;
        user_in(tx.as_ref(), id).await
    }

    pub async fn users(&self) -> Result<Vec<User>> {
        let tx = self.db.begin().await?;
        tx.users().await
    }

    pub async fn balance(&self, id: UserId) -> Result<Balance> {
        Ok(self.user(id).await?.balance())
    }

    pub async fn ledger(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        let tx = self.db.begin().await?;
        tx.ledger_entries(filter).await
    }

    /// Entries still waiting for a gateway outcome.
    pub async fn pending_trades(&self) -> Result<Vec<LedgerEntry>> {
        self.ledger(&LedgerFilter {
            user: None,
            trade_types: vec![TradeType::RechargeInProgress, TradeType::WithdrawInProgress],
        })
        .await
    }

    pub async fn debit(
        &self,
        user: UserId,
        amount: Amount,
        trade_type: TradeType,
        trade_id: TradeId,
    ) -> Result<LedgerWrite> {
        let mut tx = self.db.begin().await?;
        let write = self
            .debit_in(tx.as_mut(), user, amount, trade_type, trade_id)
            .await?;
        tx.commit().await?;
        Ok(write)
    }

    pub async fn credit(
        &self,
        user: UserId,
        amount: Amount,
        trade_type: TradeType,
        trade_id: TradeId,
    ) -> Result<LedgerWrite> {
        let mut tx = self.db.begin().await?;
        let write = self
            .credit_in(tx.as_mut(), user, amount, trade_type, trade_id)
            .await?;
        tx.commit().await?;
        Ok(write)
    }

    /// Debits `user` inside the caller's transaction.
    pub async fn debit_in(
        &self,
        tx: &mut dyn UnitOfWork,
        user: UserId,
        amount: Amount,
        trade_type: TradeType,
        trade_id: TradeId,
    ) -> Result<LedgerWrite> {
        ensure_direct(trade_type, Direction::Debit)?;
        self.write_in(tx, user, amount, trade_type, trade_id).await
    }

    /// Credits `user` inside the caller's transaction.
    pub async fn credit_in(
        &self,
        tx: &mut dyn UnitOfWork,
        user: UserId,
        amount: Amount,
        trade_type: TradeType,
        trade_id: TradeId,
    ) -> Result<LedgerWrite> {
        ensure_direct(trade_type, Direction::Credit)?;
        self.write_in(tx, user, amount, trade_type, trade_id).await
    }

    async fn write_in(
        &self,
        tx: &mut dyn UnitOfWork,
        user_id: UserId,
        amount: Amount,
        trade_type: TradeType,
        trade_id: TradeId,
    ) -> Result<LedgerWrite> {
        let key = LedgerKey::new(trade_id.clone(), trade_type.family());
        if tx.ledger_entry(&key).await?.is_some() {
            return Ok(LedgerWrite::AlreadyApplied);
        }

        let mut user = user_in(&*tx, user_id).await?;

        let balance = match trade_type.direction() {
            Direction::Debit => {
                if trade_type.family() == TradeFamily::Withdraw {
                    self.check_withdrawal_policy(&user, amount)?;
                }
                if !user.balance().covers(amount) {
                    return Err(DispatchError::InsufficientBalance {
                        user: user_id,
                        balance: user.balance().value(),
                        requested: amount.value(),
                    });
                }
                user.balance().debit(amount)?
            }
            Direction::Credit if trade_type.is_effective() => user.balance().credit(amount)?,
            Direction::Credit => user.balance(),
        };

        let entry = LedgerEntry::new(trade_id, user_id, trade_type, amount, balance, self.clock.now());
        if !tx.append(entry.clone()).await? {
            return Ok(LedgerWrite::AlreadyApplied);
        }
        if balance != user.balance() {
            user.set_balance(balance);
            tx.update_user(user).await?;
        }
        info!(
            user = user_id,
            trade_id = %entry.trade_id,
            trade_type = ?trade_type,
            amount = entry.amount,
            balance = balance.value(),
            "Ledger entry applied"
        );
        Ok(LedgerWrite::Applied(entry))
    }

    fn check_withdrawal_policy(&self, user: &User, amount: Amount) -> Result<()> {
        let policy = &self.config.wallet;
        if amount.value() > policy.max_withdrawal {
            return Err(DispatchError::WalletPolicy(format!(
                "Withdrawal of {amount} exceeds the maximum of {}",
                Balance::new(policy.max_withdrawal)
            )));
        }
        if user.role == Role::Worker
            && user.balance().value() >= amount.value()
            && user.balance().value() - amount.value() < policy.worker_min_balance
        {
            return Err(DispatchError::WalletPolicy(format!(
                "Workers must keep a balance of at least {}",
                Balance::new(policy.worker_min_balance)
            )));
        }
        Ok(())
    }

    /// Starts a top-up: creates the prepay order at the gateway, then records
    /// a pending entry that credits nothing until the payment settles.
    pub async fn recharge(&self, user_id: UserId, amount: Amount) -> Result<PrepayToken> {
        let user = self.user(user_id).await?;
        let trade_id = TradeId::generate();
        let description = format!("wallet recharge {amount}");
        let token = self
            .gateway
            .create_prepay_order(&user.handle, &trade_id, &description, amount)
            .await?;

        let mut tx = self.db.begin().await?;
        self.write_in(
            tx.as_mut(),
            user_id,
            amount,
            TradeType::RechargeInProgress,
            trade_id,
        )
        .await?;
        tx.commit().await?;
        Ok(token)
    }

    /// Starts a withdrawal: debits the wallet right away, then asks the
    /// gateway to transfer the money. A gateway error is returned to the
    /// caller and the entry stays pending until reconciliation resolves it.
    pub async fn withdraw(&self, user_id: UserId, amount: Amount) -> Result<TradeId> {
        let trade_id = TradeId::generate();
        let handle = {
            let mut tx = self.db.begin().await?;
            let handle = user_in(tx.as_ref(), user_id).await?.handle;
            self.write_in(
                tx.as_mut(),
                user_id,
                amount,
                TradeType::WithdrawInProgress,
                trade_id.clone(),
            )
            .await?;
            tx.commit().await?;
            handle
        };

        let description = format!("wallet withdrawal {amount}");
        match self
            .gateway
            .initiate_transfer(&handle, &trade_id, &description, amount)
            .await
        {
            Ok(batch) => {
                info!(user = user_id, %trade_id, batch = %batch.0, "Transfer initiated");
                Ok(trade_id)
            }
            Err(e) => {
                warn!(user = user_id, %trade_id, error = %e, "Transfer initiation failed, left pending");
                Err(e.into())
            }
        }
    }

    /// Verifies a gateway payment notification and settles the recharge it
    /// reports.
    pub async fn handle_payment_notification(&self, raw: &RawNotification) -> Result<Settlement> {
        let event = self
            .gateway
            .verify_and_parse_payment_notification(raw)
            .await?;

        let key = LedgerKey::new(event.trade_id.clone(), TradeFamily::Recharge);
        let tx = self.db.begin().await?;
        let entry = tx
            .ledger_entry(&key)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Recharge {}", event.trade_id)))?;
        let payer = user_in(tx.as_ref(), entry.user).await?;
        drop(tx);
        if payer.handle != event.payer {
            return Err(DispatchError::Validation(format!(
                "Notification payer does not own recharge {}",
                event.trade_id
            )));
        }

        self.settle_recharge(&event.trade_id, event.outcome, Some(event.amount))
            .await
    }

    /// Moves a pending recharge to its terminal type. A successful payment
    /// credits the wallet; `paid`, when known, must match the recorded amount.
    pub async fn settle_recharge(
        &self,
        trade_id: &TradeId,
        outcome: PaymentOutcome,
        paid: Option<Amount>,
    ) -> Result<Settlement> {
        let mut tx = self.db.begin().await?;
        let key = LedgerKey::new(trade_id.clone(), TradeFamily::Recharge);
        let mut entry = tx
            .ledger_entry(&key)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Recharge {trade_id}")))?;
        if entry.trade_type != TradeType::RechargeInProgress {
            return Ok(Settlement::AlreadySettled);
        }

        let amount = entry.magnitude()?;
        let settled = match outcome {
            PaymentOutcome::NotPay => return Ok(Settlement::Pending),
            PaymentOutcome::Success => {
                if let Some(paid) = paid
                    && paid != amount
                {
                    return Err(DispatchError::Validation(format!(
                        "Recharge {trade_id} paid {paid}, expected {amount}"
                    )));
                }
                let mut user = user_in(tx.as_ref(), entry.user).await?;
                let balance = user.balance().credit(amount)?;
                user.set_balance(balance);
                tx.update_user(user).await?;
                entry.balance_after = balance;
                TradeType::Recharge
            }
            PaymentOutcome::Closed | PaymentOutcome::PayError => TradeType::RechargeFailed,
        };

        entry.trade_type = settled;
        entry.updated_at = self.clock.now();
        tx.replace_entry(entry.clone()).await?;
        tx.commit().await?;
        info!(user = entry.user, %trade_id, outcome = ?outcome, "Recharge settled");
        Ok(Settlement::Settled(settled))
    }

    /// Moves a pending withdrawal to its terminal type. A failed transfer
    /// credits the amount back.
    pub async fn settle_withdrawal(
        &self,
        trade_id: &TradeId,
        status: &TransferStatus,
    ) -> Result<Settlement> {
        let mut tx = self.db.begin().await?;
        let key = LedgerKey::new(trade_id.clone(), TradeFamily::Withdraw);
        let mut entry = tx
            .ledger_entry(&key)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("Withdrawal {trade_id}")))?;
        if entry.trade_type != TradeType::WithdrawInProgress {
            return Ok(Settlement::AlreadySettled);
        }

        let settled = match status.detail {
            TransferOutcome::Processing => return Ok(Settlement::Pending),
            TransferOutcome::Success => TradeType::Withdraw,
            TransferOutcome::Fail => {
                let mut user = user_in(tx.as_ref(), entry.user).await?;
                let balance = user.balance().credit(entry.magnitude()?)?;
                user.set_balance(balance);
                tx.update_user(user).await?;
                entry.balance_after = balance;
                TradeType::WithdrawFailed
            }
        };

        entry.trade_type = settled;
        entry.updated_at = self.clock.now();
        tx.replace_entry(entry.clone()).await?;
        tx.commit().await?;
        info!(
            user = entry.user,
            %trade_id,
            batch_status = %status.batch_status,
            detail = ?status.detail,
            "Withdrawal settled"
        );
        Ok(Settlement::Settled(settled))
    }

    /// Polls the gateway for one pending entry and settles it.
    ///
    /// A trade the gateway has never heard of is given up as failed once it
    /// is older than the payment timeout; until then it stays pending.
    pub async fn reconcile(&self, entry: &LedgerEntry) -> Result<Settlement> {
        let trade_id = &entry.trade_id;
        let expired = self.clock.now() - entry.created_at
            >= Duration::from_std(self.config.payment_timeout)
                .map_err(|e| DispatchError::Validation(format!("Invalid payment timeout: {e}")))?;

        match entry.trade_type {
            TradeType::RechargeInProgress => {
                match self.gateway.poll_payment_status(trade_id).await {
                    Ok(outcome) => self.settle_recharge(trade_id, outcome, None).await,
                    Err(GatewayError::UnknownTrade(_)) if expired => {
                        self.settle_recharge(trade_id, PaymentOutcome::Closed, None)
                            .await
                    }
                    Err(GatewayError::UnknownTrade(_)) => Ok(Settlement::Pending),
                    Err(e) => Err(e.into()),
                }
            }
            TradeType::WithdrawInProgress => {
                match self.gateway.poll_transfer_status(trade_id).await {
                    Ok(status) => self.settle_withdrawal(trade_id, &status).await,
                    Err(GatewayError::UnknownTrade(_)) if expired => {
                        let status = TransferStatus {
                            batch_status: "NOT_FOUND".to_string(),
                            detail: TransferOutcome::Fail,
                        };
                        self.settle_withdrawal(trade_id, &status).await
                    }
                    Err(GatewayError::UnknownTrade(_)) => Ok(Settlement::Pending),
                    Err(e) => Err(e.into()),
                }
            }
            _ => Ok(Settlement::AlreadySettled),
        }
    }
}

async fn user_in(tx: &dyn UnitOfWork, id: UserId) -> Result<User> {
    tx.user(id)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("User {id}")))
}

fn ensure_direct(trade_type: TradeType, direction: Direction) -> Result<()> {
    if trade_type.is_direct() && trade_type.direction() == direction {
        Ok(())
    } else {
        Err(DispatchError::Validation(format!(
            "Trade type {trade_type:?} cannot be used for a {direction:?}"
        )))
    }
}
