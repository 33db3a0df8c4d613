//! An in-process payment gateway.
//!
//! Prepay orders and transfers are recorded in memory and stay pending until
//! settled through [`SandboxGateway::settle_payment`] or
//! [`SandboxGateway::settle_transfer`]. Notifications are signed with
//! HMAC-SHA256 over the JSON body using the configured shared secret, the
//! same way the verifying side checks them.

use crate::domain::gateway::{
    BatchId, GatewayError, PaymentOutcome, PrepayToken, RawNotification, SettlementEvent,
    TransferOutcome, TransferStatus,
};
use crate::domain::ledger::TradeId;
use crate::domain::money::Amount;
use crate::domain::ports::PaymentGateway;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
struct Payment {
    payer: String,
    amount: Amount,
    outcome: PaymentOutcome,
}

#[derive(Debug, Clone)]
struct Transfer {
    batch_id: BatchId,
    outcome: TransferOutcome,
}

#[derive(Debug, Default)]
struct SandboxState {
    payments: HashMap<TradeId, Payment>,
    transfers: HashMap<TradeId, Transfer>,
    unavailable: bool,
    next_id: u64,
}

pub struct SandboxGateway {
    secret: String,
    state: Mutex<SandboxState>,
}

impl SandboxGateway {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            state: Mutex::new(SandboxState::default()),
        }
    }

    /// While set, every gateway call fails with `Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Records the payer's outcome for a prepay order.
    pub async fn settle_payment(
        &self,
        trade_id: &TradeId,
        outcome: PaymentOutcome,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let payment = state
            .payments
            .get_mut(trade_id)
            .ok_or_else(|| GatewayError::UnknownTrade(trade_id.clone()))?;
        payment.outcome = outcome;
        Ok(())
    }

    /// Records the outcome of a transfer.
    pub async fn settle_transfer(
        &self,
        trade_id: &TradeId,
        outcome: TransferOutcome,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        let transfer = state
            .transfers
            .get_mut(trade_id)
            .ok_or_else(|| GatewayError::UnknownTrade(trade_id.clone()))?;
        transfer.outcome = outcome;
        Ok(())
    }

    /// Whether the gateway holds a prepay order or a transfer for `trade_id`.
    pub async fn knows(&self, trade_id: &TradeId) -> bool {
        let state = self.state.lock().await;
        state.payments.contains_key(trade_id) || state.transfers.contains_key(trade_id)
    }

    /// Builds the notification the gateway would send for a prepay order in
    /// its current state.
    pub async fn payment_notification(
        &self,
        trade_id: &TradeId,
    ) -> Result<RawNotification, GatewayError> {
        let payment = self
            .state
            .lock()
            .await
            .payments
            .get(trade_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownTrade(trade_id.clone()))?;
        self.sign_notification(&SettlementEvent {
            trade_id: trade_id.clone(),
            payer: payment.payer,
            amount: payment.amount,
            outcome: payment.outcome,
        })
    }

    pub fn sign_notification(
        &self,
        event: &SettlementEvent,
    ) -> Result<RawNotification, GatewayError> {
        let body = serde_json::to_vec(event)
            .map_err(|e| GatewayError::InvalidNotification(e.to_string()))?;
        let mut mac = self.mac()?;
        mac.update(&body);
        Ok(RawNotification {
            signature: hex::encode(mac.finalize().into_bytes()),
            body,
        })
    }

    fn mac(&self) -> Result<HmacSha256, GatewayError> {
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| GatewayError::InvalidNotification("HMAC key error".to_string()))
    }

    async fn available(&self) -> Result<tokio::sync::MutexGuard<'_, SandboxState>, GatewayError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(GatewayError::Unavailable("sandbox offline".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_prepay_order(
        &self,
        payer: &str,
        trade_id: &TradeId,
        description: &str,
        amount: Amount,
    ) -> Result<PrepayToken, GatewayError> {
        let mut state = self.available().await?;
        if state.payments.contains_key(trade_id) {
            return Err(GatewayError::Rejected {
                code: "ORDER_EXISTS".to_string(),
                message: format!("Duplicate out trade no {trade_id}"),
            });
        }
        state.next_id += 1;
        let prepay_id = format!("prepay-{}", state.next_id);
        state.payments.insert(
            trade_id.clone(),
            Payment {
                payer: payer.to_string(),
                amount,
                outcome: PaymentOutcome::NotPay,
            },
        );
        debug!(%trade_id, %payer, %amount, description, "Sandbox prepay order created");
        Ok(PrepayToken {
            trade_id: trade_id.clone(),
            prepay_id,
        })
    }

    async fn initiate_transfer(
        &self,
        payee: &str,
        trade_id: &TradeId,
        description: &str,
        amount: Amount,
    ) -> Result<BatchId, GatewayError> {
        let mut state = self.available().await?;
        if let Some(existing) = state.transfers.get(trade_id) {
            return Ok(existing.batch_id.clone());
        }
        state.next_id += 1;
        let batch_id = BatchId(format!("batch-{}", state.next_id));
        state.transfers.insert(
            trade_id.clone(),
            Transfer {
                batch_id: batch_id.clone(),
                outcome: TransferOutcome::Processing,
            },
        );
        debug!(%trade_id, %payee, %amount, description, "Sandbox transfer initiated");
        Ok(batch_id)
    }

    async fn poll_transfer_status(
        &self,
        trade_id: &TradeId,
    ) -> Result<TransferStatus, GatewayError> {
        let state = self.available().await?;
        let transfer = state
            .transfers
            .get(trade_id)
            .ok_or_else(|| GatewayError::UnknownTrade(trade_id.clone()))?;
        let batch_status = match transfer.outcome {
            TransferOutcome::Processing => "PROCESSING",
            TransferOutcome::Success | TransferOutcome::Fail => "FINISHED",
        };
        Ok(TransferStatus {
            batch_status: batch_status.to_string(),
            detail: transfer.outcome,
        })
    }

    async fn poll_payment_status(
        &self,
        trade_id: &TradeId,
    ) -> Result<PaymentOutcome, GatewayError> {
        let state = self.available().await?;
        state
            .payments
            .get(trade_id)
            .map(|payment| payment.outcome)
            .ok_or_else(|| GatewayError::UnknownTrade(trade_id.clone()))
    }

    async fn verify_and_parse_payment_notification(
        &self,
        raw: &RawNotification,
    ) -> Result<SettlementEvent, GatewayError> {
        let signature = hex::decode(&raw.signature)
            .map_err(|_| GatewayError::InvalidNotification("Invalid signature hex".to_string()))?;
        let mut mac = self.mac()?;
        mac.update(&raw.body);
        mac.verify_slice(&signature)
            .map_err(|_| GatewayError::InvalidNotification("Signature mismatch".to_string()))?;
        serde_json::from_slice(&raw.body)
            .map_err(|e| GatewayError::InvalidNotification(format!("Malformed body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(value: i64) -> Amount {
        Amount::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_payment_lifecycle() {
        let gateway = SandboxGateway::new("secret");
        let trade = TradeId::from("r-1");
        gateway
            .create_prepay_order("wx-1", &trade, "wallet recharge 1.00", amount(100))
            .await
            .unwrap();
        assert_eq!(
            gateway.poll_payment_status(&trade).await.unwrap(),
            PaymentOutcome::NotPay
        );

        gateway
            .settle_payment(&trade, PaymentOutcome::Success)
            .await
            .unwrap();
        assert_eq!(
            gateway.poll_payment_status(&trade).await.unwrap(),
            PaymentOutcome::Success
        );
        assert!(matches!(
            gateway.poll_payment_status(&TradeId::from("nope")).await,
            Err(GatewayError::UnknownTrade(_))
        ));
    }

    #[tokio::test]
    async fn test_transfer_status_reports_batch_and_detail() {
        let gateway = SandboxGateway::new("secret");
        let trade = TradeId::from("w-1");
        let batch = gateway
            .initiate_transfer("wx-2", &trade, "wallet withdrawal 1.00", amount(100))
            .await
            .unwrap();
        // Re-initiating the same trade returns the original batch.
        assert_eq!(
            gateway
                .initiate_transfer("wx-2", &trade, "wallet withdrawal 1.00", amount(100))
                .await
                .unwrap(),
            batch
        );

        let status = gateway.poll_transfer_status(&trade).await.unwrap();
        assert_eq!(status.batch_status, "PROCESSING");
        assert_eq!(status.detail, TransferOutcome::Processing);

        gateway
            .settle_transfer(&trade, TransferOutcome::Fail)
            .await
            .unwrap();
        let status = gateway.poll_transfer_status(&trade).await.unwrap();
        assert_eq!(status.batch_status, "FINISHED");
        assert_eq!(status.detail, TransferOutcome::Fail);
    }

    #[tokio::test]
    async fn test_notification_signature_is_verified() {
        let gateway = SandboxGateway::new("secret");
        let trade = TradeId::from("r-2");
        gateway
            .create_prepay_order("wx-1", &trade, "wallet recharge 2.50", amount(250))
            .await
            .unwrap();
        gateway
            .settle_payment(&trade, PaymentOutcome::Success)
            .await
            .unwrap();

        let raw = gateway.payment_notification(&trade).await.unwrap();
        let event = gateway
            .verify_and_parse_payment_notification(&raw)
            .await
            .unwrap();
        assert_eq!(event.trade_id, trade);
        assert_eq!(event.amount, amount(250));
        assert_eq!(event.outcome, PaymentOutcome::Success);

        let mut tampered = raw.clone();
        tampered.body = tampered
            .body
            .iter()
            .map(|b| if *b == b'5' { b'9' } else { *b })
            .collect();
        assert!(matches!(
            gateway.verify_and_parse_payment_notification(&tampered).await,
            Err(GatewayError::InvalidNotification(_))
        ));

        let other = SandboxGateway::new("another-secret");
        assert!(other.verify_and_parse_payment_notification(&raw).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_gateway_fails_calls() {
        let gateway = SandboxGateway::new("secret");
        gateway.set_unavailable(true).await;
        assert!(matches!(
            gateway
                .create_prepay_order("wx", &TradeId::from("t"), "d", amount(1))
                .await,
            Err(GatewayError::Unavailable(_))
        ));
        gateway.set_unavailable(false).await;
        assert!(
            gateway
                .create_prepay_order("wx", &TradeId::from("t"), "d", amount(1))
                .await
                .is_ok()
        );
    }
}
