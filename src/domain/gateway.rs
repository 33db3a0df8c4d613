//! Types exchanged with the external payment gateway.

use super::ledger::TradeId;
use super::money::Amount;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Gateway rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
    #[error("Gateway notification rejected: {0}")]
    InvalidNotification(String),
    #[error("Gateway has no record of trade {0}")]
    UnknownTrade(TradeId),
}

/// What the payer's client needs to complete a prepay order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepayToken {
    pub trade_id: TradeId,
    pub prepay_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferOutcome {
    Processing,
    Success,
    Fail,
}

/// Status of a batch transfer: the batch-level status string as reported by
/// the gateway plus the outcome of the single transfer detail in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub batch_status: String,
    pub detail: TransferOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentOutcome {
    NotPay,
    Success,
    Closed,
    PayError,
}

impl PaymentOutcome {
    pub fn is_terminal(self) -> bool {
        self != PaymentOutcome::NotPay
    }
}

/// A verified payment notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub trade_id: TradeId,
    pub payer: String,
    pub amount: Amount,
    pub outcome: PaymentOutcome,
}

/// A payment notification as received by the callback endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub signature: String,
    pub body: Vec<u8>,
}
