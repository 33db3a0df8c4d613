//! Runtime configuration.
//!
//! Every field has a default so a config file only needs to name what it
//! overrides. Durations are written in whole seconds.

use crate::domain::money::Amount;
use crate::error::{DispatchError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

/// What happens to capacity that nobody completed once a master order's
/// deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// No money moves; the decision is left to an operator.
    #[default]
    Hold,
    /// Credit the owner the publishing fee of every uncompleted unit.
    RefundUnfilled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletPolicy {
    /// Balance a worker must keep after a withdrawal.
    pub worker_min_balance: i64,
    /// Largest single withdrawal.
    pub max_withdrawal: i64,
}

impl Default for WalletPolicy {
    fn default() -> Self {
        Self {
            worker_min_balance: 0,
            max_withdrawal: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Shared secret used to verify payment notifications.
    pub notification_secret: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            notification_secret: "sandbox-secret".to_string(),
        }
    }
}

const DEFAULT_UNIT_PRICE: Amount = Amount::from_const(200);
const DEFAULT_COMMISSION: Amount = Amount::from_const(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Fee per unit charged to the publisher, in minor units.
    pub publish_unit_price: Amount,
    /// Credit paid to a worker per approved sub-order, in minor units.
    pub commission: Amount,
    /// How long a created order may stay unpaid.
    #[serde(with = "seconds")]
    pub payment_timeout: Duration,
    /// How long an accepted (or rejected) sub-order may sit untouched.
    #[serde(with = "seconds")]
    pub sub_order_timeout: Duration,
    /// Also time out sub-orders left in the rejected state.
    pub timeout_rejected: bool,
    #[serde(with = "seconds")]
    pub scan_interval: Duration,
    pub deadline_policy: DeadlinePolicy,
    pub wallet: WalletPolicy,
    pub gateway: GatewayConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            publish_unit_price: DEFAULT_UNIT_PRICE,
            commission: DEFAULT_COMMISSION,
            payment_timeout: Duration::from_secs(600),
            sub_order_timeout: Duration::from_secs(600),
            timeout_rejected: true,
            scan_interval: Duration::from_secs(10),
            deadline_policy: DeadlinePolicy::Hold,
            wallet: WalletPolicy::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| DispatchError::Validation(format!("Invalid configuration: {e}")))
    }
}

mod seconds {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DispatchConfig::default();
        assert_eq!(config.publish_unit_price.value(), 200);
        assert_eq!(config.commission.value(), 100);
        assert_eq!(config.payment_timeout, Duration::from_secs(600));
        assert_eq!(config.scan_interval, Duration::from_secs(10));
        assert_eq!(config.deadline_policy, DeadlinePolicy::Hold);
        assert!(config.timeout_rejected);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"publish_unit_price": 100, "payment_timeout": 60, "deadline_policy": "refund_unfilled", "wallet": {{"worker_min_balance": 50}}}}"#
        )
        .unwrap();

        let config = DispatchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.publish_unit_price.value(), 100);
        assert_eq!(config.payment_timeout, Duration::from_secs(60));
        assert_eq!(config.deadline_policy, DeadlinePolicy::RefundUnfilled);
        assert_eq!(config.wallet.worker_min_balance, 50);
        assert_eq!(config.wallet.max_withdrawal, 20_000);
        assert_eq!(config.commission.value(), 100);
    }

    #[test]
    fn test_non_positive_price_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"commission": 0}}"#).unwrap();
        assert!(matches!(
            DispatchConfig::from_file(file.path()),
            Err(DispatchError::Validation(_))
        ));
    }
}
