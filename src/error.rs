use crate::domain::gateway::GatewayError;
use crate::domain::order::OrderId;
use crate::domain::user::UserId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("Insufficient balance for user {user}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        user: UserId,
        balance: i64,
        requested: i64,
    },
    #[error("Wallet policy violation: {0}")]
    WalletPolicy(String),
    #[error("Master order {0} has no remaining capacity")]
    CapacityExceeded(OrderId),
    #[error("Worker {worker} already holds a sub-order of master order {order}")]
    DuplicateAcceptance { order: OrderId, worker: UserId },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Errors caused by the caller's input or the current state of the data,
    /// as opposed to infrastructure failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::StateConflict(_)
                | Self::InsufficientBalance { .. }
                | Self::WalletPolicy(_)
                | Self::CapacityExceeded(_)
                | Self::DuplicateAcceptance { .. }
                | Self::NotFound(_)
                | Self::Forbidden(_)
        )
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("Serialization error: {err}"))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for DispatchError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Persistence(err.into_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_distinguished_from_failures() {
        assert!(DispatchError::Validation("bad".into()).is_rejection());
        assert!(DispatchError::CapacityExceeded(uuid::Uuid::nil()).is_rejection());
        assert!(!DispatchError::Persistence("disk".into()).is_rejection());
        assert!(!DispatchError::Gateway(GatewayError::Unavailable("down".into())).is_rejection());
    }
}
