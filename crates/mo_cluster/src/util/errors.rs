use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

use crate::hakeeper::RpcError;

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("HAKeeper Error: {0}")]
    HaKeeperError(#[source] RpcError),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidSpec: {0}")]
    InvalidSpec(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("ConfigError: {0}")]
    ConfigError(String),

    #[error("SerializationError: {0}")]
    SerializationError(String),

    #[error("NotReady: {0}")]
    NotReady(String),
}

impl StdError {
    pub fn metric_label(&self) -> String {
        match self {
            StdError::JsonSerializationError(_) => "jsonserializationerror",
            StdError::KubeError(_) => "kubeerror",
            StdError::HaKeeperError(_) => "hakeepererror",
            StdError::MetadataMissing(_) => "metadatamissing",
            StdError::InvalidSpec(_) => "invalidspec",
            StdError::InvalidArgument(_) => "invalidargument",
            StdError::ConfigError(_) => "configerror",
            StdError::SerializationError(_) => "serializationerror",
            StdError::NotReady(_) => "notready",
        }
        .to_string()
    }
}

/// Asks the runtime to run the reconciliation again after `duration`
#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (requeue after {:?})", self.error, self.duration)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[source] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
        }
    }

    /// Resync after `duration`, reporting `reason`
    pub fn requeue(duration: Duration, reason: impl Into<String>) -> Error {
        Error::ErrorWithRequeue(ErrorWithRequeue::new(StdError::NotReady(reason.into()), duration))
    }

    pub fn invalid_spec(msg: impl Into<String>) -> Error {
        Error::StdError(StdError::InvalidSpec(msg.into()))
    }

    pub fn metadata_missing(what: impl Into<String>) -> Error {
        Error::StdError(StdError::MetadataMissing(what.into()))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::StdError(StdError::KubeError(kube::Error::Api(e))) if e.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::StdError(StdError::KubeError(kube::Error::Api(e))) if e.code == 404)
    }

    pub fn is_store_not_exist(&self) -> bool {
        matches!(self, Error::StdError(StdError::HaKeeperError(RpcError::StoreNotExist(_))))
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::StdError(StdError::KubeError(e))
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        Error::StdError(StdError::HaKeeperError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::StdError(StdError::JsonSerializationError(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_carries_duration() {
        match Error::requeue(Duration::from_secs(5), "logset not ready") {
            Error::ErrorWithRequeue(e) => {
                assert_eq!(e.duration, Duration::from_secs(5));
                assert_eq!(e.metric_label(), "notready");
            }
            Error::StdError(_) => panic!("expected requeue"),
        }
    }

    #[test]
    fn store_not_exist_is_recognised() {
        let err: Error = RpcError::StoreNotExist("abc".to_string()).into();
        assert!(err.is_store_not_exist());
        assert!(!err.is_conflict());
    }
}
