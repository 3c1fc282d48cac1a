//! Error taxonomy shared by the control core.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// A command was correctly refused by the safety guardian.
    #[error("safety violation: {0}")]
    SafetyViolation(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// Reading arrived without one of the core fields.
    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControlError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// True for rejections issued by the safety layer.
    pub fn is_safety(&self) -> bool {
        matches!(self, Self::SafetyViolation(_))
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Run `fut` under `after`, mapping an elapsed deadline to `ControlError::Timeout`.
pub async fn with_timeout<T, F>(what: &str, after: Duration, fut: F) -> ControlResult<T>
where
    F: std::future::Future<Output = ControlResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(ControlError::timeout(what, after)),
    }
}
