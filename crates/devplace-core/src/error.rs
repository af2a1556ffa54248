//! Error types for devplace

use thiserror::Error;

/// Main error type for devplace
#[derive(Error, Debug)]
pub enum DevplaceError {
    /// The node exposes no device groups at all
    #[error("no devices available")]
    NoDevicesAvailable,

    /// The request can never be satisfied as written
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Every device group failed feasibility filtering
    #[error("no devices match request: {0}")]
    NoMatch(String),

    /// No device group identity matches a shared-device request
    #[error("no shared devices match request: {0}")]
    NoMatchingDevice(String),

    /// A matching group was found but its usage could not be derived
    #[error("failed to compute device usage: {0}")]
    UsageComputation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DevplaceError {
    /// Whether the error only makes the current request infeasible on this
    /// node, as opposed to a broken input or environment.
    pub fn is_infeasible(&self) -> bool {
        matches!(
            self,
            DevplaceError::NoDevicesAvailable
                | DevplaceError::InvalidRequest(_)
                | DevplaceError::NoMatch(_)
                | DevplaceError::NoMatchingDevice(_)
                | DevplaceError::UsageComputation(_)
        )
    }
}

/// Result type for devplace operations
pub type DevplaceResult<T> = Result<T, DevplaceError>;

impl From<serde_json::Error> for DevplaceError {
    fn from(err: serde_json::Error) -> Self {
        DevplaceError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DevplaceError {
    fn from(err: toml::de::Error) -> Self {
        DevplaceError::Config(err.to_string())
    }
}
