use crate::types::ZoneId;
use std::any::Any;
use thiserror::Error;

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors raised by a [`DeviceApiClient`](crate::DeviceApiClient) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The call never reached the device or the response was lost
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device API understood the call and refused it (e.g. unsupported mode)
    #[error("Rejected by device API: {0}")]
    Rejected(String),

    /// The call did not complete in time
    #[error("Device call timed out")]
    Timeout,

    /// The zone is not present in the device's status
    #[error("Zone not found: {0}")]
    ZoneNotFound(ZoneId),

    /// The session or account is unusable; no further calls can succeed
    #[error("Fatal device error: {0}")]
    Fatal(String),
}

impl DeviceError {
    /// Whether this error must abort the whole run instead of marking a
    /// single combination unsupported
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::Fatal(_))
    }
}

/// Errors raised while reading or writing the persisted findings document
#[derive(Error, Debug)]
pub enum DocumentError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The document parsed but does not have the expected shape
    #[error("Malformed document: {0}")]
    Malformed(String),
}

/// Errors returned by the discovery core
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The requested plan name is not one of the known plans
    #[error("Invalid mode: {0}. Use 'full', 'quick', or 'persisted_only'")]
    InvalidPlan(String),

    /// A run is already active
    #[error("Discovery already running")]
    AlreadyRunning,

    /// Stop was requested while nothing runs
    #[error("No discovery running")]
    NotRunning,

    /// Reset was requested while a run is active
    #[error("Cannot reset while discovery is running")]
    ResetWhileRunning,

    /// No completed run has produced results yet
    #[error("No results available. Run discovery first.")]
    NotAvailable,

    /// The coordinator was shut down
    #[error("Discovery coordinator has been shut down")]
    ShutDown,

    /// The account exposes no devices
    #[error("No devices found in account")]
    NoDevices,

    /// The run was cancelled by a stop request
    #[error("Discovery cancelled")]
    Cancelled,

    /// Device API failure that could not be handled locally
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Persisted document failure
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    /// Publishing a state snapshot failed
    #[error("Publish error: {0}")]
    Publish(String),

    /// A device client or the run itself panicked
    #[error("Unexpected failure: {0}")]
    Panicked(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DiscoveryError {
    /// Whether this error is a caller-misuse rejection rather than a failure
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DiscoveryError::InvalidPlan(_)
                | DiscoveryError::AlreadyRunning
                | DiscoveryError::NotRunning
                | DiscoveryError::ResetWhileRunning
                | DiscoveryError::NotAvailable
                | DiscoveryError::ShutDown
        )
    }

    /// Wrap the payload of a caught panic
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_string(),
                Err(_) => "panic with non-string payload".to_string(),
            },
        };
        DiscoveryError::Panicked(message)
    }
}
