//! Error taxonomy for commissioning
//!
//! Capability implementations report their own narrow errors; the engine
//! maps them onto [`CommissionError`], whose variants decide how a failure is
//! surfaced (user remedy, bounded retry, or soft record).

use std::time::Duration;

/// Failure reported by an [`crate::AdapterService`] implementation
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("bluetooth adapter unavailable: {0}")]
    Unavailable(String),
    #[error("scan request rejected: {0}")]
    ScanRejected(String),
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("device {0} not found")]
    UnknownDevice(String),
    #[error("bluetooth error: {0}")]
    Transport(String),
}

/// Failure reported by a [`crate::NetworkService`] implementation
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("wifi is disabled")]
    Disabled,
    #[error("wifi error: {0}")]
    Transport(String),
}

/// Failure reported by a [`crate::PersistenceService`] implementation
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("storage lock poisoned")]
    Poisoned,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure of a single liveness query, always recorded as an offline tick
#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("liveness query timed out after {0:?}")]
    Timeout(Duration),
    #[error("liveness endpoint error: {0}")]
    Transport(String),
    #[error("malformed liveness response: {0}")]
    Malformed(String),
}

/// Why a provisioning session was abandoned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// The caller stopped provisioning
    Manual,
    TransmitFailed,
    SubscribeFailed,
    /// The connection was torn down or the notification channel closed
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum CommissionError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("no devices matching {pattern:?} found after {attempts} attempts")]
    NoDevicesFound { pattern: String, attempts: u32 },
    #[error("failed to connect to {transport_id}: {reason}")]
    ConnectFailed { transport_id: String, reason: String },
    #[error("device {transport_id} lacks a usable {missing}")]
    CapabilityMissing {
        transport_id: String,
        missing: &'static str,
    },
    #[error("wifi is disabled")]
    NetworkDisabled,
    #[error("wifi is enabled but not connected to any network")]
    NotConnected,
    #[error("wifi query failed: {0}")]
    NetworkFailed(String),
    #[error("network {0:?} is not in the last scan")]
    UnknownNetwork(String),
    #[error("network {0:?} is on an unsupported band, switch to a 2.4 GHz network")]
    BandUnsupported(String),
    #[error("wifi password is empty")]
    EmptySecret,
    #[error("a provisioning session is already active on {0}")]
    SessionActive(String),
    #[error("the status channel of {0} is already subscribed")]
    AlreadySubscribed(String),
    #[error("failed to send credentials: {0}")]
    TransmitFailed(String),
    #[error("failed to subscribe to status notifications: {0}")]
    SubscribeFailed(String),
    #[error("no status received from the device for {0:?}")]
    SessionStalled(Duration),
    #[error("provisioning abandoned: {0:?}")]
    Abandoned(AbandonReason),
    #[error(transparent)]
    Encode(#[from] goodsleep_proto::EncodeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T, E = CommissionError> = std::result::Result<T, E>;
