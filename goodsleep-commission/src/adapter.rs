//! Bluetooth adapter capability
//!
//! The engine never talks to a BLE stack directly. Platform crates implement
//! [`AdapterService`]; [`crate::ble::BtleplugAdapter`] is the desktop one.

use std::pin::Pin;

use futures::Stream;

use crate::error::AdapterError;

/// One advertisement as last seen by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform identifier of the peripheral, not stable across platforms
    pub transport_id: String,
    pub name: Option<String>,
    pub service_ids: Vec<String>,
    pub rssi: Option<i16>,
}

/// Opaque handle of an open transport connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub properties: ChannelProperties,
}

/// Raw notification values of one subscribed channel
///
/// The stream ends when the subscription or the connection goes away.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Scan options passed to the adapter
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Report each device once per scan instead of on every advertisement
    pub allow_duplicates: bool,
}

/// Bluetooth operations the commissioning engine consumes
///
/// Implementations must reject overlapping scans with
/// [`AdapterError::ScanRejected`]; the scanner always stops before starting.
#[async_trait::async_trait]
pub trait AdapterService: Send + Sync {
    /// Make sure the adapter is powered and usable
    async fn open_adapter(&self) -> Result<(), AdapterError>;

    async fn start_scan(&self, request: &ScanRequest) -> Result<(), AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    /// Everything the adapter has seen since the scan started
    async fn advertisements(&self) -> Result<Vec<Advertisement>, AdapterError>;

    async fn connect(&self, transport_id: &str) -> Result<ConnectionHandle, AdapterError>;

    async fn list_services(&self, handle: &ConnectionHandle) -> Result<Vec<ServiceInfo>, AdapterError>;

    async fn list_channels(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
    ) -> Result<Vec<ChannelInfo>, AdapterError>;

    async fn write_channel(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
        channel_id: &str,
        bytes: &[u8],
    ) -> Result<(), AdapterError>;

    async fn subscribe_channel(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
        channel_id: &str,
    ) -> Result<NotificationStream, AdapterError>;

    async fn unsubscribe_channel(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
        channel_id: &str,
    ) -> Result<(), AdapterError>;

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), AdapterError>;

    /// Hardware address of the peripheral, when the platform exposes one
    async fn native_address(&self, _transport_id: &str) -> Option<String> {
        None
    }
}
