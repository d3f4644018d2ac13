//! Desktop Bluetooth adapter on top of btleplug

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use btleplug::api::{Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::adapter::{
    AdapterService, Advertisement, ChannelInfo, ChannelProperties, ConnectionHandle, NotificationStream,
    ScanRequest, ServiceInfo,
};
use crate::error::AdapterError;

fn transport(e: btleplug::Error) -> AdapterError {
    AdapterError::Transport(e.to_string())
}

/// Hardware address when the platform exposes one (macOS does not)
fn hardware_address(peripheral: &Peripheral) -> Option<String> {
    let addr = peripheral.address();
    (addr.into_inner() != [0u8; 6]).then(|| addr.to_string())
}

/// Stable key for a peripheral within this process
fn transport_id(peripheral: &Peripheral) -> String {
    hardware_address(peripheral).unwrap_or_else(|| format!("{:?}", peripheral.id()))
}

fn parse_uuid(s: &str) -> Result<Uuid, AdapterError> {
    Uuid::parse_str(s).map_err(|e| AdapterError::Transport(format!("invalid identifier {s}: {e}")))
}

fn channel_properties(flags: CharPropFlags) -> ChannelProperties {
    ChannelProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

/// First adapter of the host Bluetooth manager
pub struct BtleplugAdapter {
    central: Mutex<Option<Adapter>>,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    scanning: AtomicBool,
}

impl Default for BtleplugAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BtleplugAdapter {
    pub fn new() -> Self {
        Self {
            central: Mutex::new(None),
            peripherals: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
        }
    }

    async fn central(&self) -> Result<Adapter, AdapterError> {
        let mut central = self.central.lock().await;
        if let Some(adapter) = central.as_ref() {
            return Ok(adapter.clone());
        }

        let manager = Manager::new()
            .await
            .map_err(|e| AdapterError::Unavailable(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| AdapterError::Unavailable(e.to_string()))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Unavailable("no Bluetooth adapter found".to_string()))?;
        *central = Some(adapter.clone());
        Ok(adapter)
    }

    async fn peripheral(&self, transport_id: &str) -> Result<Peripheral, AdapterError> {
        if let Some(p) = self.peripherals.lock().await.get(transport_id) {
            return Ok(p.clone());
        }

        // not seen in this process yet, ask the adapter
        let central = self.central().await?;
        for p in central.peripherals().await.map_err(transport)? {
            if transport_id == self::transport_id(&p) {
                self.peripherals.lock().await.insert(transport_id.to_string(), p.clone());
                return Ok(p);
            }
        }
        Err(AdapterError::UnknownDevice(transport_id.to_string()))
    }

    async fn connected(&self, handle: &ConnectionHandle) -> Result<Peripheral, AdapterError> {
        let p = self.peripheral(&handle.transport_id).await?;
        if !p.is_connected().await.map_err(transport)? {
            return Err(AdapterError::NotConnected(handle.transport_id.clone()));
        }
        Ok(p)
    }

    async fn characteristic(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
        channel_id: &str,
    ) -> Result<(Peripheral, Characteristic), AdapterError> {
        let service_uuid = parse_uuid(service_id)?;
        let channel_uuid = parse_uuid(channel_id)?;
        let p = self.connected(handle).await?;
        let c = p
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service_uuid && c.uuid == channel_uuid)
            .ok_or_else(|| AdapterError::Transport(format!("characteristic {channel_id} not found")))?;
        Ok((p, c))
    }
}

#[async_trait::async_trait]
impl AdapterService for BtleplugAdapter {
    async fn open_adapter(&self) -> Result<(), AdapterError> {
        let central = self.central().await?;
        match central.adapter_info().await {
            Ok(info) => log::debug!("using bluetooth adapter {info}"),
            Err(e) => return Err(AdapterError::Unavailable(e.to_string())),
        }
        Ok(())
    }

    async fn start_scan(&self, request: &ScanRequest) -> Result<(), AdapterError> {
        if self.scanning.swap(true, Ordering::AcqRel) {
            return Err(AdapterError::ScanRejected("a scan is already running".to_string()));
        }
        if request.allow_duplicates {
            log::debug!("duplicate reports are not configurable on this platform");
        }
        let central = self.central().await?;
        if let Err(e) = central.start_scan(ScanFilter::default()).await {
            self.scanning.store(false, Ordering::Release);
            return Err(AdapterError::ScanRejected(e.to_string()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        if !self.scanning.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let central = self.central().await?;
        central.stop_scan().await.map_err(transport)
    }

    async fn advertisements(&self) -> Result<Vec<Advertisement>, AdapterError> {
        let central = self.central().await?;
        let mut seen = Vec::new();
        let mut known = self.peripherals.lock().await;

        for p in central.peripherals().await.map_err(transport)? {
            let Some(props) = p.properties().await.map_err(transport)? else {
                continue;
            };
            let id = transport_id(&p);
            seen.push(Advertisement {
                transport_id: id.clone(),
                name: props.local_name,
                service_ids: props.services.iter().map(|u| u.to_string()).collect(),
                rssi: props.rssi,
            });
            known.insert(id, p);
        }
        Ok(seen)
    }

    async fn connect(&self, transport_id: &str) -> Result<ConnectionHandle, AdapterError> {
        let p = self.peripheral(transport_id).await?;
        if !p.is_connected().await.map_err(transport)? {
            p.connect().await.map_err(transport)?;
        }
        p.discover_services().await.map_err(transport)?;
        Ok(ConnectionHandle {
            transport_id: transport_id.to_string(),
        })
    }

    async fn list_services(&self, handle: &ConnectionHandle) -> Result<Vec<ServiceInfo>, AdapterError> {
        let p = self.connected(handle).await?;
        Ok(p.services()
            .into_iter()
            .map(|s| ServiceInfo {
                id: s.uuid.to_string(),
                is_primary: s.primary,
            })
            .collect())
    }

    async fn list_channels(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
    ) -> Result<Vec<ChannelInfo>, AdapterError> {
        let service_uuid = parse_uuid(service_id)?;
        let p = self.connected(handle).await?;
        let service = p
            .services()
            .into_iter()
            .find(|s| s.uuid == service_uuid)
            .ok_or_else(|| AdapterError::Transport(format!("service {service_id} not found")))?;
        Ok(service
            .characteristics
            .into_iter()
            .map(|c| ChannelInfo {
                id: c.uuid.to_string(),
                properties: channel_properties(c.properties),
            })
            .collect())
    }

    async fn write_channel(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
        channel_id: &str,
        bytes: &[u8],
    ) -> Result<(), AdapterError> {
        let (p, c) = self.characteristic(handle, service_id, channel_id).await?;
        let write_type = if c.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        p.write(&c, bytes, write_type).await.map_err(transport)
    }

    async fn subscribe_channel(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
        channel_id: &str,
    ) -> Result<NotificationStream, AdapterError> {
        let (p, c) = self.characteristic(handle, service_id, channel_id).await?;
        // take the stream first so no early notification is missed
        let notifications = p.notifications().await.map_err(transport)?;
        p.subscribe(&c).await.map_err(transport)?;

        let uuid = c.uuid;
        let values = notifications.filter_map(move |n| async move { (n.uuid == uuid).then_some(n.value) });
        Ok(Box::pin(values))
    }

    async fn unsubscribe_channel(
        &self,
        handle: &ConnectionHandle,
        service_id: &str,
        channel_id: &str,
    ) -> Result<(), AdapterError> {
        let (p, c) = self.characteristic(handle, service_id, channel_id).await?;
        p.unsubscribe(&c).await.map_err(transport)
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<(), AdapterError> {
        let p = self.peripheral(&handle.transport_id).await?;
        p.disconnect().await.map_err(transport)
    }

    async fn native_address(&self, transport_id: &str) -> Option<String> {
        let p = self.peripheral(transport_id).await.ok()?;
        hardware_address(&p)
    }
}
