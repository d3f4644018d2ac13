//! In-memory capabilities for driving the engine in tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::channel::mpsc;
use goodsleep_commission::*;
use goodsleep_proto::Frame;

pub const SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
pub const WRITE: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
pub const NOTIFY: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
pub const DEVICE: &str = "7D1E0C4A-1F0B-4C7E-9A51-3F6E2B5C8D90";

pub fn status(code: u8) -> Vec<u8> {
    Frame::status_bytes(code)
}

pub fn goodsleep_advertisement(transport_id: &str, name: &str) -> Advertisement {
    Advertisement {
        transport_id: transport_id.to_string(),
        name: Some(name.to_string()),
        service_ids: vec![
            "0000abcd-0000-1000-8000-00805f9b34fb".to_string(),
            "00001234-0000-1000-8000-00805f9b34fb".to_string(),
            "0000ef01-0000-1000-8000-00805f9b34fb".to_string(),
        ],
        rssi: Some(-58),
    }
}

#[derive(Default)]
struct AdapterState {
    unavailable: bool,
    scanning: bool,
    scan_starts: u32,
    scan_stops: u32,
    advertisements: Vec<Advertisement>,
    connected: Option<String>,
    fail_connect: bool,
    fail_write: bool,
    fail_subscribe: bool,
    services: Vec<ServiceInfo>,
    channels: Vec<ChannelInfo>,
    writes: Vec<(String, Vec<u8>)>,
    subscribes: u32,
    unsubscribes: u32,
    disconnects: u32,
    subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
    replies: VecDeque<Vec<u8>>,
    native: Option<String>,
}

/// Bluetooth adapter with one scripted peripheral
#[derive(Default)]
pub struct FakeAdapter {
    state: Mutex<AdapterState>,
}

impl FakeAdapter {
    /// A sensor advertising as GOODSLEEP-AB12 with a UART-style service
    pub fn goodsleep() -> Self {
        let adapter = Self::default();
        {
            let mut s = adapter.state.lock().unwrap();
            s.advertisements = vec![
                goodsleep_advertisement(DEVICE, "GOODSLEEP-AB12"),
                Advertisement {
                    transport_id: "other".to_string(),
                    name: Some("Speaker".to_string()),
                    service_ids: Vec::new(),
                    rssi: Some(-40),
                },
            ];
            s.services = vec![
                ServiceInfo { id: "00001800-0000-1000-8000-00805f9b34fb".to_string(), is_primary: true },
                ServiceInfo { id: SERVICE.to_string(), is_primary: true },
            ];
            s.channels = vec![
                ChannelInfo {
                    id: WRITE.to_string(),
                    properties: ChannelProperties { write: true, ..Default::default() },
                },
                ChannelInfo {
                    id: NOTIFY.to_string(),
                    properties: ChannelProperties { notify: true, ..Default::default() },
                },
            ];
        }
        adapter
    }

    fn with<T>(&self, f: impl FnOnce(&mut AdapterState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_unavailable(&self) {
        self.with(|s| s.unavailable = true);
    }

    pub fn set_advertisements(&self, ads: Vec<Advertisement>) {
        self.with(|s| s.advertisements = ads);
    }

    pub fn set_channels(&self, channels: Vec<ChannelInfo>) {
        self.with(|s| s.channels = channels);
    }

    pub fn set_native_address(&self, address: &str) {
        self.with(|s| s.native = Some(address.to_string()));
    }

    pub fn fail_connect(&self) {
        self.with(|s| s.fail_connect = true);
    }

    pub fn fail_write(&self) {
        self.with(|s| s.fail_write = true);
    }

    pub fn fail_subscribe(&self) {
        self.with(|s| s.fail_subscribe = true);
    }

    /// Frames the sensor sends after the next credential write
    pub fn reply_with(&self, frames: Vec<Vec<u8>>) {
        self.with(|s| s.replies.extend(frames));
    }

    /// Deliver a notification to the current subscriber
    pub fn notify(&self, frame: Vec<u8>) {
        self.with(|s| {
            if let Some(tx) = &s.subscriber {
                let _ = tx.unbounded_send(frame);
            }
        });
    }

    /// End the notification stream, as a dropped link would
    pub fn drop_link(&self) {
        self.with(|s| {
            s.subscriber = None;
            s.connected = None;
        });
    }

    pub fn scan_starts(&self) -> u32 {
        self.with(|s| s.scan_starts)
    }

    pub fn scan_stops(&self) -> u32 {
        self.with(|s| s.scan_stops)
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.with(|s| s.writes.clone())
    }

    pub fn subscribes(&self) -> u32 {
        self.with(|s| s.subscribes)
    }

    pub fn unsubscribes(&self) -> u32 {
        self.with(|s| s.unsubscribes)
    }

    pub fn disconnects(&self) -> u32 {
        self.with(|s| s.disconnects)
    }

    pub fn has_subscriber(&self) -> bool {
        self.with(|s| s.subscriber.is_some())
    }
}

#[async_trait::async_trait]
impl AdapterService for FakeAdapter {
    async fn open_adapter(&self) -> Result<(), AdapterError> {
        self.with(|s| {
            if s.unavailable {
                Err(AdapterError::Unavailable("powered off".to_string()))
            } else {
                Ok(())
            }
        })
    }

    async fn start_scan(&self, _request: &ScanRequest) -> Result<(), AdapterError> {
        self.with(|s| {
            if s.scanning {
                return Err(AdapterError::ScanRejected("already scanning".to_string()));
            }
            s.scanning = true;
            s.scan_starts += 1;
            Ok(())
        })
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.with(|s| {
            s.scanning = false;
            s.scan_stops += 1;
        });
        Ok(())
    }

    async fn advertisements(&self) -> Result<Vec<Advertisement>, AdapterError> {
        Ok(self.with(|s| s.advertisements.clone()))
    }

    async fn connect(&self, transport_id: &str) -> Result<ConnectionHandle, AdapterError> {
        self.with(|s| {
            if s.fail_connect {
                return Err(AdapterError::Transport("connection refused".to_string()));
            }
            s.connected = Some(transport_id.to_string());
            Ok(ConnectionHandle {
                transport_id: transport_id.to_string(),
            })
        })
    }

    async fn list_services(&self, handle: &ConnectionHandle) -> Result<Vec<ServiceInfo>, AdapterError> {
        self.with(|s| match &s.connected {
            Some(id) if *id == handle.transport_id => Ok(s.services.clone()),
            _ => Err(AdapterError::NotConnected(handle.transport_id.clone())),
        })
    }

    async fn list_channels(
        &self,
        _handle: &ConnectionHandle,
        _service_id: &str,
    ) -> Result<Vec<ChannelInfo>, AdapterError> {
        Ok(self.with(|s| s.channels.clone()))
    }

    async fn write_channel(
        &self,
        _handle: &ConnectionHandle,
        _service_id: &str,
        channel_id: &str,
        bytes: &[u8],
    ) -> Result<(), AdapterError> {
        self.with(|s| {
            if s.fail_write {
                return Err(AdapterError::Transport("write not acknowledged".to_string()));
            }
            s.writes.push((channel_id.to_string(), bytes.to_vec()));
            if let Some(tx) = &s.subscriber {
                for frame in s.replies.drain(..) {
                    let _ = tx.unbounded_send(frame);
                }
            }
            Ok(())
        })
    }

    async fn subscribe_channel(
        &self,
        _handle: &ConnectionHandle,
        _service_id: &str,
        _channel_id: &str,
    ) -> Result<NotificationStream, AdapterError> {
        self.with(|s| {
            if s.fail_subscribe {
                return Err(AdapterError::Transport("cccd write failed".to_string()));
            }
            let (tx, rx) = mpsc::unbounded();
            s.subscriber = Some(tx);
            s.subscribes += 1;
            Ok(Box::pin(rx) as NotificationStream)
        })
    }

    async fn unsubscribe_channel(
        &self,
        _handle: &ConnectionHandle,
        _service_id: &str,
        _channel_id: &str,
    ) -> Result<(), AdapterError> {
        self.with(|s| {
            s.subscriber = None;
            s.unsubscribes += 1;
        });
        Ok(())
    }

    async fn disconnect(&self, _handle: &ConnectionHandle) -> Result<(), AdapterError> {
        self.with(|s| {
            s.connected = None;
            s.subscriber = None;
            s.disconnects += 1;
        });
        Ok(())
    }

    async fn native_address(&self, _transport_id: &str) -> Option<String> {
        self.with(|s| s.native.clone())
    }
}

#[derive(Default)]
struct NetworkState {
    enabled: bool,
    enable_after: u32,
    enable_calls: u32,
    current: Option<WifiInfo>,
    networks: Vec<WifiInfo>,
    broken: bool,
}

/// Host Wi-Fi with a fixed view of the air
#[derive(Default)]
pub struct FakeNetwork {
    state: Mutex<NetworkState>,
}

pub fn wifi(ssid: &str, frequency_mhz: Option<u32>, rssi: i16) -> WifiInfo {
    WifiInfo {
        ssid: ssid.to_string(),
        frequency_mhz,
        rssi: Some(rssi),
    }
}

impl FakeNetwork {
    /// Enabled, on HomeNet (2.4 GHz), with two usable networks and one 5 GHz one
    pub fn home() -> Self {
        let network = Self::default();
        {
            let mut s = network.state.lock().unwrap();
            s.enabled = true;
            s.current = Some(wifi("HomeNet", Some(2437), -45));
            s.networks = vec![
                wifi("HomeNet", Some(2437), -45),
                wifi("HomeNet-5G", Some(5180), -40),
                wifi("Neighbor", Some(2462), -70),
            ];
        }
        network
    }

    fn with<T>(&self, f: impl FnOnce(&mut NetworkState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn disable(&self) {
        self.with(|s| s.enabled = false);
    }

    /// Stay disabled for `calls` enable attempts, then come up
    pub fn enable_after(&self, calls: u32) {
        self.with(|s| {
            s.enabled = false;
            s.enable_after = calls;
        });
    }

    pub fn set_current(&self, current: Option<WifiInfo>) {
        self.with(|s| s.current = current);
    }

    /// Every lookup fails as if the host service was unreachable
    pub fn break_lookups(&self) {
        self.with(|s| s.broken = true);
    }

    pub fn enable_calls(&self) -> u32 {
        self.with(|s| s.enable_calls)
    }
}

#[async_trait::async_trait]
impl NetworkService for FakeNetwork {
    async fn enable(&self) -> Result<(), NetworkError> {
        self.with(|s| {
            s.enable_calls += 1;
            if !s.enabled && s.enable_after > 0 && s.enable_calls >= s.enable_after {
                s.enabled = true;
            }
            if s.enabled { Ok(()) } else { Err(NetworkError::Disabled) }
        })
    }

    async fn current_network(&self) -> Result<Option<WifiInfo>, NetworkError> {
        self.with(|s| match s.broken {
            true => Err(NetworkError::Transport("nmcli exited with 8".into())),
            false => Ok(s.current.clone()),
        })
    }

    async fn scan_networks(&self) -> Result<Vec<WifiInfo>, NetworkError> {
        Ok(self.with(|s| s.networks.clone()))
    }
}

#[derive(Default)]
struct EndpointState {
    script: VecDeque<u8>,
    default_status: Option<u8>,
    fail: bool,
    delay: Option<Duration>,
    queries: Vec<String>,
}

/// Device status service answering from a script
#[derive(Default)]
pub struct FakeEndpoint {
    state: Mutex<EndpointState>,
}

impl FakeEndpoint {
    /// Answers `status` whenever the script is empty
    pub fn answering(status: u8) -> Self {
        let endpoint = Self::default();
        endpoint.with(|s| s.default_status = Some(status));
        endpoint
    }

    fn with<T>(&self, f: impl FnOnce(&mut EndpointState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn script(&self, statuses: &[u8]) {
        self.with(|s| s.script.extend(statuses));
    }

    pub fn set_failing(&self, fail: bool) {
        self.with(|s| s.fail = fail);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.with(|s| s.delay = Some(delay));
    }

    pub fn queries(&self) -> Vec<String> {
        self.with(|s| s.queries.clone())
    }
}

#[async_trait::async_trait]
impl LivenessEndpoint for FakeEndpoint {
    async fn query(&self, address: &ResolvedAddress) -> Result<LivenessReport, LivenessError> {
        let (delay, answer) = self.with(|s| {
            s.queries.push(address.to_string());
            let answer = if s.fail {
                None
            } else {
                s.script.pop_front().or(s.default_status)
            };
            (s.delay, answer)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match answer {
            Some(status_id) => Ok(LivenessReport {
                status_id,
                last_update: 1_700_000_000,
            }),
            None => Err(LivenessError::Transport("connection refused".to_string())),
        }
    }
}
