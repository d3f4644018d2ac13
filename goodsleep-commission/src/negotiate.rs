//! Capability negotiation
//!
//! Connects to a chosen sensor and resolves the command and status channels
//! the rest of commissioning talks through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use goodsleep_proto::ble::{NOTIFY_PREFIXES, SERVICE_PREFIX, WRITE_PREFIXES, matches_prefix};
use tokio::sync::watch;

use crate::adapter::{AdapterService, ChannelInfo, ConnectionHandle, ServiceInfo};
use crate::discovery::DiscoveredDevice;
use crate::error::{CommissionError, Result};
use crate::identity::{self, ResolvedAddress};
use crate::storage::{PairedIdentity, PersistenceService};

/// Channels resolved on a connected sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub service_id: String,
    pub command_channel_id: String,
    pub notify_channel_id: String,
}

/// Transport link shared by everything working on one paired device
#[derive(Debug)]
struct Link {
    handle: ConnectionHandle,
    closed: watch::Sender<bool>,
    subscribed: AtomicBool,
    session_active: AtomicBool,
}

/// A connected sensor with a complete capability
///
/// Cloning shares the link. Nobody closes it except through
/// [`PairedDevice::teardown`], which every clone observes.
#[derive(Debug, Clone)]
pub struct PairedDevice {
    transport_id: String,
    name: Option<String>,
    resolved_address: ResolvedAddress,
    capability: Capability,
    link: Arc<Link>,
}

impl PairedDevice {
    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn resolved_address(&self) -> &ResolvedAddress {
        &self.resolved_address
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.link.handle
    }

    /// Address the sensor uses once it is on Wi-Fi
    pub fn network_address(&self) -> Option<ResolvedAddress> {
        self.resolved_address.network_address()
    }

    pub fn identity(&self) -> PairedIdentity {
        PairedIdentity::new(&self.transport_id, self.resolved_address.clone(), self.name.clone())
    }

    pub fn is_closed(&self) -> bool {
        *self.link.closed.borrow()
    }

    /// Resolves to true once the link is torn down
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.link.closed.subscribe()
    }

    /// Mark the link closed without touching the transport
    pub(crate) fn mark_closed(&self) {
        self.link.closed.send_replace(true);
    }

    pub(crate) fn claim_subscription(&self) -> bool {
        self.link
            .subscribed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_subscription(&self) {
        self.link.subscribed.store(false, Ordering::Release);
    }

    pub fn is_subscribed(&self) -> bool {
        self.link.subscribed.load(Ordering::Acquire)
    }

    pub(crate) fn claim_session(&self) -> bool {
        self.link
            .session_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_session(&self) {
        self.link.session_active.store(false, Ordering::Release);
    }

    pub fn has_active_session(&self) -> bool {
        self.link.session_active.load(Ordering::Acquire)
    }

    /// Close the link for every holder
    ///
    /// Drops the status subscription and disconnects. Safe to call more than
    /// once; only the first call reaches the adapter.
    pub async fn teardown<A: AdapterService + ?Sized>(&self, adapter: &A) -> Result<()> {
        if self.link.closed.send_replace(true) {
            return Ok(());
        }
        log::info!("tearing down link to {}", self.transport_id);

        if self.link.subscribed.swap(false, Ordering::AcqRel) {
            let cap = &self.capability;
            if let Err(e) = adapter
                .unsubscribe_channel(self.handle(), &cap.service_id, &cap.notify_channel_id)
                .await
            {
                log::debug!("unsubscribe during teardown: {e}");
            }
        }

        adapter
            .disconnect(self.handle())
            .await
            .map_err(|e| CommissionError::ConnectFailed {
                transport_id: self.transport_id.clone(),
                reason: e.to_string(),
            })
    }
}

/// Opens connections and resolves capabilities
pub struct CapabilityNegotiator<A, P: ?Sized> {
    adapter: Arc<A>,
    store: Arc<P>,
}

impl<A, P> CapabilityNegotiator<A, P>
where
    A: AdapterService,
    P: PersistenceService + ?Sized,
{
    pub fn new(adapter: Arc<A>, store: Arc<P>) -> Self {
        Self { adapter, store }
    }

    /// Connect by transport id
    pub async fn connect(&self, transport_id: &str, advertised_service_ids: &[String]) -> Result<PairedDevice> {
        self.negotiate(transport_id, advertised_service_ids, None, None).await
    }

    /// Connect to a scan candidate
    pub async fn connect_device(&self, device: &DiscoveredDevice) -> Result<PairedDevice> {
        let prior = device.synthesized.then_some(&device.resolved_address);
        let name = (!device.synthesized).then(|| device.advertised_name.clone());
        self.negotiate(&device.transport_id, &device.advertised_service_ids, name, prior)
            .await
    }

    /// Connect straight to a device remembered from an earlier session
    pub async fn reconnect(&self, remembered: &PairedIdentity) -> Result<PairedDevice> {
        self.negotiate(
            &remembered.transport_id,
            &[],
            remembered.name.clone(),
            Some(&remembered.resolved_address),
        )
        .await
    }

    /// Check the link still answers
    pub async fn probe(&self, paired: &PairedDevice) -> bool {
        if paired.is_closed() {
            return false;
        }
        match self.adapter.list_services(paired.handle()).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("probe of {} failed: {e}", paired.transport_id());
                false
            }
        }
    }

    async fn negotiate(
        &self,
        transport_id: &str,
        service_ids: &[String],
        name: Option<String>,
        prior: Option<&ResolvedAddress>,
    ) -> Result<PairedDevice> {
        let connect_failed = |reason: String| CommissionError::ConnectFailed {
            transport_id: transport_id.to_string(),
            reason,
        };

        log::info!("connecting to {transport_id}");
        let handle = self
            .adapter
            .connect(transport_id)
            .await
            .map_err(|e| connect_failed(e.to_string()))?;

        let capability = match self.resolve_capability(&handle).await {
            Ok(capability) => capability,
            Err(e) => {
                if let Err(de) = self.adapter.disconnect(&handle).await {
                    log::debug!("disconnect after failed negotiation: {de}");
                }
                return Err(e);
            }
        };
        log::debug!("{transport_id}: {capability:?}");

        let native = self.adapter.native_address(transport_id).await;
        let mut resolved = identity::resolve_with_native(native.as_deref(), transport_id, service_ids);
        if resolved.is_degraded() {
            if let Some(prior) = prior {
                resolved = prior.clone();
            }
        }

        let (closed, _) = watch::channel(false);
        let paired = PairedDevice {
            transport_id: transport_id.to_string(),
            name,
            resolved_address: resolved,
            capability,
            link: Arc::new(Link {
                handle,
                closed,
                subscribed: AtomicBool::new(false),
                session_active: AtomicBool::new(false),
            }),
        };
        self.remember(&paired);
        log::info!(
            "paired with {} at {} ({:?})",
            transport_id,
            paired.resolved_address(),
            paired.resolved_address().source()
        );
        Ok(paired)
    }

    async fn resolve_capability(&self, handle: &ConnectionHandle) -> Result<Capability> {
        let transport_id = &handle.transport_id;
        let services = self
            .adapter
            .list_services(handle)
            .await
            .map_err(|e| CommissionError::ConnectFailed {
                transport_id: transport_id.clone(),
                reason: e.to_string(),
            })?;

        let service = select_service(&services).ok_or_else(|| CommissionError::CapabilityMissing {
            transport_id: transport_id.clone(),
            missing: "provisioning service",
        })?;

        let channels = self
            .adapter
            .list_channels(handle, &service.id)
            .await
            .map_err(|e| CommissionError::ConnectFailed {
                transport_id: transport_id.clone(),
                reason: e.to_string(),
            })?;

        let (command, notify) = classify_channels(&channels);
        let command = command.ok_or_else(|| CommissionError::CapabilityMissing {
            transport_id: transport_id.clone(),
            missing: "command channel",
        })?;
        let notify = notify.ok_or_else(|| CommissionError::CapabilityMissing {
            transport_id: transport_id.clone(),
            missing: "notify channel",
        })?;

        Ok(Capability {
            service_id: service.id.clone(),
            command_channel_id: command.id.clone(),
            notify_channel_id: notify.id.clone(),
        })
    }

    /// Persist identity and network address; failure is logged, not fatal
    fn remember(&self, paired: &PairedDevice) {
        if let Err(e) = self.store.save_paired(&paired.identity()) {
            log::warn!("could not remember paired device: {e}");
        }
        // an earlier device's address must not outlive its pairing
        let saved = match paired.network_address() {
            Some(network) => self.store.save_network_address(&network),
            None => self.store.forget_network_address(),
        };
        if let Err(e) = saved {
            log::warn!("could not remember network address: {e}");
        }
    }
}

/// First service carrying the provisioning prefix, else the first primary one
fn select_service(services: &[ServiceInfo]) -> Option<&ServiceInfo> {
    services
        .iter()
        .find(|s| matches_prefix(&s.id, &[SERVICE_PREFIX]))
        .or_else(|| services.iter().find(|s| s.is_primary))
}

/// Pick command and notify channels
///
/// A channel whose id carries a known prefix wins over one that only has the
/// right property.
fn classify_channels(channels: &[ChannelInfo]) -> (Option<&ChannelInfo>, Option<&ChannelInfo>) {
    let command = channels
        .iter()
        .find(|c| matches_prefix(&c.id, WRITE_PREFIXES))
        .or_else(|| {
            channels
                .iter()
                .find(|c| c.properties.write || c.properties.write_without_response)
        });
    let notify = channels
        .iter()
        .find(|c| matches_prefix(&c.id, NOTIFY_PREFIXES))
        .or_else(|| channels.iter().find(|c| c.properties.notify || c.properties.indicate));
    (command, notify)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ChannelProperties;

    fn channel(id: &str, write: bool, notify: bool) -> ChannelInfo {
        ChannelInfo {
            id: id.to_string(),
            properties: ChannelProperties {
                write,
                notify,
                ..Default::default()
            },
        }
    }

    #[test]
    fn service_prefix_beats_primary() {
        let services = vec![
            ServiceInfo { id: "00001800-0000-1000-8000-00805f9b34fb".into(), is_primary: true },
            ServiceInfo { id: "6e400001-b5a3-f393-e0a9-e50e24dcca9e".into(), is_primary: false },
        ];
        assert_eq!(select_service(&services).unwrap().id, services[1].id);
        assert_eq!(select_service(&services[..1]).unwrap().id, services[0].id);
        assert!(select_service(&[]).is_none());
    }

    #[test]
    fn prefix_beats_property() {
        let channels = vec![
            channel("00002a00-generic", true, true),
            channel("6e400002-b5a3", false, false),
            channel("6e400003-b5a3", false, false),
        ];
        let (command, notify) = classify_channels(&channels);
        assert_eq!(command.unwrap().id, "6e400002-b5a3");
        assert_eq!(notify.unwrap().id, "6e400003-b5a3");
    }

    #[test]
    fn second_firmware_family_is_recognized() {
        let channels = vec![channel("0000c304-0000-1000", false, false), channel("0000c305-0000-1000", false, false)];
        let (command, notify) = classify_channels(&channels);
        assert_eq!(command.unwrap().id, "0000c304-0000-1000");
        assert_eq!(notify.unwrap().id, "0000c305-0000-1000");
    }

    #[test]
    fn properties_alone_suffice() {
        let channels = vec![channel("aaaa", true, false), channel("bbbb", false, true)];
        let (command, notify) = classify_channels(&channels);
        assert_eq!(command.unwrap().id, "aaaa");
        assert_eq!(notify.unwrap().id, "bbbb");

        let (command, notify) = classify_channels(&channels[..1]);
        assert!(command.is_some());
        assert!(notify.is_none());
    }
}
