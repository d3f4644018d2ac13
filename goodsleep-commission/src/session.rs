//! Commissioning context
//!
//! Holds the capabilities and configuration one caller works with and builds
//! the individual components on demand. Nothing here is global: two
//! contexts with different capabilities never share state.

use std::sync::Arc;

use crate::adapter::AdapterService;
use crate::config::CommissionConfig;
use crate::discovery::{DiscoveryScanner, ScanHandle, ScanOptions};
use crate::error::Result;
use crate::identity::ResolvedAddress;
use crate::liveness::{LivenessEndpoint, LivenessMonitor, LivenessState};
use crate::negotiate::{CapabilityNegotiator, PairedDevice};
use crate::network::{ChosenNetwork, NetworkSelector};
use crate::provision::{CredentialProvisioner, ProvisioningSession};
use crate::status::StatusMonitor;
use crate::storage::{PairedIdentity, PersistenceService};
use crate::wifi::NetworkService;

/// Result of a successful commissioning run
///
/// Keeps the status subscription open and the liveness monitor running
/// until dropped or stopped.
pub struct Commissioned<A: ?Sized, E: ?Sized> {
    pub session: ProvisioningSession,
    pub monitor: StatusMonitor<A>,
    pub liveness: LivenessMonitor<E>,
    pub liveness_address: ResolvedAddress,
}

pub struct Commissioner<A, N: ?Sized, E: ?Sized, P: ?Sized> {
    adapter: Arc<A>,
    network: Arc<N>,
    endpoint: Arc<E>,
    store: Arc<P>,
    config: CommissionConfig,
}

impl<A, N, E, P> Commissioner<A, N, E, P>
where
    A: AdapterService + 'static,
    N: NetworkService + ?Sized,
    E: LivenessEndpoint + ?Sized + 'static,
    P: PersistenceService + ?Sized,
{
    pub fn new(adapter: Arc<A>, network: Arc<N>, endpoint: Arc<E>, store: Arc<P>, config: CommissionConfig) -> Self {
        Self {
            adapter,
            network,
            endpoint,
            store,
            config,
        }
    }

    pub fn config(&self) -> &CommissionConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn scanner(&self) -> DiscoveryScanner<A> {
        DiscoveryScanner::new(self.adapter.clone(), &self.config)
    }

    pub fn negotiator(&self) -> CapabilityNegotiator<A, P> {
        CapabilityNegotiator::new(self.adapter.clone(), self.store.clone())
    }

    pub fn network_selector(&self) -> NetworkSelector<N> {
        NetworkSelector::new(self.network.clone(), self.config.five_ghz_threshold_mhz)
    }

    pub fn provisioner(&self) -> CredentialProvisioner<A> {
        CredentialProvisioner::new(self.adapter.clone(), &self.config.product_tag)
    }

    pub fn status_monitor(&self) -> StatusMonitor<A> {
        StatusMonitor::new(self.adapter.clone(), self.config.status_timeout)
    }

    pub fn liveness_monitor(&self) -> LivenessMonitor<E> {
        LivenessMonitor::new(self.endpoint.clone(), self.config.liveness_call_timeout)
    }

    /// Device paired in an earlier session, if any
    pub fn remembered_device(&self) -> Result<Option<PairedIdentity>> {
        Ok(self.store.load_paired()?)
    }

    /// Scan with the configured pattern, standing in the remembered device
    pub async fn scan(&self) -> Result<ScanHandle> {
        let options = ScanOptions::new(&self.config.name_pattern).with_remembered(self.remembered_device()?);
        self.scanner().start_scan(options).await
    }

    /// Connect to the remembered device without scanning
    pub async fn reconnect(&self) -> Result<Option<PairedDevice>> {
        let Some(remembered) = self.remembered_device()? else {
            return Ok(None);
        };
        log::info!("reconnecting to remembered device {}", remembered.transport_id);
        self.negotiator().reconnect(&remembered).await.map(Some)
    }

    /// Tear down the link (if any) and forget the paired device
    pub async fn unpair(&self, paired: Option<&PairedDevice>) -> Result<()> {
        if let Some(paired) = paired {
            if let Err(e) = paired.teardown(self.adapter.as_ref()).await {
                log::warn!("teardown during unpair: {e}");
            }
        }
        self.store.clear()?;
        log::info!("paired device forgotten");
        Ok(())
    }

    /// Address the status service knows the sensor by
    ///
    /// The Wi-Fi address when it can be derived or was stored for this same
    /// device, else the radio address.
    pub fn liveness_address(&self, paired: &PairedDevice) -> ResolvedAddress {
        if let Some(address) = paired.network_address() {
            return address;
        }
        let same_device = matches!(
            self.store.load_paired(),
            Ok(Some(known)) if known.transport_id == paired.transport_id()
        );
        if !same_device {
            return paired.resolved_address().clone();
        }
        match self.store.load_network_address() {
            Ok(Some(address)) => address,
            Ok(None) => paired.resolved_address().clone(),
            Err(e) => {
                log::warn!("reading stored network address: {e}");
                paired.resolved_address().clone()
            }
        }
    }

    /// Provision `network` onto `paired` and wait for the outcome
    ///
    /// Subscribes before writing so no status frame is missed. On success the
    /// liveness monitor is already running. `monitor` comes from
    /// [`Commissioner::status_monitor`], so the caller can keep its abandon
    /// handle or event channel.
    pub async fn commission(
        &self,
        paired: &PairedDevice,
        network: &ChosenNetwork,
        secret: &str,
        mut monitor: StatusMonitor<A>,
    ) -> Result<Commissioned<A, E>> {
        let provisioner = self.provisioner();
        let mut session = provisioner.begin(paired, network, secret)?;

        let outcome = async {
            monitor.subscribe(&mut session).await?;
            provisioner.transmit(&mut session).await?;
            monitor.run(&mut session).await
        }
        .await;
        if let Err(e) = outcome {
            monitor.close().await;
            return Err(e);
        }

        let liveness_address = self.liveness_address(paired);
        let mut liveness = self.liveness_monitor();
        let mut last = LivenessState::Unknown;
        liveness
            .start(liveness_address.clone(), self.config.liveness_interval, move |record| {
                if record.current_state != last {
                    log::info!("{} is {:?}", record.resolved_address, record.current_state);
                    last = record.current_state;
                }
            })
            .await;

        Ok(Commissioned {
            session,
            monitor,
            liveness,
            liveness_address,
        })
    }
}
