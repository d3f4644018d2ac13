//! Credential provisioning
//!
//! Builds the provisioning session for one paired device and writes the
//! Wi-Fi credentials to its command channel. Whether the sensor actually
//! joined the network is only learned from status frames.

use std::sync::Arc;

use goodsleep_proto::{ProvisionCommand, StatusCode};

use crate::adapter::AdapterService;
use crate::error::{AbandonReason, CommissionError, Result};
use crate::negotiate::PairedDevice;
use crate::network::ChosenNetwork;

/// Where the session is in its own lifecycle
///
/// Link outcomes the sensor reports (connected, failed, disconnected, off
/// bed) are not phases. They are kept as an [`Observation`] next to the
/// phase, see [`ProvisioningSession::last_observation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingSubscription,
    AwaitingStatus,
    Succeeded,
    Abandoned(AbandonReason),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Abandoned(_))
    }
}

/// Last link state the sensor reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Connected,
    Failed,
    Disconnected,
    OffBed,
}

impl Observation {
    pub fn from_status(code: StatusCode) -> Option<Self> {
        match code {
            StatusCode::LinkUp | StatusCode::SessionUp => Some(Observation::Connected),
            StatusCode::LinkFailed => Some(Observation::Failed),
            StatusCode::SessionDropped | StatusCode::LinkDropped => Some(Observation::Disconnected),
            StatusCode::OffBed => Some(Observation::OffBed),
            StatusCode::Unknown(_) => None,
        }
    }
}

/// Holds the device's single session slot until dropped
#[derive(Debug)]
struct SessionGuard(PairedDevice);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.release_session();
    }
}

/// One attempt at putting a sensor on a network
///
/// At most one non-terminal session exists per paired device. The slot is
/// freed when the session reaches a terminal phase or is dropped.
pub struct ProvisioningSession {
    paired: PairedDevice,
    network: ChosenNetwork,
    command: ProvisionCommand,
    phase: Phase,
    last_status: Option<StatusCode>,
    last_observation: Option<Observation>,
    retry_count: u32,
    guard: Option<SessionGuard>,
}

impl std::fmt::Debug for ProvisioningSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningSession")
            .field("device", &self.paired.transport_id())
            .field("network", &self.network.name())
            .field("phase", &self.phase)
            .field("last_status", &self.last_status)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

impl ProvisioningSession {
    pub fn paired(&self) -> &PairedDevice {
        &self.paired
    }

    pub fn network(&self) -> &ChosenNetwork {
        &self.network
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn last_status(&self) -> Option<StatusCode> {
        self.last_status
    }

    pub fn last_observation(&self) -> Option<Observation> {
        self.last_observation
    }

    /// Number of link failures the sensor reported and retried on its own
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        log::info!("{}: {:?} -> {:?}", self.paired.transport_id(), self.phase, phase);
        self.phase = phase;
        if self.phase.is_terminal() {
            self.guard = None;
        }
    }

    pub(crate) fn record_status(&mut self, code: StatusCode) {
        self.last_status = Some(code);
        if let Some(observation) = Observation::from_status(code) {
            self.last_observation = Some(observation);
        }
        if code == StatusCode::LinkFailed {
            self.retry_count += 1;
        }
    }
}

pub struct CredentialProvisioner<A: ?Sized> {
    adapter: Arc<A>,
    product_tag: String,
}

impl<A: AdapterService + ?Sized> CredentialProvisioner<A> {
    pub fn new(adapter: Arc<A>, product_tag: &str) -> Self {
        Self {
            adapter,
            product_tag: product_tag.to_string(),
        }
    }

    /// Open a session without writing anything
    ///
    /// All precondition checks happen here, before the device sees a byte.
    pub fn begin(&self, paired: &PairedDevice, network: &ChosenNetwork, secret: &str) -> Result<ProvisioningSession> {
        if network.band_unsupported {
            return Err(CommissionError::BandUnsupported(network.name().to_string()));
        }
        if secret.is_empty() {
            return Err(CommissionError::EmptySecret);
        }
        if paired.is_closed() {
            return Err(CommissionError::Abandoned(AbandonReason::Disconnected));
        }

        let command = ProvisionCommand::with_tag(&self.product_tag, network.name(), secret);
        command.to_bytes()?;

        if !paired.claim_session() {
            return Err(CommissionError::SessionActive(paired.transport_id().to_string()));
        }

        Ok(ProvisioningSession {
            paired: paired.clone(),
            network: network.clone(),
            command,
            phase: Phase::Idle,
            last_status: None,
            last_observation: None,
            retry_count: 0,
            guard: Some(SessionGuard(paired.clone())),
        })
    }

    /// Write the credentials in a single call
    ///
    /// A write error abandons the session. A session already waiting for
    /// status may be sent again by the caller.
    pub async fn transmit(&self, session: &mut ProvisioningSession) -> Result<()> {
        match &session.phase {
            Phase::Succeeded => return Ok(()),
            Phase::Abandoned(reason) => return Err(CommissionError::Abandoned(reason.clone())),
            _ => {}
        }

        let bytes = session.command.to_bytes()?;
        let cap = session.paired.capability();
        log::info!(
            "sending to {}: {}",
            session.paired.transport_id(),
            session.command.to_masked_text()
        );

        if let Err(e) = self
            .adapter
            .write_channel(session.paired.handle(), &cap.service_id, &cap.command_channel_id, &bytes)
            .await
        {
            log::error!("credential write to {} failed: {e}", session.paired.transport_id());
            session.set_phase(Phase::Abandoned(AbandonReason::TransmitFailed));
            return Err(CommissionError::TransmitFailed(e.to_string()));
        }

        session.set_phase(Phase::AwaitingStatus);
        Ok(())
    }

    /// Begin and transmit in one step
    pub async fn provision(
        &self,
        paired: &PairedDevice,
        network: &ChosenNetwork,
        secret: &str,
    ) -> Result<ProvisioningSession> {
        let mut session = self.begin(paired, network, secret)?;
        self.transmit(&mut session).await?;
        Ok(session)
    }
}
