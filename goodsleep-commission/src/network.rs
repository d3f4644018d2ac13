//! Network selection
//!
//! Tracks which Wi-Fi network the sensor should join. The sensor radio only
//! supports 2.4 GHz, so 5 GHz-class networks never reach the scan list and a
//! 5 GHz current network is flagged instead of offered silently.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{CommissionError, NetworkError, Result};
use crate::wifi::{self, BandEvidence, FrequencyBand, NetworkService, WifiInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCandidate {
    pub name: String,
    pub band: FrequencyBand,
    pub evidence: BandEvidence,
    pub signal_strength: Option<i16>,
}

impl NetworkCandidate {
    fn classify(info: &WifiInfo, threshold_mhz: u32) -> Self {
        let (band, evidence) = wifi::classify(info, threshold_mhz);
        Self {
            name: info.ssid.clone(),
            band,
            evidence,
            signal_strength: info.rssi,
        }
    }
}

/// The network credentials will be sent for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChosenNetwork {
    pub candidate: NetworkCandidate,
    /// Set when the network is on a band the sensor cannot join
    pub band_unsupported: bool,
}

impl ChosenNetwork {
    fn new(candidate: NetworkCandidate) -> Self {
        let band_unsupported = candidate.band == FrequencyBand::FiveGhz;
        Self {
            candidate,
            band_unsupported,
        }
    }

    pub fn name(&self) -> &str {
        &self.candidate.name
    }
}

pub struct NetworkSelector<N: ?Sized> {
    network: Arc<N>,
    threshold_mhz: u32,
    last_scan: Vec<NetworkCandidate>,
    selected: Option<ChosenNetwork>,
}

impl<N: NetworkService + ?Sized> NetworkSelector<N> {
    pub fn new(network: Arc<N>, threshold_mhz: u32) -> Self {
        Self {
            network,
            threshold_mhz,
            last_scan: Vec::new(),
            selected: None,
        }
    }

    /// The network the host is on
    ///
    /// Fails with `NetworkDisabled` when Wi-Fi is off, `NotConnected` when it
    /// is on but not associated and `NetworkFailed` when the host could not be
    /// asked. A 5 GHz-class network is returned with
    /// `band_unsupported` set.
    pub async fn current_network(&self) -> Result<ChosenNetwork> {
        self.enable().await?;
        match self.network.current_network().await {
            Ok(Some(info)) if !info.ssid.is_empty() => {
                let chosen = ChosenNetwork::new(NetworkCandidate::classify(&info, self.threshold_mhz));
                if chosen.band_unsupported {
                    log::warn!("current network {:?} is 5 GHz-class", chosen.name());
                }
                Ok(chosen)
            }
            Ok(_) => Err(CommissionError::NotConnected),
            Err(NetworkError::Disabled) => Err(CommissionError::NetworkDisabled),
            Err(NetworkError::Transport(e)) => {
                log::warn!("reading current network failed: {e}");
                Err(CommissionError::NetworkFailed(e))
            }
        }
    }

    /// Scan for networks the sensor can join, strongest first
    pub async fn scan(&mut self) -> Result<Vec<NetworkCandidate>> {
        self.enable().await?;
        let raw = self.network.scan_networks().await.map_err(|e| match e {
            NetworkError::Disabled => CommissionError::NetworkDisabled,
            NetworkError::Transport(e) => CommissionError::NetworkFailed(e),
        })?;

        let candidates = supported_candidates(&raw, self.threshold_mhz);
        log::debug!("{} networks seen, {} usable", raw.len(), candidates.len());
        self.last_scan = candidates.clone();
        Ok(candidates)
    }

    pub fn last_scan(&self) -> &[NetworkCandidate] {
        &self.last_scan
    }

    /// Choose a network from the last scan
    pub fn select(&mut self, name: &str) -> Result<ChosenNetwork> {
        let candidate = self
            .last_scan
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| CommissionError::UnknownNetwork(name.to_string()))?;
        let chosen = ChosenNetwork::new(candidate);
        self.selected = Some(chosen.clone());
        Ok(chosen)
    }

    /// Choose a network that was not scanned (hidden, or typed by the user)
    ///
    /// Only the name is known, so the band comes from the name heuristic.
    pub fn select_manual(&mut self, name: &str) -> ChosenNetwork {
        let info = WifiInfo {
            ssid: name.to_string(),
            frequency_mhz: None,
            rssi: None,
        };
        let chosen = ChosenNetwork::new(NetworkCandidate::classify(&info, self.threshold_mhz));
        self.selected = Some(chosen.clone());
        chosen
    }

    /// Use the host's current network
    pub fn select_chosen(&mut self, chosen: ChosenNetwork) {
        self.selected = Some(chosen);
    }

    pub fn selected(&self) -> Option<&ChosenNetwork> {
        self.selected.as_ref()
    }

    /// Re-poll until Wi-Fi is switched on, or `cancel` becomes true
    pub async fn wait_until_enabled(
        &self,
        interval: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            match self.network.enable().await {
                Ok(()) => return Ok(()),
                Err(NetworkError::Disabled) => log::debug!("wifi still disabled"),
                Err(NetworkError::Transport(e)) => return Err(CommissionError::NetworkFailed(e)),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(CommissionError::NetworkDisabled);
                    }
                }
            }
        }
    }

    async fn enable(&self) -> Result<()> {
        self.network.enable().await.map_err(|e| match e {
            NetworkError::Disabled => CommissionError::NetworkDisabled,
            NetworkError::Transport(e) => CommissionError::NetworkFailed(e),
        })
    }
}

/// 2.4 GHz-class networks only, named, one per name, strongest first
fn supported_candidates(raw: &[WifiInfo], threshold_mhz: u32) -> Vec<NetworkCandidate> {
    let mut out: Vec<NetworkCandidate> = Vec::new();
    for info in raw {
        if info.ssid.trim().is_empty() {
            continue;
        }
        let candidate = NetworkCandidate::classify(info, threshold_mhz);
        if candidate.band != FrequencyBand::TwoPointFourGhz {
            continue;
        }
        match out.iter_mut().find(|c| c.name == candidate.name) {
            Some(existing) if existing.signal_strength < candidate.signal_strength => *existing = candidate,
            Some(_) => {}
            None => out.push(candidate),
        }
    }
    out.sort_by_key(|c| Reverse(c.signal_strength));
    out
}
