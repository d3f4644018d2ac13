//! Wi-Fi capability and band classification
//!
//! The sensor radio only does 2.4 GHz. Platforms report the band in
//! different ways: some give a frequency, some only the network name.

use crate::error::NetworkError;

/// Frequency at and above which a network is treated as 5 GHz-class
pub const DEFAULT_FIVE_GHZ_THRESHOLD_MHZ: u32 = 4900;

/// Name fragments that mark a network as 5 GHz-class when no frequency is known
///
/// Covers the usual `-5G`, `_5G`, `5GHZ`, `5G-WIFI` suffixes.
const FIVE_GHZ_NAME_MARKERS: &[&str] = &["5G", "5GHZ", "FIVE_G", "FIVE-G"];

/// A network as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiInfo {
    pub ssid: String,
    pub frequency_mhz: Option<u32>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrequencyBand {
    TwoPointFourGhz,
    FiveGhz,
}

/// What the band classification was based on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandEvidence {
    Frequency(u32),
    NameHeuristic,
}

/// Wi-Fi operations the commissioning engine consumes
#[async_trait::async_trait]
pub trait NetworkService: Send + Sync {
    /// Start the Wi-Fi subsystem; fails with [`NetworkError::Disabled`] when switched off
    async fn enable(&self) -> Result<(), NetworkError>;

    /// The network the host is associated with, if any
    async fn current_network(&self) -> Result<Option<WifiInfo>, NetworkError>;

    /// Scan and return the visible networks
    async fn scan_networks(&self) -> Result<Vec<WifiInfo>, NetworkError>;
}

/// Name-only guess, used where the platform hides the frequency
pub fn is_five_ghz_name(ssid: &str) -> bool {
    let upper = ssid.to_uppercase();
    FIVE_GHZ_NAME_MARKERS.iter().any(|m| upper.contains(m))
}

/// Classify a network, trusting the frequency over the name
pub fn classify(info: &WifiInfo, threshold_mhz: u32) -> (FrequencyBand, BandEvidence) {
    match info.frequency_mhz {
        Some(freq) if freq > 0 => {
            let band = if freq >= threshold_mhz {
                FrequencyBand::FiveGhz
            } else {
                FrequencyBand::TwoPointFourGhz
            };
            (band, BandEvidence::Frequency(freq))
        }
        _ => {
            let band = if is_five_ghz_name(&info.ssid) {
                FrequencyBand::FiveGhz
            } else {
                FrequencyBand::TwoPointFourGhz
            };
            (band, BandEvidence::NameHeuristic)
        }
    }
}
