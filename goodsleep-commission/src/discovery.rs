//! Discovery scanner
//!
//! Runs bounded scan sessions and merges advertisements into a cumulative,
//! deduplicated candidate list that is published on every tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::adapter::{AdapterService, Advertisement, ScanRequest};
use crate::config::{CommissionConfig, MIN_PERIOD};
use crate::error::{AdapterError, CommissionError, Result};
use crate::identity::{self, ResolvedAddress};
use crate::storage::PairedIdentity;

/// A candidate device seen during the current scan session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub transport_id: String,
    pub advertised_name: String,
    pub advertised_service_ids: Vec<String>,
    pub signal_strength: Option<i16>,
    pub resolved_address: ResolvedAddress,
    /// Not actually advertised; stands in for the remembered device
    pub synthesized: bool,
}

impl DiscoveredDevice {
    fn from_advertisement(ad: &Advertisement, name: &str) -> Self {
        Self {
            transport_id: ad.transport_id.clone(),
            advertised_name: name.to_string(),
            advertised_service_ids: ad.service_ids.clone(),
            signal_strength: ad.rssi,
            resolved_address: identity::resolve(&ad.transport_id, &ad.service_ids),
            synthesized: false,
        }
    }

    fn stand_in(known: &PairedIdentity, pattern: &str) -> Self {
        Self {
            transport_id: known.transport_id.clone(),
            advertised_name: format!("{pattern} (paired)"),
            advertised_service_ids: Vec::new(),
            signal_strength: None,
            resolved_address: known.resolved_address.clone(),
            synthesized: true,
        }
    }

    pub fn display_label(&self) -> String {
        self.resolved_address.display_label()
    }
}

/// Cumulative result of one scan session
#[derive(Debug, Clone)]
pub struct ScanSet {
    pattern: String,
    devices: Vec<DiscoveredDevice>,
}

impl ScanSet {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            devices: Vec::new(),
        }
    }

    /// Fold advertisements in, keeping first-seen order
    ///
    /// An advertisement for a known transport id replaces the earlier entry in
    /// place. Advertisements whose name does not contain the pattern are
    /// ignored.
    pub fn merge(&mut self, advertisements: &[Advertisement]) {
        for ad in advertisements {
            let Some(name) = ad.name.as_deref() else { continue };
            if !name.contains(&self.pattern) {
                continue;
            }
            let device = DiscoveredDevice::from_advertisement(ad, name);
            match self.devices.iter_mut().find(|d| d.transport_id == ad.transport_id) {
                Some(existing) => *existing = device,
                None => self.devices.push(device),
            }
        }
    }

    /// Whether any real advertisement matched
    pub fn found(&self) -> bool {
        !self.devices.is_empty()
    }

    /// Current list, with the remembered device in front when it was not seen
    pub fn snapshot(&self, known: Option<&PairedIdentity>) -> Vec<DiscoveredDevice> {
        let mut list = Vec::with_capacity(self.devices.len() + 1);
        if let Some(known) = known {
            if !self.devices.iter().any(|d| d.transport_id == known.transport_id) {
                list.push(DiscoveredDevice::stand_in(known, &self.pattern));
            }
        }
        list.extend(self.devices.iter().cloned());
        list
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub name_pattern: String,
    /// Device paired in an earlier session
    pub remembered: Option<PairedIdentity>,
}

impl ScanOptions {
    pub fn new(name_pattern: &str) -> Self {
        Self {
            name_pattern: name_pattern.to_string(),
            remembered: None,
        }
    }

    pub fn with_remembered(mut self, remembered: Option<PairedIdentity>) -> Self {
        self.remembered = remembered;
        self
    }
}

pub struct DiscoveryScanner<A> {
    adapter: Arc<A>,
    window: Duration,
    tick: Duration,
    attempts: u32,
}

impl<A: AdapterService + 'static> DiscoveryScanner<A> {
    pub fn new(adapter: Arc<A>, config: &CommissionConfig) -> Self {
        Self {
            adapter,
            window: config.scan_window,
            tick: config.scan_tick.max(MIN_PERIOD),
            attempts: config.scan_attempts.max(1),
        }
    }

    /// Open the adapter and start a scan session in the background
    pub async fn start_scan(&self, options: ScanOptions) -> Result<ScanHandle> {
        self.adapter
            .open_adapter()
            .await
            .map_err(|e| CommissionError::AdapterUnavailable(e.to_string()))?;

        let (tick_tx, tick_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = ScanSession {
            adapter: self.adapter.clone(),
            window: self.window,
            tick: self.tick,
            attempts: self.attempts,
            options,
            ticks: tick_tx,
            stop: stop_rx,
        };
        let task = tokio::spawn(session.run());

        Ok(ScanHandle {
            ticks: tick_rx,
            stop: stop_tx,
            task,
        })
    }
}

/// Running scan session
///
/// Dropping the handle stops the scan.
pub struct ScanHandle {
    ticks: mpsc::Receiver<Vec<DiscoveredDevice>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<Vec<DiscoveredDevice>>>,
}

impl ScanHandle {
    /// Next cumulative tick, None once the session is over
    pub async fn next(&mut self) -> Option<Vec<DiscoveredDevice>> {
        self.ticks.recv().await
    }

    /// Stop scanning now and return what was found so far
    pub async fn stop(self) -> Result<Vec<DiscoveredDevice>> {
        let _ = self.stop.send(true);
        join(self.task).await
    }

    /// Wait for the session to end on its own
    pub async fn finish(self) -> Result<Vec<DiscoveredDevice>> {
        let ScanHandle { ticks, stop, task } = self;
        drop(ticks);
        let result = join(task).await;
        drop(stop);
        result
    }
}

async fn join(task: JoinHandle<Result<Vec<DiscoveredDevice>>>) -> Result<Vec<DiscoveredDevice>> {
    task.await
        .map_err(|e| CommissionError::AdapterUnavailable(format!("scan task failed: {e}")))?
}

struct ScanSession<A> {
    adapter: Arc<A>,
    window: Duration,
    tick: Duration,
    attempts: u32,
    options: ScanOptions,
    ticks: mpsc::Sender<Vec<DiscoveredDevice>>,
    stop: watch::Receiver<bool>,
}

impl<A: AdapterService> ScanSession<A> {
    async fn run(mut self) -> Result<Vec<DiscoveredDevice>> {
        let mut set = ScanSet::new(&self.options.name_pattern);
        let request = ScanRequest { allow_duplicates: false };

        for attempt in 1..=self.attempts {
            // adapters reject a start while a scan is still running
            if let Err(e) = self.adapter.stop_scan().await {
                log::debug!("stop before scan: {e}");
            }
            match self.adapter.start_scan(&request).await {
                Ok(()) => {}
                Err(AdapterError::Unavailable(reason)) => {
                    return Err(CommissionError::AdapterUnavailable(reason));
                }
                Err(e) => {
                    log::warn!("scan attempt {attempt} could not start: {e}");
                    continue;
                }
            }
            log::debug!("scan attempt {attempt}/{}", self.attempts);

            let stopped = self.scan_window(&mut set).await;
            if let Err(e) = self.adapter.stop_scan().await {
                log::debug!("stop after scan: {e}");
            }
            if stopped || set.found() {
                let devices = set.snapshot(self.options.remembered.as_ref());
                log::info!("scan finished with {} candidate(s)", devices.len());
                return Ok(devices);
            }
        }

        log::warn!(
            "no device matching {:?} after {} attempts",
            self.options.name_pattern,
            self.attempts
        );
        Err(CommissionError::NoDevicesFound {
            pattern: self.options.name_pattern.clone(),
            attempts: self.attempts,
        })
    }

    /// Poll for one window; true when the caller asked to stop
    async fn scan_window(&mut self, set: &mut ScanSet) -> bool {
        let window = tokio::time::sleep(self.window);
        tokio::pin!(window);
        let mut ticker = tokio::time::interval(self.tick);

        loop {
            tokio::select! {
                _ = &mut window => break,
                _ = ticker.tick() => self.poll(set).await,
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        return true;
                    }
                }
            }
        }

        self.poll(set).await;
        false
    }

    async fn poll(&self, set: &mut ScanSet) {
        match self.adapter.advertisements().await {
            Ok(ads) => set.merge(&ads),
            Err(e) => {
                log::warn!("reading advertisements failed: {e}");
                return;
            }
        }
        let snapshot = set.snapshot(self.options.remembered.as_ref());
        // ticks are cumulative, a skipped one loses nothing
        if self.ticks.try_send(snapshot).is_err() {
            log::debug!("scan tick dropped");
        }
    }
}
