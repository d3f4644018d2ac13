//! Liveness monitoring
//!
//! Once a sensor is on Wi-Fi it reports to the cloud; the device status
//! service tells us whether it still does. The monitor polls that service on
//! a fixed interval and keeps a [`LivenessRecord`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::MIN_PERIOD;
use crate::error::LivenessError;
use crate::identity::ResolvedAddress;

/// Status id the service reserves for an offline device
pub const OFFLINE_STATUS: u8 = 4;

/// Answer of the device status service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessReport {
    pub status_id: u8,
    /// Unix seconds of the device's last report to the service
    pub last_update: u64,
}

impl LivenessReport {
    pub fn is_online(&self) -> bool {
        self.status_id != OFFLINE_STATUS
    }
}

/// Remote device status query, keyed by address
#[async_trait::async_trait]
pub trait LivenessEndpoint: Send + Sync {
    async fn query(&self, address: &ResolvedAddress) -> Result<LivenessReport, LivenessError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessState {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    pub resolved_address: ResolvedAddress,
    pub last_online_timestamp: Option<u64>,
    pub consecutive_failures: u32,
    pub current_state: LivenessState,
}

impl LivenessRecord {
    pub fn new(resolved_address: ResolvedAddress) -> Self {
        Self {
            resolved_address,
            last_online_timestamp: None,
            consecutive_failures: 0,
            current_state: LivenessState::Unknown,
        }
    }

    /// Fold one check result in
    ///
    /// A single offline or failed check flips the state to Offline, a single
    /// good one flips it back.
    pub fn apply(&mut self, result: &Result<LivenessReport, LivenessError>) {
        match result {
            Ok(report) if report.is_online() => {
                self.current_state = LivenessState::Online;
                self.consecutive_failures = 0;
                self.last_online_timestamp = Some(report.last_update);
            }
            Ok(_) => {
                self.current_state = LivenessState::Offline;
                self.consecutive_failures += 1;
            }
            Err(e) => {
                log::warn!("liveness check for {} failed: {e}", self.resolved_address);
                self.current_state = LivenessState::Offline;
                self.consecutive_failures += 1;
            }
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct LivenessMonitor<E: ?Sized> {
    endpoint: Arc<E>,
    call_timeout: Duration,
    record: Arc<Mutex<Option<LivenessRecord>>>,
    running: Option<Running>,
}

impl<E: LivenessEndpoint + ?Sized + 'static> LivenessMonitor<E> {
    pub fn new(endpoint: Arc<E>, call_timeout: Duration) -> Self {
        Self {
            endpoint,
            call_timeout,
            record: Arc::new(Mutex::new(None)),
            running: None,
        }
    }

    /// Start polling `address` every `interval`
    ///
    /// The first check runs right away. `on_tick` sees the record after every
    /// check. A monitor that is already running is stopped first.
    pub async fn start<F>(&mut self, address: ResolvedAddress, interval: Duration, mut on_tick: F)
    where
        F: FnMut(&LivenessRecord) + Send + 'static,
    {
        self.stop().await;
        log::info!("liveness monitoring of {address} every {interval:?}");

        if let Ok(mut record) = self.record.lock() {
            *record = Some(LivenessRecord::new(address.clone()));
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let endpoint = self.endpoint.clone();
        let record = self.record.clone();
        let call_timeout = self.call_timeout;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_PERIOD));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                let result = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    r = query_with_timeout(endpoint.as_ref(), &address, call_timeout) => r,
                };

                let snapshot = match record.lock() {
                    Ok(mut guard) => {
                        let rec = guard.get_or_insert_with(|| LivenessRecord::new(address.clone()));
                        rec.apply(&result);
                        rec.clone()
                    }
                    Err(_) => break,
                };
                log::debug!("liveness of {address}: {:?}", snapshot.current_state);
                on_tick(&snapshot);
            }
        });

        self.running = Some(Running { stop: stop_tx, task });
    }

    /// Stop polling; no tick fires after this returns
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.stop.send(true);
        if let Err(e) = running.task.await {
            log::warn!("liveness task ended abnormally: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Latest record of the monitored device
    pub fn record(&self) -> Option<LivenessRecord> {
        self.record.lock().ok().and_then(|r| r.clone())
    }

    /// Check once without waiting for the next tick
    ///
    /// The result also updates the record when `address` is the monitored one.
    pub async fn check(&self, address: &ResolvedAddress) -> LivenessState {
        let result = query_with_timeout(self.endpoint.as_ref(), address, self.call_timeout).await;
        let mut probe = LivenessRecord::new(address.clone());
        probe.apply(&result);

        if let Ok(mut guard) = self.record.lock() {
            if let Some(rec) = guard.as_mut().filter(|r| &r.resolved_address == address) {
                rec.apply(&result);
            }
        }
        probe.current_state
    }
}

async fn query_with_timeout<E: LivenessEndpoint + ?Sized>(
    endpoint: &E,
    address: &ResolvedAddress,
    call_timeout: Duration,
) -> Result<LivenessReport, LivenessError> {
    tokio::time::timeout(call_timeout, endpoint.query(address))
        .await
        .map_err(|_| LivenessError::Timeout(call_timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;

    fn record() -> LivenessRecord {
        LivenessRecord::new(identity::resolve("AA:BB:CC:DD:EE:10", &[]))
    }

    #[test]
    fn single_failure_flips_offline_and_back() {
        let mut rec = record();
        assert_eq!(rec.current_state, LivenessState::Unknown);

        for t in 1..=3 {
            rec.apply(&Ok(LivenessReport { status_id: 1, last_update: t }));
        }
        assert_eq!(rec.current_state, LivenessState::Online);
        assert_eq!(rec.last_online_timestamp, Some(3));

        rec.apply(&Err(LivenessError::Transport("refused".into())));
        assert_eq!(rec.current_state, LivenessState::Offline);
        assert_eq!(rec.consecutive_failures, 1);

        rec.apply(&Ok(LivenessReport { status_id: OFFLINE_STATUS, last_update: 4 }));
        assert_eq!(rec.consecutive_failures, 2);
        assert_eq!(rec.last_online_timestamp, Some(3));

        rec.apply(&Ok(LivenessReport { status_id: 2, last_update: 9 }));
        assert_eq!(rec.current_state, LivenessState::Online);
        assert_eq!(rec.consecutive_failures, 0);
    }
}
