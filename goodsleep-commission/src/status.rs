//! Status monitor
//!
//! Owns a provisioning session from the credential write until it succeeds
//! or is abandoned. The sensor reports progress as status frames on its
//! notify channel; only silence is treated as a fault.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use goodsleep_proto::{Frame, StatusCode};
use tokio::sync::{mpsc, watch};

use crate::adapter::{AdapterService, NotificationStream};
use crate::error::{AbandonReason, CommissionError, Result};
use crate::negotiate::PairedDevice;
use crate::provision::{Phase, ProvisioningSession};

/// Progress published while a session is monitored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Phase(Phase),
    Status(StatusCode),
    Text(String),
    Stalled(Duration),
}

/// Force-abandons the monitored session from another task
#[derive(Debug, Clone)]
pub struct AbandonHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbandonHandle {
    pub fn abandon(&self) {
        self.tx.send_replace(true);
    }
}

/// Live subscription on a device's notify channel
struct Subscription {
    paired: PairedDevice,
    stream: NotificationStream,
}

/// Watches one provisioning session
///
/// Use one monitor per session.
pub struct StatusMonitor<A: ?Sized> {
    adapter: Arc<A>,
    timeout: Duration,
    events: Option<mpsc::Sender<StatusEvent>>,
    abandon_tx: Arc<watch::Sender<bool>>,
    abandon_rx: watch::Receiver<bool>,
    subscription: Option<Subscription>,
}

impl<A: AdapterService + ?Sized> StatusMonitor<A> {
    pub fn new(adapter: Arc<A>, timeout: Duration) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            adapter,
            timeout,
            events: None,
            abandon_tx: Arc::new(tx),
            abandon_rx: rx,
            subscription: None,
        }
    }

    /// Publish [`StatusEvent`]s on `events`
    pub fn with_events(mut self, events: mpsc::Sender<StatusEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn abandon_handle(&self) -> AbandonHandle {
        AbandonHandle {
            tx: self.abandon_tx.clone(),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribe to the session's notify channel
    ///
    /// Does nothing when this monitor is already subscribed. Fails with
    /// `AlreadySubscribed` when someone else holds the device's channel.
    pub async fn subscribe(&mut self, session: &mut ProvisioningSession) -> Result<()> {
        if self.subscription.is_some() {
            return Ok(());
        }
        if session.is_terminal() {
            return Err(terminal_error(session.phase()));
        }

        let paired = session.paired().clone();
        if !paired.claim_subscription() {
            return Err(CommissionError::AlreadySubscribed(paired.transport_id().to_string()));
        }
        if *session.phase() == Phase::Idle {
            self.enter(session, Phase::AwaitingSubscription);
        }

        let cap = paired.capability();
        match self
            .adapter
            .subscribe_channel(paired.handle(), &cap.service_id, &cap.notify_channel_id)
            .await
        {
            Ok(stream) => {
                log::debug!("subscribed to {} on {}", cap.notify_channel_id, paired.transport_id());
                self.subscription = Some(Subscription { paired, stream });
                Ok(())
            }
            Err(e) => {
                paired.release_subscription();
                log::error!("subscribe on {} failed: {e}", paired.transport_id());
                self.enter(session, Phase::Abandoned(AbandonReason::SubscribeFailed));
                Err(CommissionError::SubscribeFailed(e.to_string()))
            }
        }
    }

    /// Wait for the session to reach a terminal state
    ///
    /// Returns `Ok` once the sensor reports its session up. Every frame
    /// restarts the timeout; a full timeout window without any frame returns
    /// `SessionStalled` and leaves the session waiting, so the caller may call
    /// `run` again or abandon it.
    pub async fn run(&mut self, session: &mut ProvisioningSession) -> Result<()> {
        if session.is_terminal() {
            return match session.phase() {
                Phase::Succeeded => Ok(()),
                phase => Err(terminal_error(phase)),
            };
        }
        if *self.abandon_rx.borrow_and_update() {
            return self.abandon(session, AbandonReason::Manual).await;
        }
        self.subscribe(session).await?;

        let mut closed = session.paired().closed_signal();
        if *closed.borrow_and_update() {
            return self.abandon(session, AbandonReason::Disconnected).await;
        }

        loop {
            let Some(subscription) = self.subscription.as_mut() else {
                return Err(CommissionError::SubscribeFailed("subscription lost".to_string()));
            };

            tokio::select! {
                changed = self.abandon_rx.changed() => {
                    if changed.is_err() || *self.abandon_rx.borrow() {
                        return self.abandon(session, AbandonReason::Manual).await;
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        return self.abandon(session, AbandonReason::Disconnected).await;
                    }
                }
                frame = subscription.stream.next() => {
                    let Some(bytes) = frame else {
                        log::warn!("notify channel of {} closed", session.paired().transport_id());
                        session.paired().mark_closed();
                        return self.abandon(session, AbandonReason::Disconnected).await;
                    };
                    if self.handle_frame(session, &bytes) {
                        self.enter(session, Phase::Succeeded);
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(self.timeout) => {
                    log::warn!(
                        "no status from {} for {:?}",
                        session.paired().transport_id(),
                        self.timeout
                    );
                    self.emit(StatusEvent::Stalled(self.timeout));
                    return Err(CommissionError::SessionStalled(self.timeout));
                }
            }
        }
    }

    /// Abandon the session, dropping the subscription
    ///
    /// Works from any phase. Always returns the `Abandoned` error so callers
    /// can propagate it.
    pub async fn abandon(&mut self, session: &mut ProvisioningSession, reason: AbandonReason) -> Result<()> {
        if !session.is_terminal() {
            self.enter(session, Phase::Abandoned(reason.clone()));
        }
        self.close().await;
        Err(CommissionError::Abandoned(reason))
    }

    /// Unsubscribe from the notify channel
    pub async fn close(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        let paired = subscription.paired;
        drop(subscription.stream);
        if !paired.is_closed() {
            let cap = paired.capability();
            if let Err(e) = self
                .adapter
                .unsubscribe_channel(paired.handle(), &cap.service_id, &cap.notify_channel_id)
                .await
            {
                log::debug!("unsubscribe from {}: {e}", paired.transport_id());
            }
        }
        paired.release_subscription();
    }

    /// Returns true when the frame ends the session successfully
    fn handle_frame(&self, session: &mut ProvisioningSession, bytes: &[u8]) -> bool {
        let device = session.paired().transport_id().to_string();
        let code = match Frame::parse(bytes) {
            Frame::Text(text) => {
                log::debug!("{device}: text frame {text:?}");
                self.emit(StatusEvent::Text(text));
                return false;
            }
            Frame::Status(code) => code,
        };

        session.record_status(code);
        self.emit(StatusEvent::Status(code));
        match code {
            StatusCode::SessionUp => log::info!("{device}: {code}"),
            StatusCode::LinkUp => log::info!("{device}: {code}, waiting for session"),
            StatusCode::LinkFailed => log::warn!(
                "{device}: {code}, device retrying ({} so far)",
                session.retry_count()
            ),
            StatusCode::SessionDropped | StatusCode::LinkDropped | StatusCode::OffBed => {
                log::warn!("{device}: {code}")
            }
            StatusCode::Unknown(b) => log::warn!("{device}: ignoring unknown status 0x{b:02x}"),
        }
        code.is_terminal_success()
    }

    fn enter(&self, session: &mut ProvisioningSession, phase: Phase) {
        session.set_phase(phase.clone());
        self.emit(StatusEvent::Phase(phase));
    }

    fn emit(&self, event: StatusEvent) {
        if let Some(events) = &self.events {
            if events.try_send(event).is_err() {
                log::debug!("status event dropped");
            }
        }
    }
}

fn terminal_error(phase: &Phase) -> CommissionError {
    match phase {
        Phase::Abandoned(reason) => CommissionError::Abandoned(reason.clone()),
        _ => CommissionError::SessionActive("session already finished".to_string()),
    }
}
