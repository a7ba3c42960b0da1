use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::protocol::Envelope;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::{
    credentials::CredentialStore,
    dispatch::{EventDispatcher, SharedHandler},
    error::{RealtimeError, TransportError},
    heartbeat::{HeartbeatMonitor, DEFAULT_HEARTBEAT_INTERVAL},
    reconnect::ReconnectPolicy,
    transport::{Connector, Frame, TransportLink},
    ClientEvent,
};

/// How long `Closing` waits for the transport to confirm before forcing `Closed`.
const CLOSE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle | Closed, Connecting)
                | (Connecting, Open | Closed)
                | (Open, Closing | Closed)
                | (Closing, Closed)
        )
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub url: Url,
    pub heartbeat_interval: Duration,
    /// `None` disables automatic reconnection.
    pub reconnect: Option<ReconnectPolicy>,
}

impl RealtimeOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect: Some(ReconnectPolicy::default()),
        }
    }
}

type HandshakeFlight = Shared<BoxFuture<'static, Result<(), RealtimeError>>>;

struct PendingReconnect {
    id: u64,
    task: JoinHandle<()>,
}

struct ConnectionInner {
    state: ConnectionState,
    /// Bumped on every connect attempt; tasks from older attempts are ignored.
    epoch: u64,
    attempts: u32,
    exhausted: bool,
    handshake: Option<HandshakeFlight>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<HeartbeatMonitor>,
    pending_reconnect: Option<PendingReconnect>,
    next_reconnect_id: u64,
    close_timer: Option<JoinHandle<()>>,
}

/// Owns the single realtime connection of a session.
///
/// All transitions happen under one lock that is never held across an await,
/// and the timers a transition obsoletes (heartbeat, pending reconnect) are
/// cancelled inside that same critical section.
pub struct ConnectionManager {
    this: Weak<Self>,
    options: RealtimeOptions,
    connector: Arc<dyn Connector>,
    store: Arc<CredentialStore>,
    dispatcher: Arc<EventDispatcher>,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(
        options: RealtimeOptions,
        connector: Arc<dyn Connector>,
        store: Arc<CredentialStore>,
        dispatcher: Arc<EventDispatcher>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            options,
            connector,
            store,
            dispatcher,
            events,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Idle,
                epoch: 0,
                attempts: 0,
                exhausted: false,
                handshake: None,
                outbound: None,
                reader: None,
                heartbeat: None,
                pending_reconnect: None,
                next_reconnect_id: 0,
                close_timer: None,
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.lock().pending_reconnect.is_some()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn on(&self, event_type: impl Into<String>, handler: SharedHandler) -> bool {
        self.dispatcher.on(event_type, handler)
    }

    pub fn off(&self, event_type: &str, handler: &SharedHandler) -> bool {
        self.dispatcher.off(event_type, handler)
    }

    /// Opens the connection, or joins the handshake already in progress.
    ///
    /// Returns immediately when already open. After the reconnect ceiling was
    /// reached, an explicit call starts a fresh run of attempts.
    pub async fn connect(self: &Arc<Self>) -> Result<(), RealtimeError> {
        let flight = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closing => return Err(RealtimeError::Closing),
                ConnectionState::Connecting => match &inner.handshake {
                    Some(flight) => flight.clone(),
                    None => return Err(RealtimeError::Cancelled),
                },
                ConnectionState::Idle | ConnectionState::Closed => {
                    if inner.exhausted {
                        inner.exhausted = false;
                        inner.attempts = 0;
                    }
                    cancel_pending_reconnect(&mut inner);
                    self.begin_connect(&mut inner)
                }
            }
        };
        flight.await
    }

    /// Closes the connection on request. Never triggers a reconnect and
    /// cancels any reconnect that is pending.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        cancel_pending_reconnect(&mut inner);
        match inner.state {
            ConnectionState::Open => {
                if let Some(heartbeat) = inner.heartbeat.take() {
                    heartbeat.stop();
                }
                if let Some(outbound) = inner.outbound.take() {
                    let _ = outbound.send(Frame::Close);
                }
                self.transition(&mut inner, ConnectionState::Closing);
                let epoch = inner.epoch;
                let manager = self.this.clone();
                inner.close_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(CLOSE_CONFIRM_TIMEOUT).await;
                    if let Some(manager) = manager.upgrade() {
                        manager.force_closed(epoch);
                    }
                }));
                info!("realtime: closing connection");
            }
            ConnectionState::Connecting => {
                inner.epoch += 1;
                inner.handshake = None;
                self.transition(&mut inner, ConnectionState::Closed);
                info!("realtime: connect attempt abandoned");
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    /// Sends `envelope` when open. In any other state the envelope is dropped
    /// and `false` is returned.
    pub fn send(&self, envelope: Envelope) -> bool {
        let inner = self.lock();
        let outbound = match (&inner.outbound, inner.state) {
            (Some(outbound), ConnectionState::Open) => Some(outbound),
            _ => None,
        };
        let Some(outbound) = outbound else {
            debug!(
                kind = %envelope.kind,
                state = ?inner.state,
                "realtime: dropping send while not open"
            );
            return false;
        };
        match serde_json::to_string(&envelope) {
            Ok(text) => outbound.send(Frame::Text(text)).is_ok(),
            Err(err) => {
                warn!(kind = %envelope.kind, error = %err, "realtime: failed to encode envelope");
                false
            }
        }
    }

    /// Asks the server to route `channel` to this connection. Not remembered
    /// locally: subscribe again after every reconnect.
    pub fn subscribe(&self, channel: &str) -> bool {
        self.send(Envelope::subscribe(channel))
    }

    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.send(Envelope::unsubscribe(channel))
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut ConnectionInner, next: ConnectionState) {
        let previous = inner.state;
        if previous == next {
            return;
        }
        debug_assert!(
            previous.can_transition_to(next),
            "invalid transition {previous:?} -> {next:?}"
        );
        inner.state = next;
        debug!(?previous, ?next, "realtime: state transition");
        let _ = self.events.send(ClientEvent::ConnectionStateChanged(next));
    }

    fn begin_connect(self: &Arc<Self>, inner: &mut ConnectionInner) -> HandshakeFlight {
        inner.epoch += 1;
        let epoch = inner.epoch;
        self.transition(inner, ConnectionState::Connecting);
        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let Some(manager) = manager.upgrade() else {
                return Err(RealtimeError::Cancelled);
            };
            let url = manager.connect_url().await;
            debug!(
                host = url.host_str().unwrap_or_default(),
                path = url.path(),
                epoch,
                "realtime: connecting"
            );
            let result = manager.connector.connect(&url).await;
            manager.finish_handshake(epoch, result)
        });
        let flight = async move { task.await.unwrap_or(Err(RealtimeError::Cancelled)) }
            .boxed()
            .shared();
        inner.handshake = Some(flight.clone());
        flight
    }

    /// Realtime url carrying the access token current at this moment.
    async fn connect_url(&self) -> Url {
        let mut url = self.options.url.clone();
        if let Some(token) = self.store.access_token().await {
            url.query_pairs_mut().append_pair("token", &token);
        }
        url
    }

    fn finish_handshake(
        self: &Arc<Self>,
        epoch: u64,
        result: Result<TransportLink, TransportError>,
    ) -> Result<(), RealtimeError> {
        let mut inner = self.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Connecting {
            if let Ok(link) = result {
                let _ = link.outbound.send(Frame::Close);
            }
            return Err(RealtimeError::Cancelled);
        }
        inner.handshake = None;
        match result {
            Ok(TransportLink { outbound, inbound }) => {
                inner.attempts = 0;
                inner.exhausted = false;
                inner.heartbeat = Some(HeartbeatMonitor::start(
                    outbound.clone(),
                    self.options.heartbeat_interval,
                ));
                inner.reader = Some(tokio::spawn(read_loop(
                    Arc::downgrade(self),
                    epoch,
                    inbound,
                )));
                inner.outbound = Some(outbound);
                self.transition(&mut inner, ConnectionState::Open);
                info!(epoch, "realtime: connection open");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, attempts = inner.attempts, "realtime: handshake failed");
                self.transition(&mut inner, ConnectionState::Closed);
                self.schedule_reconnect(&mut inner);
                if inner.exhausted {
                    return Err(RealtimeError::ConnectionLost);
                }
                Err(err.into())
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let envelope = match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "realtime: dropping malformed envelope");
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("malformed envelope: {err}")));
                return;
            }
        };
        if envelope.is_control() {
            trace!(kind = %envelope.kind, "realtime: control envelope received");
            return;
        }
        for fault in self.dispatcher.dispatch(&envelope) {
            let _ = self.events.send(ClientEvent::Error(format!(
                "handler for '{}' failed: {}",
                fault.event_type, fault.message
            )));
        }
    }

    /// The transport of attempt `epoch` ended.
    fn handle_transport_closed(self: &Arc<Self>, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.reader = None;
        self.close_transport(&mut inner);
        match inner.state {
            ConnectionState::Open => {
                warn!("realtime: transport dropped unexpectedly");
                self.transition(&mut inner, ConnectionState::Closed);
                self.schedule_reconnect(&mut inner);
            }
            ConnectionState::Closing => {
                info!("realtime: connection closed");
                self.transition(&mut inner, ConnectionState::Closed);
            }
            _ => {}
        }
    }

    fn force_closed(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch != epoch || inner.state != ConnectionState::Closing {
            return;
        }
        warn!("realtime: close not confirmed by transport, forcing closed");
        inner.close_timer = None;
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        self.close_transport(&mut inner);
        self.transition(&mut inner, ConnectionState::Closed);
    }

    fn close_transport(&self, inner: &mut ConnectionInner) {
        if let Some(heartbeat) = inner.heartbeat.take() {
            heartbeat.stop();
        }
        inner.outbound = None;
        if let Some(timer) = inner.close_timer.take() {
            timer.abort();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut ConnectionInner) {
        let Some(policy) = self.options.reconnect else {
            return;
        };
        let Some(delay) = policy.next_delay(inner.attempts) else {
            inner.exhausted = true;
            warn!(
                attempts = inner.attempts,
                "realtime: reconnect attempts exhausted, connection lost"
            );
            let _ = self.events.send(ClientEvent::ConnectionLost);
            return;
        };

        inner.attempts += 1;
        inner.next_reconnect_id += 1;
        let attempt = inner.attempts;
        let id = inner.next_reconnect_id;
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "realtime: scheduling reconnect"
        );
        let _ = self
            .events
            .send(ClientEvent::ReconnectScheduled { attempt, delay });
        let manager = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.fire_reconnect(id).await;
            }
        });
        inner.pending_reconnect = Some(PendingReconnect { id, task });
    }

    async fn fire_reconnect(self: &Arc<Self>, id: u64) {
        let flight = {
            let mut inner = self.lock();
            match &inner.pending_reconnect {
                Some(pending) if pending.id == id => {}
                _ => return,
            }
            inner.pending_reconnect = None;
            if !matches!(
                inner.state,
                ConnectionState::Idle | ConnectionState::Closed
            ) {
                return;
            }
            self.begin_connect(&mut inner)
        };
        // A failed attempt already scheduled the next one.
        let _ = flight.await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        cancel_pending_reconnect(inner);
        if let Some(reader) = inner.reader.take() {
            reader.abort();
        }
        if let Some(timer) = inner.close_timer.take() {
            timer.abort();
        }
        inner.heartbeat = None;
        if let Some(outbound) = inner.outbound.take() {
            let _ = outbound.send(Frame::Close);
        }
    }
}

fn cancel_pending_reconnect(inner: &mut ConnectionInner) {
    if let Some(pending) = inner.pending_reconnect.take() {
        pending.task.abort();
        debug!("realtime: pending reconnect cancelled");
    }
}

async fn read_loop(
    manager: Weak<ConnectionManager>,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = inbound.recv().await {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match frame {
            Frame::Text(text) => manager.handle_text(&text),
            Frame::Close => break,
        }
    }
    if let Some(manager) = manager.upgrade() {
        manager.handle_transport_closed(epoch);
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
