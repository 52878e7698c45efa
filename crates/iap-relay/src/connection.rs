//! Relay connection: handshake, driver task and public handle
//!
//! The handle ([`RelayConnection`]) talks to a single driver task over
//! channels. The driver owns the physical channel, the send window and every
//! byte counter, so there is exactly one send path and one receive path.
//!
//! ```text
//!  send() ──outbound──▶ ┌────────┐ ──Data──▶
//!                       │ driver │            relay channel
//!  recv() ◀──inbound─── └────────┘ ◀──Data───
//!         ──consumed──▶     │
//!                      state (watch)
//! ```

use crate::config::RelayOptions;
use crate::error::RelayError;
use crate::reconnect::{Backoff, BackoffError};
use crate::window::SendWindow;
use bytes::Bytes;
use iap_auth::CredentialSource;
use iap_proto::{RelayMessage, RelayPolicy, TunnelDestination};
use iap_transport::{BoxedChannel, ChannelConnector, ChannelRequest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Largest payload put in one Data message
const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Sends queued ahead of the driver before `send` starts waiting
const SEND_QUEUE_DEPTH: usize = 8;

/// Bound on sending Close and shutting the channel down
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Relay connection state machine
///
/// `Connecting → Connected ⇄ Reconnecting → Closing → Closed`, with `Failed`
/// reachable from anywhere. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Diagnostic counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub session_id: String,
    pub bytes_sent: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub reconnects: u64,
}

/// State shared between the handle and the driver
#[derive(Debug, Default)]
struct Shared {
    failure: Mutex<Option<RelayError>>,
    bytes_sent: AtomicU64,
    bytes_acked: AtomicU64,
    bytes_received: AtomicU64,
    reconnects: AtomicU64,
}

impl Shared {
    fn failure(&self) -> Option<RelayError> {
        self.failure.lock().ok().and_then(|failure| failure.clone())
    }

    fn set_failure(&self, err: RelayError) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(err);
        }
    }
}

/// Handle to an established relay connection
///
/// Dropping the handle closes the connection.
pub struct RelayConnection {
    destination: TunnelDestination,
    session_id: String,
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    consumed_tx: mpsc::UnboundedSender<u64>,
    state_rx: watch::Receiver<ConnectionState>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("destination", &self.destination)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl RelayConnection {
    /// Open a relay session to `destination`
    ///
    /// Transient failures (channel errors, `Rejected{Unavailable}`) are retried
    /// with backoff. Denials are returned immediately. The whole establishment
    /// is bounded by `options.connect_timeout`. `cancel` only governs
    /// establishment; once this returns, use [`close`](Self::close).
    pub async fn connect(
        connector: Arc<dyn ChannelConnector>,
        destination: TunnelDestination,
        policy: RelayPolicy,
        credentials: Arc<dyn CredentialSource>,
        options: RelayOptions,
        cancel: &CancellationToken,
    ) -> Result<Self, RelayError> {
        let request =
            ChannelRequest::new(destination.clone()).with_user_agent(options.user_agent.clone());

        info!(
            "Connecting to {} via {} transport",
            destination,
            connector.name()
        );

        let establish = establish(
            connector.as_ref(),
            credentials.as_ref(),
            &request,
            &policy,
            &options,
            cancel,
        );

        let (channel, session_id, peer_window) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            result = tokio::time::timeout(options.connect_timeout, establish) => {
                result.map_err(|_| {
                    warn!("Connecting to {} timed out after {:?}", destination, options.connect_timeout);
                    RelayError::Timeout
                })??
            }
        };

        info!(
            "Relay session {} established to {} (window {} bytes)",
            session_id, destination, peer_window
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (consumed_tx, consumed_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();

        let keepalive = options
            .keep_alive_interval
            .filter(|period| !period.is_zero())
            .map(|period| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

        let driver = Driver {
            connector,
            credentials,
            request,
            receive_window: options.receive_window as u64,
            options,
            session_id: session_id.clone(),
            channel,
            window: SendWindow::new(peer_window as u64),
            pending: None,
            delivered: 0,
            consumed: 0,
            incoming_offset: 0,
            outbound_rx,
            inbound_tx: Some(inbound_tx),
            consumed_rx,
            state_tx,
            shared: shared.clone(),
            shutdown: shutdown.clone(),
            keepalive,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            destination,
            session_id,
            outbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            consumed_tx,
            state_rx,
            shared,
            shutdown,
        })
    }

    pub fn destination(&self) -> &TunnelDestination {
        &self.destination
    }

    /// Resumable session id issued by the relay
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue bytes for the relay, waiting while the flow-control window is full
    pub async fn send(&self, data: Bytes) -> Result<(), RelayError> {
        if let Some(err) = self.shared.failure() {
            return Err(err);
        }
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Err(RelayError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }

        self.outbound_tx
            .send(data)
            .await
            .map_err(|_| self.shared.failure().unwrap_or(RelayError::Closed))
    }

    /// Next chunk from the relay
    ///
    /// `Ok(None)` once the connection closed cleanly. Once the connection has
    /// failed every call returns the failure, even if data was still queued.
    pub async fn recv(&self) -> Result<Option<Bytes>, RelayError> {
        if let Some(err) = self.shared.failure() {
            return Err(err);
        }

        let mut inbound = self.inbound_rx.lock().await;
        match inbound.recv().await {
            Some(data) => {
                // Lets the driver acknowledge the bytes
                let _ = self.consumed_tx.send(data.len() as u64);
                Ok(Some(data))
            }
            None => match self.shared.failure() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The error that moved the connection to `Failed`
    pub fn failure(&self) -> Option<RelayError> {
        self.shared.failure()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            session_id: self.session_id.clone(),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_acked: self.shared.bytes_acked.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Close the connection and wait until the driver has released the channel
    ///
    /// Idempotent. Cancels a resumption in progress.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let mut state = self.state_rx.clone();
        // Err means the driver is already gone
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Send a Connect, retrying transient failures with backoff
async fn establish(
    connector: &dyn ChannelConnector,
    credentials: &dyn CredentialSource,
    request: &ChannelRequest,
    policy: &RelayPolicy,
    options: &RelayOptions,
    cancel: &CancellationToken,
) -> Result<(BoxedChannel, String, u32), RelayError> {
    let mut backoff = Backoff::new(options.reconnect.clone());

    loop {
        match handshake(connector, credentials, request, policy, options).await {
            Ok(established) => return Ok(established),
            Err(RelayError::Unavailable(reason)) => {
                warn!("Relay unavailable for {}: {}", request.destination, reason);
                match backoff.pause(cancel).await {
                    Ok(()) => continue,
                    Err(BackoffError::Cancelled) => return Err(RelayError::Cancelled),
                    Err(BackoffError::Exhausted(_)) => return Err(RelayError::Unavailable(reason)),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn handshake(
    connector: &dyn ChannelConnector,
    credentials: &dyn CredentialSource,
    request: &ChannelRequest,
    policy: &RelayPolicy,
    options: &RelayOptions,
) -> Result<(BoxedChannel, String, u32), RelayError> {
    let token = credentials.access_token().await?;
    let mut channel = connector.connect(request).await?;

    let connect = RelayMessage::Connect {
        auth_token: token.secret().to_string(),
        destination: request.destination.clone(),
        policy: policy.clone(),
        receive_window: options.receive_window,
        user_agent: request.user_agent.clone(),
    };

    match exchange_connect(&mut channel, connect).await {
        Ok((session_id, window)) => Ok((channel, session_id, window)),
        Err(e) => {
            let _ = channel.close().await;
            Err(e)
        }
    }
}

async fn exchange_connect(
    channel: &mut BoxedChannel,
    connect: RelayMessage,
) -> Result<(String, u32), RelayError> {
    channel.send_message(connect).await?;

    match next_reply(channel).await? {
        RelayMessage::Connected {
            session_id,
            receive_window,
        } => {
            if receive_window == 0 {
                return Err(RelayError::ProtocolViolation(
                    "relay advertised an empty receive window".to_string(),
                ));
            }
            Ok((session_id, receive_window))
        }
        RelayMessage::Rejected { code, reason } => {
            debug!("Connect rejected ({:?}): {}", code, reason);
            match RelayError::from_rejection(code, reason) {
                RelayError::ResumptionRejected(reason) => Err(RelayError::ProtocolViolation(
                    format!("SessionUnknown in reply to Connect: {}", reason),
                )),
                err => Err(err),
            }
        }
        other => Err(RelayError::ProtocolViolation(format!(
            "expected Connected, got {}",
            other.kind()
        ))),
    }
}

/// Send a Reconnect for an existing session
///
/// Returns the new channel and the number of bytes the relay has consumed.
async fn resume_session(
    connector: &dyn ChannelConnector,
    credentials: &dyn CredentialSource,
    request: &ChannelRequest,
    session_id: &str,
    received: u64,
) -> Result<(BoxedChannel, u64), RelayError> {
    let token = credentials.access_token().await?;
    let mut channel = connector.connect(request).await?;

    let reconnect = RelayMessage::Reconnect {
        auth_token: token.secret().to_string(),
        session_id: session_id.to_string(),
        received,
    };

    match exchange_reconnect(&mut channel, reconnect).await {
        Ok(peer_received) => Ok((channel, peer_received)),
        Err(e) => {
            let _ = channel.close().await;
            Err(e)
        }
    }
}

async fn exchange_reconnect(
    channel: &mut BoxedChannel,
    reconnect: RelayMessage,
) -> Result<u64, RelayError> {
    channel.send_message(reconnect).await?;

    match next_reply(channel).await? {
        RelayMessage::Reconnected { received } => Ok(received),
        RelayMessage::Rejected { code, reason } => Err(RelayError::from_rejection(code, reason)),
        other => Err(RelayError::ProtocolViolation(format!(
            "expected Reconnected, got {}",
            other.kind()
        ))),
    }
}

/// Next handshake reply, answering keep-alives on the way
async fn next_reply(channel: &mut BoxedChannel) -> Result<RelayMessage, RelayError> {
    loop {
        match channel.recv_message().await? {
            Some(RelayMessage::Ping { timestamp }) => {
                channel
                    .send_message(RelayMessage::Pong { timestamp })
                    .await?;
            }
            Some(RelayMessage::Pong { .. }) => continue,
            Some(message) => return Ok(message),
            None => {
                return Err(RelayError::Unavailable(
                    "channel closed during handshake".to_string(),
                ))
            }
        }
    }
}

/// Why the driver left the pump loop
enum Fault {
    /// The physical channel is gone, the session may be resumed
    LinkLost(String),
    /// The stream cannot continue
    Fatal(RelayError),
}

enum Exit {
    LocalClose,
    RemoteClose(String),
}

enum Event {
    Shutdown,
    Consumed(u64),
    Message(Result<Option<RelayMessage>, iap_transport::TransportError>),
    Outbound(Option<Bytes>),
    KeepAlive,
}

struct Driver {
    connector: Arc<dyn ChannelConnector>,
    credentials: Arc<dyn CredentialSource>,
    request: ChannelRequest,
    options: RelayOptions,
    session_id: String,
    channel: BoxedChannel,

    window: SendWindow,
    /// Accepted from the handle, not yet fully sent
    pending: Option<Bytes>,

    receive_window: u64,
    /// Bytes handed to the inbound queue
    delivered: u64,
    /// Bytes the application has read, which is what we acknowledge
    consumed: u64,
    /// Stream position of the next byte the relay sends
    incoming_offset: u64,

    outbound_rx: mpsc::Receiver<Bytes>,
    inbound_tx: Option<mpsc::UnboundedSender<Bytes>>,
    consumed_rx: mpsc::UnboundedReceiver<u64>,
    state_tx: watch::Sender<ConnectionState>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    keepalive: Option<Interval>,
}

impl Driver {
    async fn run(mut self) {
        let outcome = loop {
            match self.pump().await {
                Ok(exit) => break Ok(exit),
                Err(Fault::LinkLost(reason)) => {
                    if let Err(e) = self.resume(reason).await {
                        break Err(e);
                    }
                }
                Err(Fault::Fatal(e)) => break Err(e),
            }
        };

        match outcome {
            Ok(Exit::LocalClose) | Err(RelayError::Cancelled) => {
                self.finish(Some("closed by client")).await;
            }
            Ok(Exit::RemoteClose(reason)) => {
                info!("[{}] Relay closed the session: {}", self.session_id, reason);
                self.finish(None).await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!("[{}] state -> {}", self.session_id, state);
        self.state_tx.send_replace(state);
    }

    async fn pump(&mut self) -> Result<Exit, Fault> {
        loop {
            self.flush_pending().await?;

            let accepting = self.pending.is_none() && self.window.available() > 0;

            let event = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Event::Shutdown,
                Some(n) = self.consumed_rx.recv() => Event::Consumed(n),
                message = self.channel.recv_message() => Event::Message(message),
                data = self.outbound_rx.recv(), if accepting => Event::Outbound(data),
                _ = tick(&mut self.keepalive) => Event::KeepAlive,
            };

            match event {
                Event::Shutdown => return Ok(Exit::LocalClose),
                Event::Consumed(mut n) => {
                    while let Ok(more) = self.consumed_rx.try_recv() {
                        n += more;
                    }
                    self.consumed += n;
                    self.send(RelayMessage::Ack {
                        received: self.consumed,
                    })
                    .await?;
                }
                Event::Message(Ok(Some(message))) => {
                    if let Some(exit) = self.handle_message(message).await? {
                        return Ok(exit);
                    }
                }
                Event::Message(Ok(None)) => {
                    return Err(Fault::LinkLost("channel closed by relay".to_string()))
                }
                Event::Message(Err(e)) => return Err(Fault::LinkLost(e.to_string())),
                Event::Outbound(Some(data)) => self.pending = Some(data),
                // Every handle is gone
                Event::Outbound(None) => return Ok(Exit::LocalClose),
                Event::KeepAlive => {
                    let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                    self.send(RelayMessage::Ping { timestamp }).await?;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: RelayMessage) -> Result<Option<Exit>, Fault> {
        match message {
            RelayMessage::Data { data } => self.deliver(data)?,
            RelayMessage::Ack { received } => {
                let newly = self.window.acknowledge(received).map_err(|e| {
                    Fault::Fatal(RelayError::ProtocolViolation(e.to_string()))
                })?;
                self.shared.bytes_acked.fetch_add(newly, Ordering::Relaxed);
                trace!(
                    "[{}] ack {} ({} in flight)",
                    self.session_id,
                    received,
                    self.window.in_flight()
                );
            }
            RelayMessage::Ping { timestamp } => {
                self.send(RelayMessage::Pong { timestamp }).await?;
            }
            RelayMessage::Pong { timestamp } => {
                trace!("[{}] pong {}", self.session_id, timestamp);
            }
            RelayMessage::Close { reason } => return Ok(Some(Exit::RemoteClose(reason))),
            other => {
                return Err(Fault::Fatal(RelayError::ProtocolViolation(format!(
                    "unexpected {} on an established session",
                    other.kind()
                ))))
            }
        }
        Ok(None)
    }

    /// Queue relay payload for the application, dropping bytes already
    /// delivered before a resumption
    fn deliver(&mut self, data: Vec<u8>) -> Result<(), Fault> {
        let len = data.len() as u64;
        let start = self.incoming_offset;
        self.incoming_offset += len;

        let duplicate = self.delivered.saturating_sub(start).min(len) as usize;
        if duplicate as u64 == len {
            trace!("[{}] dropping {} replayed bytes", self.session_id, len);
            return Ok(());
        }

        let fresh = Bytes::from(data).slice(duplicate..);
        self.delivered += fresh.len() as u64;

        if self.delivered - self.consumed > self.receive_window {
            return Err(Fault::Fatal(RelayError::ProtocolViolation(format!(
                "relay exceeded receive window of {} bytes",
                self.receive_window
            ))));
        }

        self.shared
            .bytes_received
            .fetch_add(fresh.len() as u64, Ordering::Relaxed);

        if let Some(tx) = &self.inbound_tx {
            // Nobody reading is not an error
            let _ = tx.send(fresh);
        }
        Ok(())
    }

    /// Send as much pending data as the window allows
    async fn flush_pending(&mut self) -> Result<(), Fault> {
        while let Some(mut data) = self.pending.take() {
            let room = self.window.available().min(MAX_DATA_CHUNK as u64) as usize;
            if room == 0 {
                self.pending = Some(data);
                break;
            }

            let chunk = if data.len() > room {
                let head = data.split_to(room);
                self.pending = Some(data);
                head
            } else {
                data
            };

            // Recorded first so a failed send is replayed after resumption
            self.window.record_sent(chunk.clone());
            self.shared
                .bytes_sent
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);

            self.send(RelayMessage::Data {
                data: chunk.to_vec(),
            })
            .await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: RelayMessage) -> Result<(), Fault> {
        self.channel
            .send_message(message)
            .await
            .map_err(|e| Fault::LinkLost(e.to_string()))
    }

    /// Reopen the channel and resume the session
    async fn resume(&mut self, reason: String) -> Result<(), RelayError> {
        warn!(
            "[{}] Relay link lost ({}), resuming session",
            self.session_id, reason
        );
        self.set_state(ConnectionState::Reconnecting);
        self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
        let _ = self.channel.close().await;

        let shutdown = self.shutdown.clone();
        let mut backoff = Backoff::new(self.options.reconnect.clone());

        'attempts: loop {
            backoff.pause(&shutdown).await.map_err(|e| match e {
                BackoffError::Cancelled => RelayError::Cancelled,
                BackoffError::Exhausted(retries) => RelayError::Unavailable(format!(
                    "could not resume session after {} attempts",
                    retries
                )),
            })?;

            let attempt = tokio::time::timeout(
                self.options.connect_timeout,
                resume_session(
                    self.connector.as_ref(),
                    self.credentials.as_ref(),
                    &self.request,
                    &self.session_id,
                    self.consumed,
                ),
            );

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(RelayError::Cancelled),
                result = attempt => result.unwrap_or_else(|_| {
                    Err(RelayError::Unavailable("resumption timed out".to_string()))
                }),
            };

            let (channel, peer_received) = match result {
                Ok(resumed) => resumed,
                Err(RelayError::Unavailable(reason)) => {
                    debug!(
                        "[{}] Resume attempt {} failed: {}",
                        self.session_id,
                        backoff.retries(),
                        reason
                    );
                    continue;
                }
                Err(e) => {
                    error!("[{}] Relay refused resumption: {}", self.session_id, e);
                    return Err(e);
                }
            };

            self.channel = channel;

            let replay = self
                .window
                .resume(peer_received)
                .map_err(|e| RelayError::ProtocolViolation(format!("on resumption: {}", e)))?;
            self.incoming_offset = self.consumed;

            let replayed: usize = replay.iter().map(|chunk| chunk.len()).sum();
            for chunk in replay {
                let message = RelayMessage::Data {
                    data: chunk.to_vec(),
                };
                if let Err(e) = self.channel.send_message(message).await {
                    debug!("[{}] Link lost during replay: {}", self.session_id, e);
                    let _ = self.channel.close().await;
                    continue 'attempts;
                }
            }

            info!(
                "[{}] Session resumed after {} attempt(s), replayed {} bytes",
                self.session_id,
                backoff.retries(),
                replayed
            );
            self.set_state(ConnectionState::Connected);
            return Ok(());
        }
    }

    async fn finish(&mut self, reason: Option<&str>) {
        self.set_state(ConnectionState::Closing);
        let channel = &mut self.channel;
        let goodbye = async {
            if let Some(reason) = reason {
                let _ = channel
                    .send_message(RelayMessage::Close {
                        reason: reason.to_string(),
                    })
                    .await;
            }
            let _ = channel.close().await;
        };
        if tokio::time::timeout(CLOSE_GRACE, goodbye).await.is_err() {
            debug!("[{}] Relay did not take the Close in time", self.session_id);
        }
        self.inbound_tx = None;
        info!("[{}] Relay connection closed", self.session_id);
        self.set_state(ConnectionState::Closed);
    }

    async fn fail(&mut self, err: RelayError) {
        error!("[{}] Relay connection failed: {}", self.session_id, err);
        self.shared.set_failure(err);
        let _ = self.channel.close().await;
        self.inbound_tx = None;
        self.set_state(ConnectionState::Failed);
    }
}

async fn tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
