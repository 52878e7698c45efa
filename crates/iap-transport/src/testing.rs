//! In-process relay for tests
//!
//! [`SimulatedProxy`] speaks the relay protocol over the in-memory transport.
//! By default it echoes every payload byte back and acknowledges immediately,
//! which makes every tunnel behave like an echo server. Echoed bytes respect
//! the receive window the client advertised and the client's cumulative acks.
//! Tests can drop links, forget sessions, withhold acks, expire tokens and
//! queue rejections.

use crate::memory::IncomingChannel;
use crate::{MemoryAcceptor, MemoryConnector, RelayChannel};
use iap_proto::{InstanceLocator, RejectCode, RelayMessage, RelayPolicy, TunnelDestination};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DATA_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Window advertised in Connected
    pub window: u32,
    pub echo: bool,
    pub ack: bool,
    /// Hold echoed bytes back once the client's receive window is full
    pub honor_client_window: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            window: 64 * 1024,
            echo: true,
            ack: true,
            honor_client_window: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRecord {
    pub destination: TunnelDestination,
    pub policy: RelayPolicy,
    pub token: String,
}

#[derive(Default)]
struct ProxySession {
    from_client: Vec<u8>,
    to_client: Vec<u8>,
    /// Client bytes acknowledged by the proxy
    acked: u64,
    max_unacked: u64,
    client_window: u64,
    /// Echoed bytes the client reported as consumed
    client_acked: u64,
    /// Echoed bytes written to the current link
    sent_to_client: u64,
    live: Option<mpsc::UnboundedSender<RelayMessage>>,
}

impl ProxySession {
    /// Data messages for echoed bytes the client has room for
    fn release(&mut self, honor_window: bool) -> Vec<RelayMessage> {
        let end = if honor_window {
            (self.client_acked + self.client_window).min(self.to_client.len() as u64)
        } else {
            self.to_client.len() as u64
        };
        if end <= self.sent_to_client {
            return Vec::new();
        }

        let ready = &self.to_client[self.sent_to_client as usize..end as usize];
        self.sent_to_client = end;
        ready
            .chunks(DATA_CHUNK)
            .map(|chunk| RelayMessage::Data {
                data: chunk.to_vec(),
            })
            .collect()
    }
}

#[derive(Default)]
struct ProxyState {
    sessions: HashMap<String, ProxySession>,
    rejections: VecDeque<RejectCode>,
    expired_tokens: HashSet<String>,
    connects: Vec<ConnectRecord>,
    reconnects: usize,
    closes: Vec<String>,
    next_session: u64,
}

struct ProxyInner {
    options: ProxyOptions,
    state: Mutex<ProxyState>,
    acking: AtomicBool,
    forget_sessions: AtomicBool,
    links: Mutex<Vec<CancellationToken>>,
    stop: CancellationToken,
}

impl ProxyInner {
    fn state(&self) -> MutexGuard<'_, ProxyState> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Relay endpoint reachable through [`SimulatedProxy::connector`]
pub struct SimulatedProxy {
    connector: MemoryConnector,
    inner: Arc<ProxyInner>,
}

impl SimulatedProxy {
    pub fn start() -> Self {
        Self::start_with(ProxyOptions::default())
    }

    pub fn start_with(options: ProxyOptions) -> Self {
        let (connector, acceptor) = MemoryConnector::pair();
        let inner = Arc::new(ProxyInner {
            acking: AtomicBool::new(options.ack),
            options,
            state: Mutex::new(ProxyState::default()),
            forget_sessions: AtomicBool::new(false),
            links: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(inner.clone(), acceptor));

        Self { connector, inner }
    }

    pub fn connector(&self) -> MemoryConnector {
        self.connector.clone()
    }

    /// Physical channels opened so far, handshakes that failed included
    pub fn channels_opened(&self) -> u64 {
        self.connector.connect_count()
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.inner.state().connects.clone()
    }

    pub fn reconnects(&self) -> usize {
        self.inner.state().reconnects
    }

    pub fn closes(&self) -> Vec<String> {
        self.inner.state().closes.clone()
    }

    /// Everything the client sent in a session, in arrival order
    pub fn received(&self, session_id: &str) -> Vec<u8> {
        self.inner
            .state()
            .sessions
            .get(session_id)
            .map(|session| session.from_client.clone())
            .unwrap_or_default()
    }

    /// Largest number of unacknowledged client bytes seen in a session
    pub fn max_unacked(&self, session_id: &str) -> u64 {
        self.inner
            .state()
            .sessions
            .get(session_id)
            .map(|session| session.max_unacked)
            .unwrap_or_default()
    }

    /// Echoed bytes still held back by the client's receive window
    pub fn withheld(&self, session_id: &str) -> u64 {
        self.inner
            .state()
            .sessions
            .get(session_id)
            .map(|session| session.to_client.len() as u64 - session.sent_to_client)
            .unwrap_or_default()
    }

    /// Sever every live link without a Close
    pub fn drop_links(&self) {
        for link in lock(&self.inner.links).drain(..) {
            link.cancel();
        }
    }

    /// Reject every later resumption with SessionUnknown
    pub fn forget_sessions(&self) {
        self.inner.forget_sessions.store(true, Ordering::SeqCst);
    }

    /// Reject the next Connect attempts with these codes, in order
    pub fn reject_next(&self, codes: impl IntoIterator<Item = RejectCode>) {
        self.inner.state().rejections.extend(codes);
    }

    pub fn expire_token(&self, token: &str) {
        self.inner.state().expired_tokens.insert(token.to_string());
    }

    /// Resume acknowledging, and acknowledge everything received so far
    pub fn start_acking(&self) {
        self.inner.acking.store(true, Ordering::SeqCst);
        let mut state = self.inner.state();
        for session in state.sessions.values_mut() {
            session.acked = session.from_client.len() as u64;
            if let Some(live) = &session.live {
                let _ = live.send(RelayMessage::Ack {
                    received: session.acked,
                });
            }
        }
    }

    /// Send an arbitrary message on the session's live link
    pub fn push(&self, session_id: &str, message: RelayMessage) {
        let state = self.inner.state();
        if let Some(live) = state.sessions.get(session_id).and_then(|s| s.live.as_ref()) {
            let _ = live.send(message);
        }
    }
}

impl Drop for SimulatedProxy {
    fn drop(&mut self) {
        self.inner.stop.cancel();
    }
}

async fn accept_loop(inner: Arc<ProxyInner>, acceptor: MemoryAcceptor) {
    loop {
        let incoming = tokio::select! {
            _ = inner.stop.cancelled() => break,
            incoming = acceptor.accept() => incoming,
        };
        match incoming {
            Some(incoming) => {
                tokio::spawn(serve(inner.clone(), incoming));
            }
            None => break,
        }
    }
}

async fn serve(inner: Arc<ProxyInner>, incoming: IncomingChannel) {
    let mut channel = incoming.channel;
    let Ok(Some(first)) = channel.recv_message().await else {
        return;
    };

    let link = CancellationToken::new();
    lock(&inner.links).push(link.clone());
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();

    let (session_id, reply, replay) = match first {
        RelayMessage::Connect {
            auth_token,
            destination,
            policy,
            receive_window,
            ..
        } => {
            let mut state = inner.state();
            state.connects.push(ConnectRecord {
                destination,
                policy,
                token: auth_token.clone(),
            });

            if let Some(code) = state.rejections.pop_front() {
                (None, rejected(code), Vec::new())
            } else if state.expired_tokens.contains(&auth_token) {
                (None, rejected(RejectCode::Unauthorized), Vec::new())
            } else {
                state.next_session += 1;
                let session_id = format!("session-{}", state.next_session);
                state.sessions.insert(
                    session_id.clone(),
                    ProxySession {
                        client_window: receive_window as u64,
                        live: Some(push_tx),
                        ..ProxySession::default()
                    },
                );
                let reply = RelayMessage::Connected {
                    session_id: session_id.clone(),
                    receive_window: inner.options.window,
                };
                (Some(session_id), reply, Vec::new())
            }
        }
        RelayMessage::Reconnect {
            auth_token,
            session_id,
            received,
        } => {
            let mut state = inner.state();
            state.reconnects += 1;

            if state.expired_tokens.contains(&auth_token) {
                (None, rejected(RejectCode::Unauthorized), Vec::new())
            } else if inner.forget_sessions.load(Ordering::SeqCst) {
                (None, rejected(RejectCode::SessionUnknown), Vec::new())
            } else {
                match state.sessions.get_mut(&session_id) {
                    Some(session) => {
                        session.live = Some(push_tx);
                        // What the client consumed is also what it acknowledges
                        let received = received.min(session.to_client.len() as u64);
                        session.client_acked = session.client_acked.max(received);
                        session.sent_to_client = received;
                        let replay = session.release(inner.options.honor_client_window);
                        let reply = RelayMessage::Reconnected {
                            received: session.from_client.len() as u64,
                        };
                        (Some(session_id), reply, replay)
                    }
                    None => (None, rejected(RejectCode::SessionUnknown), Vec::new()),
                }
            }
        }
        _ => return,
    };

    if channel.send_message(reply).await.is_err() {
        return;
    }
    let Some(session_id) = session_id else {
        return;
    };
    for data in replay {
        if channel.send_message(data).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = link.cancelled() => return,
            Some(message) = push_rx.recv() => {
                if channel.send_message(message).await.is_err() {
                    return;
                }
            }
            message = channel.recv_message() => {
                let replies = match message {
                    Ok(Some(message)) => match handle(&inner, &session_id, message) {
                        Some(replies) => replies,
                        None => return,
                    },
                    _ => return,
                };
                for reply in replies {
                    if channel.send_message(reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Replies to one client message, or `None` when the link should end
fn handle(inner: &ProxyInner, session_id: &str, message: RelayMessage) -> Option<Vec<RelayMessage>> {
    let mut state = inner.state();
    let honor_window = inner.options.honor_client_window;

    match message {
        RelayMessage::Data { data } => {
            let session = state.sessions.get_mut(session_id)?;
            session.from_client.extend_from_slice(&data);
            let total = session.from_client.len() as u64;

            let mut replies = Vec::new();
            if inner.acking.load(Ordering::SeqCst) {
                session.acked = total;
                replies.push(RelayMessage::Ack { received: total });
            }
            session.max_unacked = session.max_unacked.max(total - session.acked);

            if inner.options.echo {
                session.to_client.extend_from_slice(&data);
                replies.extend(session.release(honor_window));
            }
            Some(replies)
        }
        RelayMessage::Ack { received } => {
            let session = state.sessions.get_mut(session_id)?;
            session.client_acked = session.client_acked.max(received);
            Some(session.release(honor_window))
        }
        RelayMessage::Pong { .. } => Some(Vec::new()),
        RelayMessage::Ping { timestamp } => Some(vec![RelayMessage::Pong { timestamp }]),
        RelayMessage::Close { reason } => {
            state.closes.push(reason);
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.live = None;
            }
            None
        }
        _ => None,
    }
}

fn rejected(code: RejectCode) -> RelayMessage {
    RelayMessage::Rejected {
        code,
        reason: format!("{:?}", code),
    }
}

pub fn instance(name: &str) -> InstanceLocator {
    InstanceLocator::new("test-project", "zone-a", name)
}

pub fn destination(name: &str, port: u16) -> TunnelDestination {
    TunnelDestination::new(instance(name), port)
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(window: u64) -> ProxySession {
        ProxySession {
            client_window: window,
            to_client: vec![1u8; 40_000],
            ..ProxySession::default()
        }
    }

    fn released(messages: &[RelayMessage]) -> usize {
        messages
            .iter()
            .map(|message| match message {
                RelayMessage::Data { data } => data.len(),
                other => panic!("unexpected {}", other.kind()),
            })
            .sum()
    }

    #[test]
    fn test_release_stops_at_the_client_window() {
        let mut session = session(10_000);

        assert_eq!(released(&session.release(true)), 10_000);
        assert!(session.release(true).is_empty());

        session.client_acked = 25_000;
        assert_eq!(released(&session.release(true)), 25_000);
        assert_eq!(session.sent_to_client, 35_000);
    }

    #[test]
    fn test_release_ignoring_the_window_sends_everything() {
        let mut session = session(10_000);
        let messages = session.release(false);

        assert_eq!(released(&messages), 40_000);
        assert_eq!(messages.len(), 3);
    }
}
