use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::RealtimeConfig;
use super::bus::{EventBus, SubscriptionId};
use super::events::{ClientIntent, EventKind, ServerEvent};
use super::transport::{AuthPayload, LinkEvent, RealtimeLink, RealtimeTransport, WsTransport};
use crate::credentials::CredentialStore;
use crate::error::Error;

// ── ConnectionState ──────────────────────────────────────────────────

/// Lifecycle of the managed connection, observable via
/// [`ConnectionManager::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// First handshake in flight.
    Connecting,
    /// Handshake acknowledged; intents are delivered.
    Connected,
    /// Link lost or handshake failed; waiting before retry number `attempt`.
    Reconnecting { attempt: u32 },
}

/// One `connect()` .. `disconnect()` lifetime. The id lets a supervisor
/// notice it has been replaced and stop touching shared state.
struct Session {
    id: u64,
    cancel: CancellationToken,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Inner<T> {
    transport: T,
    credentials: Arc<dyn CredentialStore>,
    config: RealtimeConfig,
    state: watch::Sender<ConnectionState>,
    bus: EventBus,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

// ── ConnectionManager ────────────────────────────────────────────────

/// Owns the realtime connection and the listener registry.
///
/// Cheap to clone; clones share the same connection. Public operations
/// never fail: while not connected, intents are dropped (no queueing) and
/// connection problems are handled by the background supervisor.
pub struct ConnectionManager<T: RealtimeTransport = WsTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: RealtimeTransport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConnectionManager<WsTransport> {
    pub fn with_websocket(config: RealtimeConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        Self::new(WsTransport, config, credentials)
    }
}

impl<T: RealtimeTransport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        config: RealtimeConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                credentials,
                config,
                state,
                bus: EventBus::new(),
                session: Mutex::new(None),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Watch connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == ConnectionState::Connected
    }

    /// Start the connection supervisor.
    ///
    /// No-op while a connection is up or being established. Without a
    /// session token this logs and returns without attempting a handshake.
    /// Outside a Tokio runtime this logs and does nothing.
    pub fn connect(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, not connecting to realtime endpoint");
            return;
        };
        let mut session = self.inner.lock_session();
        if session.is_some() {
            debug!("realtime connection already active");
            return;
        }
        if self.inner.credentials.token().is_none() {
            warn!("no session token, not connecting to realtime endpoint");
            return;
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        *session = Some(Session {
            id,
            cancel: cancel.clone(),
            outbound: None,
        });
        self.inner.state.send_replace(ConnectionState::Connecting);
        drop(session);

        let inner = Arc::clone(&self.inner);
        runtime.spawn(inner.supervise(id, cancel));
    }

    /// Tear down the connection and forget every listener.
    pub fn disconnect(&self) {
        {
            let mut session = self.inner.lock_session();
            if let Some(s) = session.take() {
                s.cancel.cancel();
                info!("realtime disconnected");
            }
            self.inner.state.send_replace(ConnectionState::Disconnected);
        }
        self.inner.bus.clear();
    }

    /// Register `handler` for events of `kind`. Handlers persist across
    /// reconnects and run in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(kind, Arc::new(handler))
    }

    /// Remove one handler, or every handler for `kind` when `id` is `None`.
    /// Returns how many were removed.
    pub fn off(&self, kind: EventKind, id: Option<SubscriptionId>) -> usize {
        match id {
            Some(id) => usize::from(self.inner.bus.unsubscribe(kind, id)),
            None => self.inner.bus.clear_kind(kind),
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner.bus.count(kind)
    }

    /// Returns `false` (and sends nothing) unless connected.
    pub fn join_room(&self, room_id: impl Into<String>) -> bool {
        self.emit(&ClientIntent::JoinRoom {
            room_id: room_id.into(),
        })
    }

    pub fn leave_room(&self, room_id: impl Into<String>) -> bool {
        self.emit(&ClientIntent::LeaveRoom {
            room_id: room_id.into(),
        })
    }

    pub fn start_typing(&self, room_id: impl Into<String>) -> bool {
        self.emit(&ClientIntent::TypingStart {
            room_id: room_id.into(),
        })
    }

    pub fn stop_typing(&self, room_id: impl Into<String>) -> bool {
        self.emit(&ClientIntent::TypingStop {
            room_id: room_id.into(),
        })
    }

    fn emit(&self, intent: &ClientIntent) -> bool {
        let session = self.inner.lock_session();
        let Some(outbound) = session.as_ref().and_then(|s| s.outbound.as_ref()) else {
            debug!(?intent, "not connected, dropping intent");
            return false;
        };
        send_intent(outbound, intent)
    }
}

// ── Supervisor ───────────────────────────────────────────────────────

impl<T: RealtimeTransport> Inner<T> {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn auth_payload(&self) -> Option<AuthPayload> {
        Some(AuthPayload {
            token: self.credentials.token()?,
            user_id: self.credentials.user_id(),
        })
    }

    /// Connect, pump, and reconnect with fixed backoff until cancelled or
    /// the attempt bound is exceeded.
    async fn supervise(self: Arc<Self>, session_id: u64, cancel: CancellationToken) {
        let policy = self.config.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            let Some(auth) = self.auth_payload() else {
                warn!("session token cleared, stopping realtime connection");
                break;
            };

            let opened = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = tokio::time::timeout(
                    policy.connect_timeout,
                    self.transport.open(&self.config.endpoint, &auth),
                ) => result.unwrap_or_else(|_elapsed| {
                    Err(Error::WebSocketConnect(format!(
                        "handshake timed out after {}ms",
                        policy.connect_timeout.as_millis()
                    )))
                }),
            };

            match opened {
                Ok(link) => {
                    attempt = 0;
                    let Some(reason) = self.run_link(session_id, &cancel, link).await else {
                        return;
                    };
                    info!(%reason, "realtime connection lost");
                }
                Err(e) => warn!(error = %e, attempt, "realtime handshake failed"),
            }

            if attempt >= policy.max_attempts {
                error!(
                    max_attempts = policy.max_attempts,
                    "realtime reconnection limit reached, giving up"
                );
                break;
            }
            attempt += 1;
            if !self.set_state(session_id, ConnectionState::Reconnecting { attempt }) {
                return;
            }
            debug!(attempt, delay_ms = policy.delay.as_millis(), "waiting before reconnect");

            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(policy.delay) => {}
            }
        }

        self.finish(session_id);
    }

    /// Publish the link, replay room membership, then dispatch inbound
    /// frames until the link closes. `None` means the session was torn down.
    async fn run_link(
        &self,
        session_id: u64,
        cancel: &CancellationToken,
        link: RealtimeLink,
    ) -> Option<String> {
        let RealtimeLink {
            outbound,
            mut inbound,
        } = link;

        {
            let mut session = self.lock_session();
            let current = session.as_mut().filter(|s| s.id == session_id)?;
            current.outbound = Some(outbound.clone());
            self.state.send_replace(ConnectionState::Connected);
            send_intent(&outbound, &ClientIntent::JoinAllRooms);
        }
        info!(endpoint = %self.config.endpoint, "realtime connected");

        let reason = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                event = inbound.recv() => match event {
                    Some(LinkEvent::Message(text)) => self.bus.dispatch_frame(&text),
                    Some(LinkEvent::Closed { reason }) => break reason,
                    None => break "transport dropped the link".to_owned(),
                },
            }
        };

        if let Some(current) = self.lock_session().as_mut().filter(|s| s.id == session_id) {
            current.outbound = None;
        }
        Some(reason)
    }

    /// Set `state` if `session_id` is still the live session.
    fn set_state(&self, session_id: u64, state: ConnectionState) -> bool {
        let session = self.lock_session();
        if session.as_ref().is_some_and(|s| s.id == session_id) {
            self.state.send_replace(state);
            true
        } else {
            false
        }
    }

    /// Give up: drop the session and land in `Disconnected`. Listeners are
    /// kept so a later `connect()` resumes delivery.
    fn finish(&self, session_id: u64) {
        let mut session = self.lock_session();
        if session.as_ref().is_some_and(|s| s.id == session_id) {
            *session = None;
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }
}

fn send_intent(outbound: &mpsc::UnboundedSender<String>, intent: &ClientIntent) -> bool {
    match intent.encode() {
        Ok(frame) => outbound.send(frame).is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode realtime intent");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::credentials::MemoryCredentialStore;

    const JOIN_ALL: &str = r#"{"event":"join_all_rooms"}"#;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Handshake {
        Accept,
        Refuse,
        Hang,
    }

    /// The server side of one in-memory link.
    struct MockPeer {
        auth: AuthPayload,
        to_client: mpsc::UnboundedSender<LinkEvent>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    struct MockRealtime {
        handshake: Mutex<Handshake>,
        opens: AtomicUsize,
        peers: mpsc::UnboundedSender<MockPeer>,
    }

    impl MockRealtime {
        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn set_handshake(&self, handshake: Handshake) {
            *self.handshake.lock().unwrap() = handshake;
        }
    }

    impl RealtimeTransport for MockRealtime {
        async fn open(&self, _endpoint: &Url, auth: &AuthPayload) -> Result<RealtimeLink, Error> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let handshake = *self.handshake.lock().unwrap();
            match handshake {
                Handshake::Refuse => {
                    return Err(Error::WebSocketConnect("connection refused".into()));
                }
                Handshake::Hang => std::future::pending::<()>().await,
                Handshake::Accept => {}
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let _ = self.peers.send(MockPeer {
                auth: auth.clone(),
                to_client: in_tx,
                from_client: out_rx,
            });
            Ok(RealtimeLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    fn manager(
        credentials: MemoryCredentialStore,
        handshake: Handshake,
    ) -> (ConnectionManager<MockRealtime>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let transport = MockRealtime {
            handshake: Mutex::new(handshake),
            opens: AtomicUsize::new(0),
            peers: peers_tx,
        };
        let config = RealtimeConfig::new(Url::parse("ws://realtime.test/socket").unwrap());
        (
            ConnectionManager::new(transport, config, Arc::new(credentials)),
            peers_rx,
        )
    }

    fn signed_in() -> MemoryCredentialStore {
        MemoryCredentialStore::with_session("tok-1", Some("u-1".into()))
    }

    fn message_frame(id: &str) -> LinkEvent {
        LinkEvent::Message(
            json!({"event": "new_message", "data": {"_id": id, "roomId": "r-1", "content": "hi"}})
                .to_string(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn counter(m: &ConnectionManager<MockRealtime>, kind: EventKind) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        m.on(kind, move |_: &ServerEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    #[tokio::test(start_paused = true)]
    async fn no_token_means_no_handshake() {
        let (m, _peers) = manager(MemoryCredentialStore::new(), Handshake::Accept);

        m.connect();
        settle().await;

        assert_eq!(m.transport().opens(), 0);
        assert_eq!(m.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_carries_token_and_user() {
        let (m, mut peers) = manager(signed_in(), Handshake::Accept);

        m.connect();
        let peer = peers.recv().await.unwrap();

        assert_eq!(peer.auth.token.expose_secret(), "tok-1");
        assert_eq!(peer.auth.user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_twice_opens_once() {
        let (m, mut peers) = manager(signed_in(), Handshake::Accept);

        m.connect();
        m.connect();
        let _peer = peers.recv().await.unwrap();
        settle().await;
        m.connect();
        settle().await;

        assert_eq!(m.transport().opens(), 1);
        assert!(m.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn rooms_rejoined_and_listeners_kept_across_reconnect() {
        let (m, mut peers) = manager(signed_in(), Handshake::Accept);
        let hits = counter(&m, EventKind::NewMessage);
        let mut state = m.state();

        m.connect();
        let mut first = peers.recv().await.unwrap();
        assert_eq!(first.from_client.recv().await.unwrap(), JOIN_ALL);
        assert!(m.is_connected());

        first.to_client.send(message_frame("m-1")).unwrap();
        first
            .to_client
            .send(LinkEvent::Closed {
                reason: "network lost".into(),
            })
            .unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting { attempt: 1 })
            .await
            .unwrap();

        let mut second = peers.recv().await.unwrap();
        assert_eq!(second.from_client.recv().await.unwrap(), JOIN_ALL);
        second.to_client.send(message_frame("m-2")).unwrap();
        settle().await;

        // One join per handshake, nothing else queued behind it.
        assert!(first.from_client.try_recv().is_err());
        assert!(second.from_client.try_recv().is_err());

        assert!(m.is_connected());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(m.transport().opens(), 2);
    }

    #[test]
    fn connect_without_runtime_leaves_manager_usable() {
        let (m, mut peers) = manager(signed_in(), Handshake::Accept);

        m.connect();
        assert_eq!(m.current_state(), ConnectionState::Disconnected);
        assert_eq!(m.transport().opens(), 0);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            m.connect();
            let mut peer = peers.recv().await.unwrap();
            assert_eq!(peer.from_client.recv().await.unwrap(), JOIN_ALL);
            assert!(m.is_connected());
            m.disconnect();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let (m, mut peers) = manager(signed_in(), Handshake::Refuse);
        let mut state = m.state();

        m.connect();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();

        // Initial attempt plus five retries.
        assert_eq!(m.transport().opens(), 6);

        // A later connect() starts over.
        m.transport().set_handshake(Handshake::Accept);
        m.connect();
        let _peer = peers.recv().await.unwrap();
        assert_eq!(m.transport().opens(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_timeout_counts_as_failure() {
        let (m, _peers) = manager(signed_in(), Handshake::Hang);
        let mut state = m.state();

        m.connect();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting { attempt: 1 })
            .await
            .unwrap();

        assert_eq!(m.transport().opens(), 1);
        m.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_retries_and_clears_listeners() {
        let (m, _peers) = manager(signed_in(), Handshake::Refuse);
        counter(&m, EventKind::UserOnline);
        counter(&m, EventKind::UserOnline);
        let mut state = m.state();

        m.connect();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting { attempt: 1 })
            .await
            .unwrap();
        m.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(m.transport().opens(), 1);
        assert_eq!(m.current_state(), ConnectionState::Disconnected);
        assert_eq!(m.subscriber_count(EventKind::UserOnline), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_the_link() {
        let (m, mut peers) = manager(signed_in(), Handshake::Accept);

        m.connect();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), JOIN_ALL);

        m.disconnect();
        settle().await;

        assert!(peer.from_client.recv().await.is_none());
        assert!(!m.join_room("r-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn intents_only_sent_while_connected() {
        let (m, mut peers) = manager(signed_in(), Handshake::Accept);
        assert!(!m.join_room("r-0"));
        assert!(!m.start_typing("r-0"));

        m.connect();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.from_client.recv().await.unwrap(), JOIN_ALL);

        assert!(m.join_room("r-1"));
        assert!(m.start_typing("r-1"));
        assert!(m.stop_typing("r-1"));
        assert!(m.leave_room("r-1"));

        let mut sent = Vec::new();
        while let Ok(frame) = peer.from_client.try_recv() {
            sent.push(frame);
        }
        assert_eq!(
            sent,
            vec![
                r#"{"event":"join_room","data":{"roomId":"r-1"}}"#,
                r#"{"event":"typing_start","data":{"roomId":"r-1"}}"#,
                r#"{"event":"typing_stop","data":{"roomId":"r-1"}}"#,
                r#"{"event":"leave_room","data":{"roomId":"r-1"}}"#,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn intents_dropped_while_reconnecting() {
        let (m, mut peers) = manager(signed_in(), Handshake::Accept);
        let mut state = m.state();

        m.connect();
        let peer = peers.recv().await.unwrap();
        drop(peer.to_client);
        state
            .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
            .await
            .unwrap();

        assert!(!m.join_room("r-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn off_removes_one_or_all() {
        let (m, _peers) = manager(signed_in(), Handshake::Accept);
        let id = m.on(EventKind::RoomUpdated, |_: &ServerEvent| {});
        m.on(EventKind::RoomUpdated, |_: &ServerEvent| {});
        m.on(EventKind::RoomUpdated, |_: &ServerEvent| {});

        assert_eq!(m.off(EventKind::RoomUpdated, Some(id)), 1);
        assert_eq!(m.subscriber_count(EventKind::RoomUpdated), 2);
        assert_eq!(m.off(EventKind::RoomUpdated, None), 2);
        assert_eq!(m.subscriber_count(EventKind::RoomUpdated), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_credentials_stops_reconnecting() {
        let store = Arc::new(signed_in());
        let (peers_tx, mut peers) = mpsc::unbounded_channel();
        let transport = MockRealtime {
            handshake: Mutex::new(Handshake::Accept),
            opens: AtomicUsize::new(0),
            peers: peers_tx,
        };
        let config = RealtimeConfig::new(Url::parse("ws://realtime.test/socket").unwrap());
        let m = ConnectionManager::new(transport, config, store.clone());
        let mut state = m.state();

        m.connect();
        let peer = peers.recv().await.unwrap();
        store.clear();
        drop(peer);
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();

        assert_eq!(m.transport().opens(), 1);
    }
}
