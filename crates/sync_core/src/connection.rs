use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{interval, sleep},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use shared::{
    domain::{TabId, WorkspaceId},
    error::ApiError,
    protocol::{ClientAction, Envelope, EventKind, TabMessage},
};

use crate::{config::Settings, credentials::CredentialStore, SignOutHandler};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("endpoint base must start with http:// or https://: {0}")]
    InvalidEndpoint(String),
    #[error("invalid websocket url: {0}")]
    Url(#[from] url::ParseError),
}

/// Cross-tab leadership bus: a publish/subscribe channel shared by every
/// tab in one browser profile, carrying the single "this tab is now the
/// active leader" message shape.
#[derive(Clone)]
pub struct LeaderBus {
    tx: broadcast::Sender<TabMessage>,
}

impl LeaderBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn announce(&self, tab_id: TabId) {
        let _ = self.tx.send(TabMessage::LeaderClaimed { tab_id });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabMessage> {
        self.tx.subscribe()
    }
}

impl Default for LeaderBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No socket, not leader.
    Idle,
    /// Another tab is leader; this tab holds no socket.
    Follower,
    /// Leadership claimed, socket opening.
    Connecting,
    /// Socket established, heartbeat active.
    Open,
    /// Socket lost while still leader; one retry pending.
    Reconnecting,
}

impl ConnectionPhase {
    pub fn is_leader(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Connecting | ConnectionPhase::Open | ConnectionPhase::Reconnecting
        )
    }
}

/// The seam the reconciliation engine consumes: envelope fan-out plus typed
/// outbound actions.
#[async_trait]
pub trait LiveGateway: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
    async fn send(&self, action: ClientAction);
}

/// Owns at most one live websocket per browser profile, elected among
/// competing tabs over the [`LeaderBus`]. Election is optimistic: a brief
/// window where two tabs both hold a socket after a handoff is tolerated,
/// since channel membership is idempotent server-side and timelines
/// reconcile by message id.
pub struct ConnectionManager {
    tab_id: TabId,
    settings: Settings,
    credentials: Arc<CredentialStore>,
    bus: LeaderBus,
    events: broadcast::Sender<Envelope>,
    on_sign_out: SignOutHandler,
    inner: Mutex<ManagerState>,
}

struct ManagerState {
    phase: ConnectionPhase,
    workspace: Option<WorkspaceId>,
    /// Socket generation; bumped on every teardown so completions from a
    /// superseded connect attempt or timer are discarded.
    generation: u64,
    writer: Option<mpsc::UnboundedSender<Message>>,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(
        settings: Settings,
        credentials: Arc<CredentialStore>,
        bus: LeaderBus,
        on_sign_out: SignOutHandler,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let manager = Arc::new(Self {
            tab_id: TabId::random(),
            settings,
            credentials,
            bus,
            events,
            on_sign_out,
            inner: Mutex::new(ManagerState {
                phase: ConnectionPhase::Idle,
                workspace: None,
                generation: 0,
                writer: None,
                connect_task: None,
                reader_task: None,
                heartbeat_task: None,
                reconnect_task: None,
            }),
        });
        manager.spawn_bus_listener();
        manager
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.inner.lock().await.phase
    }

    /// Tab became visible/focused: claim leadership and open the socket.
    /// Keeps an already-live connection when the identity is unchanged.
    pub async fn activate(self: &Arc<Self>, workspace: WorkspaceId) {
        self.bus.announce(self.tab_id);
        let mut state = self.inner.lock().await;
        if state.phase.is_leader() && state.workspace == Some(workspace) {
            return;
        }
        state.workspace = Some(workspace);
        self.open_locked(&mut state).await;
    }

    /// Tab became hidden: close the socket. Leadership is re-claimed on the
    /// next visibility transition.
    pub async fn deactivate(&self) {
        let mut state = self.inner.lock().await;
        self.teardown_socket_locked(&mut state);
        state.phase = ConnectionPhase::Idle;
        debug!(tab_id = %self.tab_id.0, "connection: tab hidden; socket closed");
    }

    /// Explicit teardown (logout or identity invalidation): closes the
    /// socket, cancels all timers and discards leadership. The leadership
    /// bus subscription itself lives until the manager is dropped.
    pub async fn shutdown(&self) {
        let mut state = self.inner.lock().await;
        self.teardown_socket_locked(&mut state);
        state.workspace = None;
        state.phase = ConnectionPhase::Idle;
        info!(tab_id = %self.tab_id.0, "connection: shut down");
    }

    /// Serializes `action` and writes it to the socket if one is open;
    /// otherwise the action is dropped silently. Nothing is queued for
    /// later delivery.
    pub async fn send(&self, action: ClientAction) {
        let state = self.inner.lock().await;
        if state.phase != ConnectionPhase::Open {
            debug!(?action, "connection: dropping outbound action; socket not open");
            return;
        }
        let Some(writer) = state.writer.as_ref() else {
            return;
        };
        match serde_json::to_string(&action) {
            Ok(frame) => {
                let _ = writer.send(Message::Text(frame));
            }
            Err(err) => warn!("connection: failed to serialize outbound action: {err}"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    fn spawn_bus_listener(self: &Arc<Self>) {
        let mut claims = self.bus.subscribe();
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match claims.recv().await {
                    Ok(TabMessage::LeaderClaimed { tab_id }) => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        if tab_id != manager.tab_id {
                            manager.yield_leadership().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Another tab announced itself leader: drop the socket immediately.
    async fn yield_leadership(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        if !state.phase.is_leader() {
            return;
        }
        self.teardown_socket_locked(&mut state);
        state.phase = ConnectionPhase::Follower;
        info!(tab_id = %self.tab_id.0, "connection: another tab claimed leadership; following");
    }

    /// Opens a socket under the current identity. Requires the inner lock;
    /// tears down whatever socket state precedes it.
    fn open_locked<'a>(
        self: &'a Arc<Self>,
        state: &'a mut ManagerState,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            self.teardown_socket_locked(state);

            let Some(workspace) = state.workspace else {
                state.phase = ConnectionPhase::Idle;
                return;
            };
            let Some(token) = self.credentials.access_token().await else {
                debug!("connection: no access token; staying idle");
                state.phase = ConnectionPhase::Idle;
                return;
            };
            let url = match self.socket_url(&token, workspace) {
                Ok(url) => url,
                Err(err) => {
                    warn!("connection: {err}");
                    state.phase = ConnectionPhase::Idle;
                    return;
                }
            };

            state.generation += 1;
            let generation = state.generation;
            state.phase = ConnectionPhase::Connecting;

            let manager = Arc::clone(self);
            state.connect_task = Some(tokio::spawn(async move {
                match connect_async(url.as_str()).await {
                    Ok((socket, _)) => manager.install_socket(generation, socket).await,
                    Err(err) => {
                        warn!("connection: websocket connect failed: {err}");
                        manager.handle_socket_down(generation).await;
                    }
                }
            }));
        })
    }

    fn install_socket<'a>(
        self: &'a Arc<Self>,
        generation: u64,
        socket: Socket,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let (mut sink, mut reader) = socket.split();
        let mut state = self.inner.lock().await;
        if state.generation != generation || state.phase != ConnectionPhase::Connecting {
            // A handoff or teardown superseded this attempt; dropping the
            // stream closes it.
            return;
        }

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let manager = Arc::clone(self);
        state.reader_task = Some(tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => manager.dispatch_frame(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("connection: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            manager.handle_socket_down(generation).await;
        }));

        let heartbeat_writer = writer_tx.clone();
        let heartbeat_interval = self.settings.heartbeat_interval();
        state.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(frame) = serde_json::to_string(&ClientAction::Ping) else {
                    continue;
                };
                if heartbeat_writer.send(Message::Text(frame)).is_err() {
                    break;
                }
            }
        }));

        state.writer = Some(writer_tx);
        state.phase = ConnectionPhase::Open;
        info!(tab_id = %self.tab_id.0, "connection: websocket open");
        })
    }

    /// Socket closed or errored. Stops the heartbeat and schedules exactly
    /// one reconnect; a second close while one is pending schedules
    /// nothing.
    fn handle_socket_down<'a>(
        self: &'a Arc<Self>,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            if !matches!(
                state.phase,
                ConnectionPhase::Connecting | ConnectionPhase::Open
            ) {
                return;
            }

            if let Some(task) = state.heartbeat_task.take() {
                task.abort();
            }
            state.writer = None;

            if state.reconnect_task.is_none() {
                let delay = self.settings.reconnect_delay();
                let manager = Arc::clone(self);
                state.reconnect_task = Some(tokio::spawn(async move {
                    sleep(delay).await;
                    manager.reconnect(generation).await;
                }));
            }
            state.phase = ConnectionPhase::Reconnecting;
            info!(tab_id = %self.tab_id.0, "connection: socket down; reconnect scheduled");
        })
    }

    fn reconnect<'a>(
        self: &'a Arc<Self>,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            state.reconnect_task = None;
            if state.generation != generation || state.phase != ConnectionPhase::Reconnecting {
                return;
            }
            self.open_locked(&mut state).await;
        })
    }

    fn teardown_socket_locked(&self, state: &mut ManagerState) {
        if let Some(task) = state.connect_task.take() {
            task.abort();
        }
        if let Some(task) = state.reader_task.take() {
            task.abort();
        }
        if let Some(task) = state.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        // Dropping the writer closes its channel; the writer task then
        // closes the sink.
        state.writer = None;
        state.generation += 1;
    }

    /// Parses the outer envelope only; payload validation belongs to
    /// listeners. Malformed frames are dropped one at a time. An `error`
    /// envelope carrying the unauthorized code routes to the
    /// unauthenticated entry point independent of any listener.
    fn dispatch_frame(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("connection: dropping malformed frame: {err}");
                return;
            }
        };

        if envelope.kind == EventKind::Error {
            if let Ok(error) = serde_json::from_value::<ApiError>(envelope.payload.clone()) {
                if error.is_unauthorized() {
                    warn!("connection: server reported unauthorized; signing out");
                    (self.on_sign_out)();
                }
            }
        }

        let _ = self.events.send(envelope);
    }

    /// The transport cannot carry custom headers at connect time, so the
    /// bearer token and workspace scope ride as query parameters.
    fn socket_url(&self, token: &str, workspace: WorkspaceId) -> Result<Url, ConnectError> {
        let base = self.settings.endpoint_base.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ConnectError::InvalidEndpoint(base.to_string()));
        };
        let mut url = Url::parse(&format!("{ws_base}/ws"))?;
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("workspace", &workspace.0.to_string());
        Ok(url)
    }
}

#[async_trait]
impl LiveGateway for ConnectionManager {
    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        ConnectionManager::subscribe(self)
    }

    async fn send(&self, action: ClientAction) {
        ConnectionManager::send(self, action).await;
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
