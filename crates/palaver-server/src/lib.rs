//! Palaver production server.
//!
//! Chat room coordination over TCP: sessions choose a display name, land in
//! the default room, and may create, join, and chat in named persistent
//! rooms. Messages are sequenced and durably stored before broadcast;
//! presence (rosters, join/leave notices) follows every membership change.
//!
//! # Architecture
//!
//! The [`ServerDriver`] is pure event-in, actions-out logic with no I/O of
//! its own; this crate wraps it with real transport and storage. [`Server`]
//! accepts TCP connections, decodes framed events, feeds them to the
//! dispatcher behind an async mutex, and executes the returned actions
//! against per-session outbound writers.
//!
//! # Components
//!
//! - [`ServerDriver`]: coordination core (sessions, rooms, messages, presence)
//! - [`Server`]: production runtime executing dispatcher actions
//! - [`TcpTransport`]: listener plus length-prefixed CBOR event framing
//! - [`SystemEnv`]: production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod message_store;
mod presence;
mod registry;
mod rooms;
mod server_error;
pub mod storage;
mod system_env;
mod transport;

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::BytesMut;
pub use driver::{DispatcherConfig, ServerAction, ServerDriver, SessionEvent};
pub use message_store::{HISTORY_LIMIT, MessageStore};
use palaver_core::{ServerEvent, env::Environment};
pub use presence::PresencePublisher;
pub use registry::ConnectionRegistry;
pub use rooms::{DEFAULT_ROOM, RoomError, RoomRegistry};
pub use server_error::ServerError;
pub use storage::{MemoryStorage, RedbStorage, Storage, StorageError};
pub use system_env::SystemEnv;
use tokio::{
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, Notify, RwLock},
};
pub use transport::TcpTransport;

/// Interval between deadline-check ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state for all connections.
///
/// All events to one client go through its single outbound writer, which
/// keeps per-session delivery ordered.
struct SharedState {
    /// Session ID → outbound write half
    writers: RwLock<HashMap<u64, Mutex<OwnedWriteHalf>>>,
    /// Session ID → close signal for the connection task
    closers: RwLock<HashMap<u64, Arc<Notify>>>,
}

impl SharedState {
    fn new() -> Self {
        Self { writers: RwLock::new(HashMap::new()), closers: RwLock::new(HashMap::new()) }
    }
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:3000")
    pub bind_address: String,
    /// Dispatcher configuration (deadlines, limits)
    pub driver: DispatcherConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0:3000".to_string(), driver: DispatcherConfig::default() }
    }
}

/// Production palaver server.
///
/// Wraps [`ServerDriver`] with TCP transport and the system environment.
pub struct Server<S: Storage> {
    /// The action-based dispatcher
    driver: ServerDriver<SystemEnv, S>,
    /// TCP listener
    transport: TcpTransport,
    /// Environment
    env: SystemEnv,
}

impl<S: Storage> Server<S> {
    /// Create and bind a new server.
    pub async fn bind(config: ServerRuntimeConfig, storage: S) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let driver = ServerDriver::new(env.clone(), storage, config.driver)?;
        let transport = TcpTransport::bind(&config.bind_address).await?;

        Ok(Self { driver, transport, env })
    }

    /// Run the server, accepting connections and processing events.
    ///
    /// Runs until the process is shut down or the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("server listening on {}", self.transport.local_addr()?);

        let env = self.env;
        let driver = Arc::new(Mutex::new(self.driver));
        let shared = Arc::new(SharedState::new());

        spawn_ticker(Arc::clone(&driver), Arc::clone(&shared), env.clone());

        loop {
            match self.transport.accept().await {
                Ok((stream, peer)) => {
                    let driver = Arc::clone(&driver);
                    let shared = Arc::clone(&shared);
                    let env = env.clone();

                    tokio::spawn(async move {
                        tracing::debug!(%peer, "connection accepted");
                        if let Err(e) = handle_connection(stream, driver, shared, env).await {
                            tracing::error!(%peer, error = %e, "connection error");
                        }
                    });
                },
                Err(e) => {
                    tracing::error!(error = %e, "accept error");
                },
            }
        }
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}

/// Periodic tick task driving the dispatcher's deadline checks.
fn spawn_ticker<S: Storage>(
    driver: Arc<Mutex<ServerDriver<SystemEnv, S>>>,
    shared: Arc<SharedState>,
    env: SystemEnv,
) {
    tokio::spawn(async move {
        loop {
            env.sleep(TICK_INTERVAL).await;

            let mut driver = driver.lock().await;
            match driver.process_event(SessionEvent::Tick) {
                Ok(actions) => {
                    if let Err(e) = execute_actions(&mut driver, actions, &shared).await {
                        tracing::warn!(error = %e, "tick actions failed");
                    }
                },
                Err(e) => tracing::warn!(error = %e, "tick processing failed"),
            }
        }
    });
}

/// Handle a single TCP connection.
async fn handle_connection<S: Storage>(
    stream: TcpStream,
    driver: Arc<Mutex<ServerDriver<SystemEnv, S>>>,
    shared: Arc<SharedState>,
    env: SystemEnv,
) -> Result<(), ServerError> {
    let session_id = env.random_u64();
    let (mut read_half, write_half) = stream.into_split();
    let close = Arc::new(Notify::new());

    shared.writers.write().await.insert(session_id, Mutex::new(write_half));
    shared.closers.write().await.insert(session_id, Arc::clone(&close));

    {
        let mut driver = driver.lock().await;
        let actions = driver.process_event(SessionEvent::Connected { session_id })?;
        execute_actions(&mut driver, actions, &shared).await?;
    }

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        tokio::select! {
            _ = close.notified() => break,
            result = transport::read_client_event(&mut read_half, &mut buf) => match result {
                Ok(Some(event)) => {
                    let mut driver = driver.lock().await;
                    match driver.process_event(SessionEvent::EventReceived { session_id, event }) {
                        Ok(actions) => execute_actions(&mut driver, actions, &shared).await?,
                        Err(e) => {
                            tracing::warn!(session_id, error = %e, "event processing failed");
                        },
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(session_id, error = %e, "read failed");
                    break;
                },
            },
        }
    }

    shared.writers.write().await.remove(&session_id);
    shared.closers.write().await.remove(&session_id);

    {
        let mut driver = driver.lock().await;
        let actions = driver.process_event(SessionEvent::Disconnected {
            session_id,
            reason: "connection closed".to_string(),
        })?;
        execute_actions(&mut driver, actions, &shared).await?;
    }

    Ok(())
}

/// Execute dispatcher actions against the live connections.
async fn execute_actions<S: Storage>(
    driver: &mut ServerDriver<SystemEnv, S>,
    actions: Vec<ServerAction>,
    shared: &SharedState,
) -> Result<(), ServerError> {
    for action in actions {
        match action {
            ServerAction::SendToSession { session_id, event } => {
                send_to(shared, session_id, &event).await;
            },

            ServerAction::BroadcastToRoom { room, event, exclude_session } => {
                let targets: Vec<u64> = driver
                    .sessions_in_room(&room)
                    .filter(|id| Some(*id) != exclude_session)
                    .collect();

                for session_id in targets {
                    send_to(shared, session_id, &event).await;
                }
            },

            ServerAction::BroadcastAll { event } => {
                let targets: Vec<u64> = shared.writers.read().await.keys().copied().collect();

                for session_id in targets {
                    send_to(shared, session_id, &event).await;
                }
            },

            ServerAction::CloseConnection { session_id, reason } => {
                tracing::info!(session_id, reason = %reason, "closing connection");
                if let Some(close) = shared.closers.read().await.get(&session_id) {
                    close.notify_one();
                }
            },
        }
    }

    Ok(())
}

/// Write one event to a session's outbound stream.
///
/// A missing or failing writer is logged, not propagated: the connection's
/// own task notices the broken socket and runs the disconnect path.
async fn send_to(shared: &SharedState, session_id: u64, event: &ServerEvent) {
    let writers = shared.writers.read().await;
    let Some(writer) = writers.get(&session_id) else {
        tracing::debug!(session_id, "send skipped, writer gone");
        return;
    };

    let mut writer = writer.lock().await;
    if let Err(e) = transport::write_server_event(&mut *writer, event).await {
        tracing::warn!(session_id, error = %e, "send failed");
    }
}
