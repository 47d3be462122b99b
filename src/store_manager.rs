//! StoreManager: top-level façade for one database.
//!
//! One instance per application database. It owns the repository, the
//! signal client, and every peer connection, and it is the only surface the
//! host application talks to:
//!
//! - `create_store` / `join_store` bring a document up (new or syncing),
//! - `dispatch` runs host commands through the reducer onto the replica,
//! - the event bus reports `Open`, `Close`, `Peer`, `PeerRemove`, `Change`
//!   and `Error`,
//! - `close` tears everything down in order.
//!
//! Peer adoption: the signal client reports introductions; for every shared
//! discovery key the manager dials the pipe endpoint, wraps the socket in a
//! [`Connection`], and records it under the peer id. A duplicate peer id
//! replaces the prior connection, closing the old one first.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::TransactionMut;

use crate::connection::{Connection, ManagerMsg};
use crate::document::{DocError, DocHandle, HandlerId, DEFAULT_HANDLER_CAP};
use crate::repository::{RepoError, Repository};
use crate::signal::client::{SignalClient, SignalEvent};

/// Signal servers tried when the host supplies none.
pub const DEFAULT_SIGNAL_URLS: &[&str] = &["ws://127.0.0.1:9090"];

/// StoreManager configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Name of this database; also the storage subdirectory.
    pub database_name: String,
    /// Signal servers, tried in order.
    pub signal_urls: Vec<String>,
    /// Where to persist; `None` runs fully in memory.
    pub storage_dir: Option<PathBuf>,
    /// Change-handler ceiling per document.
    pub handler_cap: usize,
    /// First reconnect delay after losing the signal server.
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling.
    pub max_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_name: "tandem".to_string(),
            signal_urls: DEFAULT_SIGNAL_URLS.iter().map(|s| s.to_string()).collect(),
            storage_dir: None,
            handler_cap: DEFAULT_HANDLER_CAP,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    pub fn named(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            ..Self::default()
        }
    }
}

/// A host command aimed at one document.
#[derive(Debug, Clone)]
pub struct Action {
    pub document_id: String,
    pub name: String,
    pub payload: Value,
}

/// A change function produced by the reducer; mutates the document in place.
pub type ChangeFn = Box<dyn FnOnce(&mut TransactionMut) + Send>;

/// The reducer's verdict on a command. An explicit variant rather than an
/// optional function: "not mine" is part of the contract.
pub enum Proposal {
    Handled(ChangeFn),
    NotHandled,
}

/// Translates host commands into document mutations.
pub trait Reducer: Send + Sync {
    fn reduce(&self, action: &Action) -> Proposal;
}

impl<F> Reducer for F
where
    F: Fn(&Action) -> Proposal + Send + Sync,
{
    fn reduce(&self, action: &Action) -> Proposal {
        self(action)
    }
}

/// What `dispatch` did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The reducer handled it and the document changed.
    Applied,
    /// The reducer handled it but the mutation was a no-op.
    NoOp,
    /// The reducer declined the command.
    NotHandled,
}

/// Events surfaced to the host application.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A document finished init and is ready.
    Open { document_id: String },
    /// The manager shut down.
    Close,
    /// A new peer attached to a document.
    Peer {
        peer_id: String,
        document_id: String,
    },
    /// A peer detached.
    PeerRemove {
        peer_id: String,
        document_id: String,
    },
    /// The document mutated, locally or remotely.
    Change { document_id: String },
    /// A recoverable failure (persistence loss, protocol violation).
    Error { message: String },
}

/// Host event callback.
pub type EventHandler = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Manager errors.
#[derive(Debug)]
pub enum ManagerError {
    UnknownDocument(String),
    Repository(RepoError),
    Document(DocError),
    Closed,
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownDocument(id) => write!(f, "unknown document: {id}"),
            Self::Repository(e) => write!(f, "repository error: {e}"),
            Self::Document(e) => write!(f, "document error: {e}"),
            Self::Closed => write!(f, "store manager is closed"),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<RepoError> for ManagerError {
    fn from(e: RepoError) -> Self {
        ManagerError::Repository(e)
    }
}

impl From<DocError> for ManagerError {
    fn from(e: DocError) -> Self {
        ManagerError::Document(e)
    }
}

/// Registry of host event handlers; snapshots before dispatch so handlers
/// may re-enter the bus.
struct EventBus {
    handlers: Mutex<HashMap<HandlerId, EventHandler>>,
    next_id: AtomicU64,
}

impl EventBus {
    fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn on(&self, handler: EventHandler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().insert(id, handler);
        id
    }

    fn off(&self, id: HandlerId) -> bool {
        self.handlers.lock().unwrap().remove(&id).is_some()
    }

    fn emit(&self, event: &StoreEvent) {
        let snapshot: Vec<EventHandler> =
            self.handlers.lock().unwrap().values().cloned().collect();
        for handler in snapshot {
            handler(event);
        }
    }
}

struct Shared {
    bus: EventBus,
    connections: Mutex<HashMap<(String, String), Connection>>,
    docs_by_key: Mutex<HashMap<String, String>>,
    closed: AtomicBool,
}

/// Top-level façade for one database.
pub struct StoreManager {
    config: StoreConfig,
    local_id: String,
    initial_state: Value,
    reducer: Arc<dyn Reducer>,
    repository: Arc<Repository>,
    shared: Arc<Shared>,
    signal: SignalClient,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    adoption_task: Mutex<Option<JoinHandle<()>>>,
}

impl StoreManager {
    /// Build the manager: opens the repository, starts the signal client,
    /// and spawns the internal event pump and peer-adoption tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: StoreConfig, initial_state: Value, reducer: Arc<dyn Reducer>) -> Self {
        let local_id = Uuid::new_v4().to_string();
        let repository = Arc::new(Repository::new(
            config.database_name.clone(),
            config.storage_dir.clone(),
            config.handler_cap,
        ));
        let shared = Arc::new(Shared {
            bus: EventBus::new(),
            connections: Mutex::new(HashMap::new()),
            docs_by_key: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Persistence failures and every document mutation surface as events.
        {
            let tx = events_tx.clone();
            repository.set_error_hook(Arc::new(move |error| {
                let _ = tx.send(ManagerMsg::Error {
                    message: error.to_string(),
                });
            }));
        }
        {
            let shared = shared.clone();
            repository.add_handler(Arc::new(move |document_id| {
                shared.bus.emit(&StoreEvent::Change {
                    document_id: document_id.to_string(),
                });
            }));
        }

        let (signal, signal_events) = SignalClient::start(
            local_id.clone(),
            config.signal_urls.clone(),
            config.initial_backoff,
            config.max_backoff,
        );

        let pump_task = tokio::spawn(pump(shared.clone(), events_rx));

        let adoption_task = tokio::spawn(adopt_peers(
            shared.clone(),
            repository.clone(),
            signal.clone(),
            signal_events,
            events_tx,
            Arc::new(AtomicU64::new(1)),
        ));

        log::info!(
            "store manager for database {} up (peer {local_id})",
            config.database_name
        );

        Self {
            config,
            local_id,
            initial_state,
            reducer,
            repository,
            shared,
            signal,
            pump_task: Mutex::new(Some(pump_task)),
            adoption_task: Mutex::new(Some(adoption_task)),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn database_name(&self) -> &str {
        &self.config.database_name
    }

    /// Create a fresh document seeded from the initial state and advertise
    /// interest in it.
    pub fn create_store(&self, document_id: &str) -> Result<DocHandle, ManagerError> {
        self.open_store(document_id, true)
    }

    /// Join an existing document: recover local state if any, otherwise
    /// start empty and wait for peers.
    pub fn join_store(&self, document_id: &str) -> Result<DocHandle, ManagerError> {
        self.open_store(document_id, false)
    }

    fn open_store(&self, document_id: &str, is_creating: bool) -> Result<DocHandle, ManagerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::Closed);
        }
        let handle = self
            .repository
            .init(document_id, &self.initial_state, is_creating)?;
        let key = self.repository.discovery_key(document_id)?;
        self.shared
            .docs_by_key
            .lock()
            .unwrap()
            .insert(key.clone(), document_id.to_string());
        self.signal.join(vec![key]);
        self.shared.bus.emit(&StoreEvent::Open {
            document_id: document_id.to_string(),
        });
        Ok(handle)
    }

    /// Run a host command through the reducer onto its document.
    pub fn dispatch(&self, action: &Action) -> Result<DispatchOutcome, ManagerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::Closed);
        }
        match self.reducer.reduce(action) {
            Proposal::NotHandled => Ok(DispatchOutcome::NotHandled),
            Proposal::Handled(change_fn) => {
                let handle = self
                    .repository
                    .get_document(&action.document_id)
                    .ok_or_else(|| ManagerError::UnknownDocument(action.document_id.clone()))?;
                match handle.update(change_fn)? {
                    Some(_) => Ok(DispatchOutcome::Applied),
                    None => Ok(DispatchOutcome::NoOp),
                }
            }
        }
    }

    /// Read access to an open document.
    pub fn get_document(&self, document_id: &str) -> Option<DocHandle> {
        self.repository.get_document(document_id)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Every document id this database has keys for.
    pub fn known_document_ids(&self) -> Vec<String> {
        self.repository.known_document_ids()
    }

    /// True once persistence has degraded to in-memory operation.
    pub fn is_degraded(&self) -> bool {
        self.repository.is_degraded()
    }

    pub fn on(&self, handler: EventHandler) -> HandlerId {
        self.shared.bus.on(handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.shared.bus.off(id)
    }

    /// Close all connections, the repository, and the signal client.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("store manager {} closing", self.config.database_name);
        self.signal.close();

        // The adoption task holds a repository reference; wait for it to be
        // gone before the repository releases the store.
        let adoption = self.adoption_task.lock().unwrap().take();
        if let Some(task) = adoption {
            task.abort();
            let _ = task.await;
        }

        let connections: Vec<Connection> = {
            let mut map = self.shared.connections.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for connection in connections {
            connection.close().await;
        }

        self.repository.close();

        let pump = self.pump_task.lock().unwrap().take();
        if let Some(task) = pump {
            task.abort();
            let _ = task.await;
        }
        self.shared.bus.emit(&StoreEvent::Close);
    }
}

/// Forward internal notifications to the host bus and prune dead
/// connections.
async fn pump(shared: Arc<Shared>, mut events_rx: mpsc::UnboundedReceiver<ManagerMsg>) {
    while let Some(message) = events_rx.recv().await {
        match message {
            ManagerMsg::Error { message } => {
                shared.bus.emit(&StoreEvent::Error { message });
            }
            ManagerMsg::ConnectionClosed {
                peer_id,
                document_id,
                conn_id,
                error,
            } => {
                if let Some(message) = error {
                    shared.bus.emit(&StoreEvent::Error { message });
                }
                // A replaced connection reports in late; only a connection
                // still in the table counts as a peer departure.
                let departed = {
                    let mut connections = shared.connections.lock().unwrap();
                    let key = (peer_id.clone(), document_id.clone());
                    match connections.get(&key) {
                        Some(current) if current.conn_id() == conn_id => {
                            connections.remove(&key);
                            true
                        }
                        _ => false,
                    }
                };
                if departed {
                    shared.bus.emit(&StoreEvent::PeerRemove {
                        peer_id,
                        document_id,
                    });
                }
            }
        }
    }
}

/// Consume signal-client events; dial and adopt every introduced peer.
async fn adopt_peers(
    shared: Arc<Shared>,
    repository: Arc<Repository>,
    signal: SignalClient,
    mut signal_events: mpsc::UnboundedReceiver<SignalEvent>,
    events_tx: mpsc::UnboundedSender<ManagerMsg>,
    next_conn_id: Arc<AtomicU64>,
) {
    while let Some(event) = signal_events.recv().await {
        match event {
            SignalEvent::Connected { url } => {
                log::info!("signal client connected to {url}");
            }
            SignalEvent::Disconnected => {
                log::warn!("signal connection lost; existing peers unaffected");
            }
            SignalEvent::Introduction { peer_id, keys } => {
                for key in keys {
                    let document_id = {
                        let docs = shared.docs_by_key.lock().unwrap();
                        docs.get(&key).cloned()
                    };
                    let document_id = match document_id {
                        Some(id) => id,
                        None => {
                            log::warn!("introduction for unknown key {key}");
                            continue;
                        }
                    };
                    let handle = match repository.get_document(&document_id) {
                        Some(handle) => handle,
                        None => continue,
                    };
                    let socket = match signal.open_peer_socket(&peer_id, &key).await {
                        Ok(socket) => socket,
                        Err(e) => {
                            log::warn!("dialing peer {peer_id} for {document_id} failed: {e}");
                            continue;
                        }
                    };
                    let conn_id = next_conn_id.fetch_add(1, Ordering::SeqCst);
                    let connection = Connection::spawn(
                        conn_id,
                        peer_id.clone(),
                        document_id.clone(),
                        handle,
                        socket,
                        events_tx.clone(),
                    );
                    let replaced = {
                        let mut connections = shared.connections.lock().unwrap();
                        connections.insert((peer_id.clone(), document_id.clone()), connection)
                    };
                    if let Some(old) = replaced {
                        log::info!("replacing existing connection for peer {peer_id}");
                        old.close().await;
                    }
                    shared.bus.emit(&StoreEvent::Peer {
                        peer_id: peer_id.clone(),
                        document_id,
                    });
                }
            }
        }
    }
}
