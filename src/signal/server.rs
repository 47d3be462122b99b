//! The signal server: introduction matching and byte-stream pairing.
//!
//! Two WebSocket endpoints, routed by request path:
//!
//! ```text
//! /introduction/:localId
//!     C→S { "type": "Join", "join": [key, ...] }
//!     S→C { "type": "Introduction", "id": peer, "keys": [shared...] }
//!
//! /connection/:localId/:remoteId/:documentKey
//!     first socket parks; when the reciprocal request arrives the two are
//!     piped together byte-for-byte, and the server steps out of the way
//! ```
//!
//! The server holds no document state and never inspects piped payloads;
//! frames are forwarded verbatim, unreordered, unsplit. A parked socket
//! whose counterpart never shows up is closed after the pairing timeout.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{ClientMessage, ServerMessage};

/// Close code sent when a parked socket's counterpart never arrives.
pub const PAIRING_TIMEOUT_CLOSE_CODE: u16 = 4408;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long a lone connection request waits for its counterpart
    pub pairing_timeout: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            pairing_timeout: Duration::from_secs(60),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct SignalStats {
    pub introductions_sent: u64,
    pub pairs_piped: u64,
    pub pairing_timeouts: u64,
}

type ServerSocket = WebSocketStream<TcpStream>;

struct IntroPeer {
    interests: HashSet<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// Canonical identity of a reciprocal connection request pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey {
    low: String,
    high: String,
    key: String,
}

impl PairKey {
    fn new(a: &str, b: &str, key: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
            key: key.to_string(),
        }
    }
}

struct ServerState {
    pairing_timeout: Duration,
    intro_peers: Mutex<HashMap<String, IntroPeer>>,
    pending_pairs: Mutex<HashMap<PairKey, oneshot::Sender<ServerSocket>>>,
    stats: Mutex<SignalStats>,
}

/// The endpoint a request path addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Introduction { local_id: String },
    Connection {
        local_id: String,
        remote_id: String,
        key: String,
    },
}

fn parse_path(path: &str) -> Option<Route> {
    let mut parts = path.split('/').filter(|s| !s.is_empty());
    match parts.next()? {
        "introduction" => {
            let local_id = parts.next()?.to_string();
            match parts.next() {
                None => Some(Route::Introduction { local_id }),
                Some(_) => None,
            }
        }
        "connection" => {
            let local_id = parts.next()?.to_string();
            let remote_id = parts.next()?.to_string();
            let key = parts.next()?.to_string();
            match parts.next() {
                None => Some(Route::Connection {
                    local_id,
                    remote_id,
                    key,
                }),
                Some(_) => None,
            }
        }
        _ => None,
    }
}

/// A running server bound for tests and embedders: knows its address and
/// stops when dropped.
pub struct SignalServerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SignalServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `ws://` URL clients can dial.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for SignalServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The rendezvous broker.
pub struct SignalServer {
    config: SignalConfig,
    state: Arc<ServerState>,
}

impl SignalServer {
    pub fn new(config: SignalConfig) -> Self {
        let state = Arc::new(ServerState {
            pairing_timeout: config.pairing_timeout,
            intro_peers: Mutex::new(HashMap::new()),
            pending_pairs: Mutex::new(HashMap::new()),
            stats: Mutex::new(SignalStats::default()),
        });
        Self { config, state }
    }

    pub fn with_defaults() -> Self {
        Self::new(SignalConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> SignalStats {
        self.state.stats.lock().await.clone()
    }

    /// Bind and serve forever on the configured address.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("signal server listening on {}", self.config.bind_addr);
        Self::serve(listener, self.state.clone()).await
    }

    /// Bind (port 0 friendly) and serve in a background task.
    pub async fn bind(config: SignalConfig) -> std::io::Result<SignalServerHandle> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let server = SignalServer::new(config);
        let state = server.state.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = Self::serve(listener, state).await {
                log::error!("signal server stopped: {e}");
            }
        });
        log::info!("signal server listening on {addr}");
        Ok(SignalServerHandle { addr, task })
    }

    async fn serve(listener: TcpListener, state: Arc<ServerState>) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("signal: new TCP connection from {addr}");
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, addr).await {
                    log::debug!("signal: connection from {addr} ended: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    state: Arc<ServerState>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        Ok(resp)
    })
    .await?;

    match parse_path(&path) {
        Some(Route::Introduction { local_id }) => {
            introduction_session(state, local_id, ws).await;
        }
        Some(Route::Connection {
            local_id,
            remote_id,
            key,
        }) => {
            connection_session(state, local_id, remote_id, key, ws).await;
        }
        None => {
            log::warn!("signal: {addr} requested unknown path {path}");
            let mut ws = ws;
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::Unsupported,
                    reason: "unknown endpoint".into(),
                }))
                .await;
        }
    }
    Ok(())
}

/// One introduction socket: track interests, match against every other
/// in-flight peer, and push Introduction messages both ways.
async fn introduction_session(state: Arc<ServerState>, local_id: String, ws: ServerSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut peers = state.intro_peers.lock().await;
        peers.insert(
            local_id.clone(),
            IntroPeer {
                interests: HashSet::new(),
                tx,
            },
        );
    }
    log::info!("signal: peer {local_id} joined introduction");

    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            Some(message) = rx.recv() => {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("signal: encoding introduction failed: {e}");
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match ClientMessage::decode(&text) {
                            Ok(ClientMessage::Join { join }) => {
                                handle_join(&state, &local_id, join).await;
                            }
                            Err(e) => {
                                log::warn!("signal: bad message from {local_id}: {e}");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("signal: introduction socket error for {local_id}: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.intro_peers.lock().await.remove(&local_id);
    log::info!("signal: peer {local_id} left introduction");
}

/// Record new interests and introduce both sides of every fresh overlap.
async fn handle_join(state: &ServerState, local_id: &str, join: Vec<String>) {
    let mut peers = state.intro_peers.lock().await;

    let (me_tx, new_keys) = {
        let me = match peers.get_mut(local_id) {
            Some(me) => me,
            None => return,
        };
        let mut fresh = Vec::new();
        for key in join {
            if me.interests.insert(key.clone()) {
                fresh.push(key);
            }
        }
        (me.tx.clone(), fresh)
    };
    if new_keys.is_empty() {
        return;
    }

    let mut sent = 0u64;
    for (other_id, other) in peers.iter() {
        if other_id == local_id {
            continue;
        }
        let shared: Vec<String> = new_keys
            .iter()
            .filter(|key| other.interests.contains(*key))
            .cloned()
            .collect();
        if shared.is_empty() {
            continue;
        }
        log::info!(
            "signal: introducing {local_id} and {other_id} ({} shared key(s))",
            shared.len()
        );
        let _ = other.tx.send(ServerMessage::Introduction {
            id: local_id.to_string(),
            keys: shared.clone(),
        });
        let _ = me_tx.send(ServerMessage::Introduction {
            id: other_id.clone(),
            keys: shared,
        });
        sent += 2;
    }
    if sent > 0 {
        state.stats.lock().await.introductions_sent += sent;
    }
}

/// One side of a connection request: park, or pick up the parked
/// counterpart and pipe the two sockets together.
async fn connection_session(
    state: Arc<ServerState>,
    local_id: String,
    remote_id: String,
    key: String,
    ws: ServerSocket,
) {
    let pair_key = PairKey::new(&local_id, &remote_id, &key);

    let parked = {
        let mut pending = state.pending_pairs.lock().await;
        match pending.remove(&pair_key) {
            Some(counterpart) => Err(counterpart),
            None => {
                let (tx, rx) = oneshot::channel();
                pending.insert(pair_key.clone(), tx);
                Ok(rx)
            }
        }
    };

    match parked {
        // Counterpart already waiting: hand our socket over; it pipes both.
        Err(counterpart) => {
            if let Err(ws) = counterpart.send(ws) {
                log::debug!("signal: counterpart for {pair_key:?} vanished during handoff");
                let mut ws = ws;
                let _ = ws.close(None).await;
            }
        }
        // We arrived first: wait for the counterpart, then pipe.
        Ok(rx) => match tokio::time::timeout(state.pairing_timeout, rx).await {
            Ok(Ok(other)) => {
                log::info!(
                    "signal: piping {local_id} ↔ {remote_id} for key {}…",
                    &key[..key.len().min(8)]
                );
                state.stats.lock().await.pairs_piped += 1;
                pipe(ws, other).await;
            }
            _ => {
                state.pending_pairs.lock().await.remove(&pair_key);
                state.stats.lock().await.pairing_timeouts += 1;
                log::warn!("signal: pairing timeout for {local_id} → {remote_id}");
                let mut ws = ws;
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Library(PAIRING_TIMEOUT_CLOSE_CODE),
                        reason: "pairing timeout".into(),
                    }))
                    .await;
            }
        },
    }
}

/// Forward frames verbatim in both directions until either side closes.
async fn pipe(a: ServerSocket, b: ServerSocket) {
    let (mut a_tx, mut a_rx) = a.split();
    let (mut b_tx, mut b_rx) = b.split();

    let a_to_b = async {
        while let Some(frame) = a_rx.next().await {
            match frame {
                Ok(msg) if msg.is_text() || msg.is_binary() => {
                    if b_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = b_tx.close().await;
    };
    let b_to_a = async {
        while let Some(frame) = b_rx.next().await {
            match frame {
                Ok(msg) if msg.is_text() || msg.is_binary() => {
                    if a_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(WsMessage::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = a_tx.close().await;
    };
    tokio::join!(a_to_b, b_to_a);
    log::debug!("signal: pipe closed");
}
