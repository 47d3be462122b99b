//! Signal client: keeps the introduction socket alive and dials peers.
//!
//! The background task cycles through the configured server URLs, joins
//! with every key advertised so far, and emits [`SignalEvent`]s to the
//! store manager. Losing the signaling connection never touches existing
//! peer pipes; the task reconnects with exponential backoff and re-joins,
//! so dropped introductions are replayed by the server.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::connection::PeerSocket;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Events surfaced to the store manager.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// Introduction socket is up on this server.
    Connected { url: String },
    /// A peer shares interest in these discovery keys.
    Introduction { peer_id: String, keys: Vec<String> },
    /// Introduction socket lost; reconnecting with backoff.
    Disconnected,
}

/// Signal client errors.
#[derive(Debug)]
pub enum SignalError {
    /// No introduction socket is currently up.
    NotConnected,
    /// Dialing a peer or server failed.
    Connect(String),
    /// Malformed signaling traffic.
    Protocol(ProtocolError),
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected to a signal server"),
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for SignalError {}

impl From<ProtocolError> for SignalError {
    fn from(e: ProtocolError) -> Self {
        SignalError::Protocol(e)
    }
}

enum Command {
    Join(Vec<String>),
}

/// Handle to the signaling task. Cheap to clone.
#[derive(Clone)]
pub struct SignalClient {
    local_id: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    active_url: Arc<Mutex<Option<String>>>,
    task: Arc<JoinHandle<()>>,
}

impl SignalClient {
    /// Spawn the signaling task; returns the client handle and the event
    /// stream the store manager consumes.
    pub fn start(
        local_id: String,
        urls: Vec<String>,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let active_url = Arc::new(Mutex::new(None));

        let task = tokio::spawn(run(
            local_id.clone(),
            urls,
            initial_backoff,
            max_backoff,
            cmd_rx,
            event_tx,
            active_url.clone(),
        ));

        (
            Self {
                local_id,
                cmd_tx,
                active_url,
                task: Arc::new(task),
            },
            event_rx,
        )
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_connected(&self) -> bool {
        self.active_url.lock().unwrap().is_some()
    }

    /// Advertise interest in more discovery keys. Buffered until the
    /// introduction socket is up.
    pub fn join(&self, keys: Vec<String>) {
        let _ = self.cmd_tx.send(Command::Join(keys));
    }

    /// Dial the pipe endpoint for an introduced peer.
    pub async fn open_peer_socket(
        &self,
        remote_id: &str,
        key: &str,
    ) -> Result<PeerSocket, SignalError> {
        let url = self
            .active_url
            .lock()
            .unwrap()
            .clone()
            .ok_or(SignalError::NotConnected)?;
        let endpoint = format!("{url}/connection/{}/{remote_id}/{key}", self.local_id);
        let (socket, _) = connect_async(&endpoint)
            .await
            .map_err(|e| SignalError::Connect(e.to_string()))?;
        Ok(socket)
    }

    /// Stop the signaling task. Existing peer sockets are unaffected.
    pub fn close(&self) {
        self.task.abort();
        *self.active_url.lock().unwrap() = None;
    }
}

async fn run(
    local_id: String,
    urls: Vec<String>,
    initial_backoff: Duration,
    max_backoff: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<SignalEvent>,
    active_url: Arc<Mutex<Option<String>>>,
) {
    let mut joined: HashSet<String> = HashSet::new();
    let mut backoff = initial_backoff;

    loop {
        // Try each configured server in order.
        let mut session = None;
        for url in &urls {
            let endpoint = format!("{url}/introduction/{local_id}");
            match connect_async(&endpoint).await {
                Ok((socket, _)) => {
                    session = Some((url.clone(), socket));
                    break;
                }
                Err(e) => log::debug!("signal client: {url} unreachable: {e}"),
            }
        }
        let (url, socket) = match session {
            Some(session) => session,
            None => {
                log::warn!(
                    "signal client: no server reachable, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };

        *active_url.lock().unwrap() = Some(url.clone());
        let _ = event_tx.send(SignalEvent::Connected { url: url.clone() });
        backoff = initial_backoff;

        let (mut ws_tx, mut ws_rx) = socket.split();

        // Re-advertise everything joined so far.
        if !joined.is_empty() {
            let rejoin = ClientMessage::Join {
                join: joined.iter().cloned().collect(),
            };
            if send_message(&mut ws_tx, &rejoin).await.is_err() {
                disconnect(&active_url, &event_tx);
                continue;
            }
        }

        loop {
            tokio::select! {
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::Join(keys)) => {
                            let fresh: Vec<String> = keys
                                .into_iter()
                                .filter(|key| joined.insert(key.clone()))
                                .collect();
                            if fresh.is_empty() {
                                continue;
                            }
                            let message = ClientMessage::Join { join: fresh };
                            if send_message(&mut ws_tx, &message).await.is_err() {
                                break;
                            }
                        }
                        None => return, // client handle dropped
                    }
                }
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match ServerMessage::decode(&text) {
                                Ok(ServerMessage::Introduction { id, keys }) => {
                                    log::info!(
                                        "signal client: introduced to {id} ({} key(s))",
                                        keys.len()
                                    );
                                    let _ = event_tx.send(SignalEvent::Introduction {
                                        peer_id: id,
                                        keys,
                                    });
                                }
                                Err(e) => {
                                    log::warn!("signal client: bad server message: {e}");
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("signal client: socket error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        disconnect(&active_url, &event_tx);
        log::warn!("signal client: connection lost, reconnecting in {backoff:?}");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

fn disconnect(
    active_url: &Arc<Mutex<Option<String>>>,
    event_tx: &mpsc::UnboundedSender<SignalEvent>,
) {
    *active_url.lock().unwrap() = None;
    let _ = event_tx.send(SignalEvent::Disconnected);
}

async fn send_message<S>(sink: &mut S, message: &ClientMessage) -> Result<(), ()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let text = match message.encode() {
        Ok(text) => text,
        Err(e) => {
            log::error!("signal client: encoding failed: {e}");
            return Err(());
        }
    };
    sink.send(WsMessage::Text(text)).await.map_err(|_| ())
}
