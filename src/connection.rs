//! One peer pairing: a DocumentSync, a piped WebSocket, and the task that
//! bridges them.
//!
//! The spawned task owns both halves of the pairing and serializes all sync
//! work for this peer:
//! - outbound sync messages drain from the state machine's channel into the
//!   socket as JSON text frames,
//! - inbound frames decode and feed [`DocumentSync::receive`],
//! - document change wakeups (from the observable wrapper's hook) trigger
//!   [`DocumentSync::doc_changed`],
//! - a shutdown signal or socket loss ends the task.
//!
//! Socket and sync machine close together; the document handler is always
//! unregistered on the way out, and the manager hears about the departure
//! exactly once.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::document::DocHandle;
use crate::protocol::SyncMessage;
use crate::sync::{DocumentSync, SyncError};

/// A peer socket as handed out by the signal client.
pub type PeerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection-to-manager notifications.
#[derive(Debug)]
pub(crate) enum ManagerMsg {
    /// The connection ended; `error` carries a fatal sync violation, if any.
    ConnectionClosed {
        peer_id: String,
        document_id: String,
        conn_id: u64,
        error: Option<String>,
    },
    /// A failure worth surfacing that is not tied to one connection.
    Error { message: String },
}

/// An open pairing with one remote peer for one document.
pub struct Connection {
    peer_id: String,
    document_id: String,
    conn_id: u64,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn spawn(
        conn_id: u64,
        peer_id: String,
        document_id: String,
        doc: DocHandle,
        socket: PeerSocket,
        manager: mpsc::UnboundedSender<ManagerMsg>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(
            conn_id,
            peer_id.clone(),
            document_id.clone(),
            doc,
            socket,
            manager,
            shutdown_rx,
        ));
        Self {
            peer_id,
            document_id,
            conn_id,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub(crate) fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn run(
    conn_id: u64,
    peer_id: String,
    document_id: String,
    doc: DocHandle,
    socket: PeerSocket,
    manager: mpsc::UnboundedSender<ManagerMsg>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();

    let mut sync = DocumentSync::new(doc.clone(), peer_id.clone(), outbox_tx);

    let handler_id = doc.register_handler(Arc::new(move |_document_id| {
        let _ = wake_tx.send(());
    }));

    let mut fatal: Option<String> = None;
    match handler_id {
        Ok(_) => {
            if let Err(e) = sync.open() {
                fatal = Some(e.to_string());
            }
        }
        Err(ref e) => fatal = Some(e.to_string()),
    }

    while fatal.is_none() {
        tokio::select! {
            _ = &mut shutdown => {
                log::debug!("connection {peer_id}/{document_id}: shutdown requested");
                break;
            }
            Some(message) = outbox_rx.recv() => {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        fatal = Some(e.to_string());
                        break;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(text)).await {
                    log::debug!("connection {peer_id}/{document_id}: socket write failed: {e}");
                    break;
                }
            }
            Some(()) = wake_rx.recv() => {
                if let Err(e) = sync.doc_changed() {
                    fatal = Some(handle_sync_error(&peer_id, &document_id, &e));
                    break;
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match SyncMessage::decode(&text) {
                            Ok(message) => {
                                if let Err(e) = sync.receive(message) {
                                    fatal = Some(handle_sync_error(&peer_id, &document_id, &e));
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!(
                                    "connection {peer_id}/{document_id}: undecodable frame: {e}"
                                );
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("connection {peer_id}/{document_id}: peer socket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("connection {peer_id}/{document_id}: socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    sync.close();
    if let Ok(id) = handler_id {
        doc.unregister_handler(id);
    }
    let _ = ws_tx.close().await;
    let _ = manager.send(ManagerMsg::ConnectionClosed {
        peer_id,
        document_id,
        conn_id,
        error: fatal,
    });
}

fn handle_sync_error(peer_id: &str, document_id: &str, error: &SyncError) -> String {
    match error {
        SyncError::NoClock | SyncError::OldClock { .. } => {
            log::error!("connection {peer_id}/{document_id}: clock violation, closing: {error}");
        }
        other => {
            log::error!("connection {peer_id}/{document_id}: sync failed, closing: {other}");
        }
    }
    error.to_string()
}
