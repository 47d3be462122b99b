//! Per-peer, per-document sync state machine.
//!
//! One [`DocumentSync`] keeps one local document in step with one remote
//! replica over any FIFO message transport. The transport hands us an
//! outbound channel at construction and feeds inbound messages to
//! [`DocumentSync::receive`]; the owning connection invokes
//! [`DocumentSync::doc_changed`] whenever the document's change hook fires.
//!
//! Two clocks drive everything:
//! - `ours` — the highest clock we have advertised to this peer; only grows.
//! - `theirs` — the highest clock we have learned the peer holds; unknown
//!   until the first message arrives, and until then we never push.
//!
//! Convergence argument: a local change is by definition absent from
//! `theirs`, so the next push includes it; an applied remote change advances
//! `theirs` past itself, so it is never echoed back; a bare-clock pull
//! always elicits a push or silence. After a quiescent period with no edits
//! no further messages are generated.

use tokio::sync::mpsc;

use crate::clock::{less_or_equal, merge, VectorClock};
use crate::document::{DocError, DocHandle};
use crate::protocol::SyncMessage;

/// Errors raised by the sync state machine.
#[derive(Debug)]
pub enum SyncError {
    /// The document has no clock: it is not a live CRDT replica.
    NoClock,
    /// The document's clock regressed below what we already advertised.
    OldClock {
        advertised: VectorClock,
        current: VectorClock,
    },
    /// The document wrapper failed to apply or extract changes.
    Document(DocError),
    /// The outbound channel is gone; the connection is shutting down.
    ChannelClosed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoClock => write!(f, "document has no clock"),
            Self::OldClock {
                advertised,
                current,
            } => write!(
                f,
                "document clock regressed: advertised {advertised:?}, now {current:?}"
            ),
            Self::Document(e) => write!(f, "document error: {e}"),
            Self::ChannelClosed => write!(f, "outbound channel closed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<DocError> for SyncError {
    fn from(e: DocError) -> Self {
        SyncError::Document(e)
    }
}

/// Keeps one document in sync with one peer.
pub struct DocumentSync {
    doc: DocHandle,
    peer_id: String,
    ours: VectorClock,
    theirs: Option<VectorClock>,
    outbox: mpsc::UnboundedSender<SyncMessage>,
}

impl DocumentSync {
    pub fn new(
        doc: DocHandle,
        peer_id: impl Into<String>,
        outbox: mpsc::UnboundedSender<SyncMessage>,
    ) -> Self {
        Self {
            doc,
            peer_id: peer_id.into(),
            ours: VectorClock::new(),
            theirs: None,
            outbox,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The clock we last advertised to this peer. Monotone.
    pub fn ours(&self) -> &VectorClock {
        &self.ours
    }

    /// The clock we last learned the peer holds, if any message arrived yet.
    pub fn theirs(&self) -> Option<&VectorClock> {
        self.theirs.as_ref()
    }

    /// Announce ourselves: send an initial pull carrying our current clock.
    pub fn open(&mut self) -> Result<(), SyncError> {
        let clock = self.validate()?;
        log::debug!(
            "sync open: doc {} peer {} clock {:?}",
            self.doc.document_id(),
            self.peer_id,
            clock
        );
        self.send(SyncMessage::pull(clock.clone()))?;
        self.ours = merge(&self.ours, &clock);
        Ok(())
    }

    /// Release per-peer state. No message is sent; the owning connection
    /// unregisters the document handler.
    pub fn close(&mut self) {
        log::debug!(
            "sync close: doc {} peer {}",
            self.doc.document_id(),
            self.peer_id
        );
        self.theirs = None;
    }

    /// Handle one inbound message and return the clock afterwards.
    ///
    /// A message with changes advances the replica (idempotently); one
    /// without is a pull and answered from `maybe_send_changes`. The
    /// follow-up pull after an apply happens via the change hook, not here.
    pub fn receive(&mut self, message: SyncMessage) -> Result<VectorClock, SyncError> {
        let known = self.theirs.take().unwrap_or_default();
        self.theirs = Some(merge(&known, &message.clock));

        match message.changes {
            Some(changes) => {
                if !changes.is_empty() {
                    self.doc.apply_changes(&changes)?;
                }
            }
            None => self.maybe_send_changes()?,
        }
        self.doc.clock().ok_or(SyncError::NoClock)
    }

    /// Invoked after every mutation of the document, local or remote.
    pub fn doc_changed(&mut self) -> Result<(), SyncError> {
        let clock = self.validate()?;
        self.maybe_send_changes()?;
        self.maybe_request_changes(&clock)?;
        self.ours = merge(&self.ours, &clock);
        Ok(())
    }

    /// Push everything the peer lacks, if we know what it holds.
    fn maybe_send_changes(&mut self) -> Result<(), SyncError> {
        let theirs = match &self.theirs {
            Some(theirs) => theirs.clone(),
            None => return Ok(()),
        };
        let changes = self.doc.missing_changes(&theirs)?;
        if changes.is_empty() {
            return Ok(());
        }
        let clock = self.doc.clock().ok_or(SyncError::NoClock)?;
        log::debug!(
            "sync push: doc {} peer {} ({} change(s))",
            self.doc.document_id(),
            self.peer_id,
            changes.len()
        );
        self.send(SyncMessage::push(clock.clone(), changes))?;
        self.ours = merge(&self.ours, &clock);
        Ok(())
    }

    /// Emit a bare-clock pull iff the clock strictly advanced past the
    /// last-advertised `ours`; otherwise stay silent.
    fn maybe_request_changes(&mut self, clock: &VectorClock) -> Result<(), SyncError> {
        if !less_or_equal(clock, &self.ours) {
            self.send(SyncMessage::pull(clock.clone()))?;
        }
        Ok(())
    }

    /// The document must have a clock, and that clock must dominate what we
    /// already advertised; anything else is a replaced or regressed replica.
    fn validate(&self) -> Result<VectorClock, SyncError> {
        let clock = self.doc.clock().ok_or(SyncError::NoClock)?;
        if !less_or_equal(&self.ours, &clock) {
            return Err(SyncError::OldClock {
                advertised: self.ours.clone(),
                current: clock,
            });
        }
        Ok(clock)
    }

    fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        self.outbox
            .send(message)
            .map_err(|_| SyncError::ChannelClosed)
    }
}
