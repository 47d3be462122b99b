//! Observable wrapper around one CRDT replica.
//!
//! [`DocHandle`] is the only way the rest of the crate touches a document:
//! reads go through `clock`/`snapshot`/`missing_changes`, writes through
//! `apply_changes` (remote) or `update` (local). Every mutation flows to the
//! repository-installed change sink (persistence) and then to the registered
//! change handlers, in that order. The underlying engine type never leaks
//! past the reducer seam.
//!
//! All CRDT access for one document is serialized behind a single mutex;
//! handlers run after the lock is released, from a snapshot of the registry,
//! so a handler may freely re-enter the document or edit subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::{Any, Doc, ReadTxn, Transact, TransactionMut, Update};

use crate::clock::{less_or_equal, VectorClock};
use crate::protocol::Change;

/// Name of the root map every document keeps its state under.
pub const ROOT_MAP: &str = "data";

/// Default ceiling on change handlers per document. A document with many
/// peers carries one handler per connection plus the host's.
pub const DEFAULT_HANDLER_CAP: usize = 500;

/// A unique identifier for a registered change handler.
pub type HandlerId = u64;

/// Invoked with the document id after every mutation, local or remote.
pub type DocHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Persistence hook installed by the repository; receives every applied
/// change batch before handlers run.
pub type ChangeSink = Arc<dyn Fn(&[Change]) + Send + Sync>;

/// Errors from the document wrapper.
#[derive(Debug, Clone)]
pub enum DocError {
    /// The handle no longer fronts a live replica.
    Detached,
    /// The CRDT engine rejected a change.
    Engine(String),
    /// The handler registry is at capacity.
    HandlerLimit(usize),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Detached => write!(f, "document handle is detached"),
            Self::Engine(e) => write!(f, "engine error: {e}"),
            Self::HandlerLimit(cap) => write!(f, "handler limit reached ({cap})"),
        }
    }
}

impl std::error::Error for DocError {}

struct DocInner {
    document_id: String,
    doc: Mutex<Option<Doc>>,
    handlers: Mutex<HashMap<HandlerId, DocHandler>>,
    next_handler_id: AtomicU64,
    handler_cap: usize,
    sink: Mutex<Option<ChangeSink>>,
}

/// Clone-able handle to one replicated document.
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<DocInner>,
}

impl DocHandle {
    pub fn new(document_id: impl Into<String>, doc: Doc, handler_cap: usize) -> Self {
        Self {
            inner: Arc::new(DocInner {
                document_id: document_id.into(),
                doc: Mutex::new(Some(doc)),
                handlers: Mutex::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
                handler_cap,
                sink: Mutex::new(None),
            }),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.inner.document_id
    }

    /// Current vector clock, or `None` once detached (the no-clock case).
    pub fn clock(&self) -> Option<VectorClock> {
        let guard = self.inner.doc.lock().unwrap();
        let doc = guard.as_ref()?;
        let txn = doc.transact();
        Some(VectorClock::from(&txn.state_vector()))
    }

    /// Render the root map to plain JSON for the host application.
    pub fn snapshot(&self) -> Value {
        let guard = self.inner.doc.lock().unwrap();
        let doc = match guard.as_ref() {
            Some(d) => d,
            None => return Value::Null,
        };
        let txn = doc.transact();
        match txn.get_map(ROOT_MAP) {
            Some(map) => any_to_json(&map.to_json(&txn)),
            None => Value::Object(serde_json::Map::new()),
        }
    }

    /// Apply remote changes, persist them, and notify handlers.
    ///
    /// Idempotent: re-applying a batch the replica already holds is a no-op
    /// at the CRDT level. Returns the clock after application.
    pub fn apply_changes(&self, changes: &[Change]) -> Result<VectorClock, DocError> {
        let clock_after = {
            let guard = self.inner.doc.lock().unwrap();
            let doc = guard.as_ref().ok_or(DocError::Detached)?;
            {
                let mut txn = doc.transact_mut();
                for change in changes {
                    let update = Update::decode_v1(change.as_bytes())
                        .map_err(|e| DocError::Engine(e.to_string()))?;
                    txn.apply_update(update)
                        .map_err(|e| DocError::Engine(e.to_string()))?;
                }
            }
            let txn = doc.transact();
            VectorClock::from(&txn.state_vector())
        };
        if !changes.is_empty() {
            self.persist(changes);
            self.notify();
        }
        Ok(clock_after)
    }

    /// Run a local mutation inside one transaction.
    ///
    /// The change the mutation produced (diff against the pre-state) is
    /// persisted and handlers fire; returns `None` when the mutation turned
    /// out to be a no-op.
    pub fn update<F>(&self, f: F) -> Result<Option<Change>, DocError>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let produced = {
            let guard = self.inner.doc.lock().unwrap();
            let doc = guard.as_ref().ok_or(DocError::Detached)?;
            let before = doc.transact().state_vector();
            {
                let mut txn = doc.transact_mut();
                f(&mut txn);
            }
            let txn = doc.transact();
            let after = txn.state_vector();
            if VectorClock::from(&after) == VectorClock::from(&before) {
                None
            } else {
                Some(Change::new(txn.encode_diff_v1(&before)))
            }
        };
        match produced {
            Some(change) => {
                self.persist(std::slice::from_ref(&change));
                self.notify();
                Ok(Some(change))
            }
            None => Ok(None),
        }
    }

    /// Everything present locally that `theirs` does not yet cover.
    ///
    /// Empty when the remote clock dominates ours; otherwise a single opaque
    /// change blob containing exactly the missing operations.
    pub fn missing_changes(&self, theirs: &VectorClock) -> Result<Vec<Change>, DocError> {
        let guard = self.inner.doc.lock().unwrap();
        let doc = guard.as_ref().ok_or(DocError::Detached)?;
        let txn = doc.transact();
        let local = VectorClock::from(&txn.state_vector());
        if less_or_equal(&local, theirs) {
            return Ok(Vec::new());
        }
        let diff = txn.encode_diff_v1(&theirs.to_state_vector());
        Ok(vec![Change::new(diff)])
    }

    pub fn register_handler(&self, handler: DocHandler) -> Result<HandlerId, DocError> {
        let mut handlers = self.inner.handlers.lock().unwrap();
        if handlers.len() >= self.inner.handler_cap {
            return Err(DocError::HandlerLimit(self.inner.handler_cap));
        }
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        handlers.insert(id, handler);
        Ok(id)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.inner.handlers.lock().unwrap().remove(&id).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().unwrap().len()
    }

    /// Install the persistence hook. Repository-internal.
    pub(crate) fn set_change_sink(&self, sink: ChangeSink) {
        *self.inner.sink.lock().unwrap() = Some(sink);
    }

    /// Detach the replica; subsequent reads yield the no-clock state.
    pub(crate) fn detach(&self) {
        self.inner.doc.lock().unwrap().take();
    }

    /// Swap in a different replica, clock regressions included.
    #[cfg(test)]
    pub(crate) fn replace_doc(&self, doc: Doc) {
        *self.inner.doc.lock().unwrap() = Some(doc);
    }

    /// Full document state as one change, for snapshot persistence.
    pub(crate) fn full_state(&self) -> Option<Change> {
        let guard = self.inner.doc.lock().unwrap();
        let doc = guard.as_ref()?;
        let txn = doc.transact();
        Some(Change::new(
            txn.encode_state_as_update_v1(&yrs::StateVector::default()),
        ))
    }

    fn persist(&self, changes: &[Change]) {
        let sink = self.inner.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(changes);
        }
    }

    fn notify(&self) {
        let snapshot: Vec<DocHandler> = {
            let handlers = self.inner.handlers.lock().unwrap();
            handlers.values().cloned().collect()
        };
        for handler in snapshot {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(&self.inner.document_id);
            }));
        }
    }
}

/// Convert plain JSON into an engine value for insertion.
pub(crate) fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Any::String(s.clone().into()),
        Value::Array(items) => {
            let converted: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(converted.into())
        }
        Value::Object(fields) => {
            let converted: std::collections::HashMap<String, Any> = fields
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(converted))
        }
    }
}

/// Render an engine value back to plain JSON.
pub(crate) fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(fields) => {
            let mut out = serde_json::Map::new();
            for (k, v) in fields.iter() {
                out.insert(k.clone(), any_to_json(v));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yrs::{Map, WriteTxn};

    fn fresh(id: &str) -> DocHandle {
        DocHandle::new(id, Doc::new(), DEFAULT_HANDLER_CAP)
    }

    fn set_field(handle: &DocHandle, key: &str, value: i64) {
        handle
            .update(|txn| {
                let root = txn.get_or_insert_map(ROOT_MAP);
                root.insert(txn, key, value);
            })
            .unwrap();
    }

    #[test]
    fn test_fresh_document_has_empty_clock() {
        let handle = fresh("doc");
        assert!(handle.clock().unwrap().is_empty());
        assert_eq!(handle.snapshot(), json!({}));
    }

    #[test]
    fn test_update_advances_clock_and_snapshot() {
        let handle = fresh("doc");
        set_field(&handle, "x", 1);
        let clock = handle.clock().unwrap();
        assert!(!clock.is_empty());
        assert_eq!(handle.snapshot(), json!({ "x": 1 }));
    }

    #[test]
    fn test_noop_update_produces_no_change() {
        let handle = fresh("doc");
        let produced = handle.update(|_txn| {}).unwrap();
        assert!(produced.is_none());
    }

    #[test]
    fn test_changes_flow_between_handles() {
        let a = fresh("doc");
        let b = fresh("doc");
        set_field(&a, "x", 7);

        let missing = a.missing_changes(&b.clock().unwrap()).unwrap();
        assert_eq!(missing.len(), 1);
        b.apply_changes(&missing).unwrap();

        assert_eq!(b.snapshot(), json!({ "x": 7 }));
        assert_eq!(b.clock().unwrap(), a.clock().unwrap());
    }

    #[test]
    fn test_missing_changes_empty_when_dominated() {
        let a = fresh("doc");
        let b = fresh("doc");
        set_field(&a, "x", 1);
        let missing = a.missing_changes(&b.clock().unwrap()).unwrap();
        b.apply_changes(&missing).unwrap();
        assert!(a.missing_changes(&b.clock().unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_apply_changes_is_idempotent() {
        let a = fresh("doc");
        let b = fresh("doc");
        set_field(&a, "x", 3);
        let missing = a.missing_changes(&VectorClock::new()).unwrap();

        let clock_once = b.apply_changes(&missing).unwrap();
        let clock_twice = b.apply_changes(&missing).unwrap();
        assert_eq!(clock_once, clock_twice);
        assert_eq!(b.snapshot(), json!({ "x": 3 }));
    }

    #[test]
    fn test_handlers_fire_on_local_and_remote_mutation() {
        let a = fresh("doc");
        let b = fresh("doc");
        let hits = Arc::new(AtomicU64::new(0));
        let counted = hits.clone();
        b.register_handler(Arc::new(move |_id| {
            counted.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        set_field(&a, "x", 1);
        let missing = a.missing_changes(&VectorClock::new()).unwrap();
        b.apply_changes(&missing).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        set_field(&b, "y", 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_handler_stops_firing() {
        let handle = fresh("doc");
        let hits = Arc::new(AtomicU64::new(0));
        let counted = hits.clone();
        let id = handle
            .register_handler(Arc::new(move |_id| {
                counted.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        set_field(&handle, "x", 1);
        assert!(handle.unregister_handler(id));
        set_field(&handle, "x", 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_cap_enforced() {
        let handle = DocHandle::new("doc", Doc::new(), 2);
        handle.register_handler(Arc::new(|_| {})).unwrap();
        handle.register_handler(Arc::new(|_| {})).unwrap();
        match handle.register_handler(Arc::new(|_| {})) {
            Err(DocError::HandlerLimit(2)) => {}
            other => panic!("expected handler limit, got {other:?}"),
        }
    }

    #[test]
    fn test_detached_handle_has_no_clock() {
        let handle = fresh("doc");
        handle.detach();
        assert!(handle.clock().is_none());
        assert!(matches!(
            handle.apply_changes(&[Change::new(vec![0, 0])]),
            Err(DocError::Detached)
        ));
    }

    #[test]
    fn test_sink_sees_every_mutation() {
        let a = fresh("doc");
        let b = fresh("doc");
        let persisted = Arc::new(Mutex::new(Vec::new()));
        let log = persisted.clone();
        b.set_change_sink(Arc::new(move |changes: &[Change]| {
            log.lock().unwrap().extend(changes.to_vec());
        }));

        set_field(&b, "x", 1);
        set_field(&a, "y", 2);
        let missing = a.missing_changes(&b.clock().unwrap()).unwrap();
        b.apply_changes(&missing).unwrap();

        assert_eq!(persisted.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_json_any_roundtrip() {
        let original = json!({
            "title": "todo",
            "count": 3,
            "ratio": 0.5,
            "done": false,
            "tags": ["a", "b"],
            "nested": { "deep": null }
        });
        let back = any_to_json(&json_to_any(&original));
        assert_eq!(back, original);
    }
}
