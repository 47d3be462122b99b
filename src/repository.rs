//! Repository: local owner of every replica in one database.
//!
//! The repository constructs documents (fresh or recovered from the change
//! log), installs the persistence sink on each handle, and fans change
//! notifications out to repository-wide handlers. Nothing else in the crate
//! writes to storage.
//!
//! Persistence failures never take the database down: the repository flips
//! into an in-memory-only mode, reports the failure once through the error
//! hook, and keeps syncing with peers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use yrs::{Doc, Map, WriteTxn};

use crate::document::{
    json_to_any, ChangeSink, DocError, DocHandle, DocHandler, HandlerId, ROOT_MAP,
};
use crate::storage::{ChangeStore, KeyPair, StoreError, StoreOptions};

/// Invoked when persistence degrades; wired to the host's error surface.
pub type ErrorHook = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Repository errors.
#[derive(Debug)]
pub enum RepoError {
    Store(StoreError),
    Document(DocError),
    UnknownDocument(String),
}

impl std::fmt::Display for RepoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Document(e) => write!(f, "document error: {e}"),
            Self::UnknownDocument(id) => write!(f, "unknown document: {id}"),
        }
    }
}

impl std::error::Error for RepoError {}

impl From<StoreError> for RepoError {
    fn from(e: StoreError) -> Self {
        RepoError::Store(e)
    }
}

impl From<DocError> for RepoError {
    fn from(e: DocError) -> Self {
        RepoError::Document(e)
    }
}

/// Owns the replicas and the change log for one database.
pub struct Repository {
    database_name: String,
    store: Option<Arc<ChangeStore>>,
    degraded: Arc<AtomicBool>,
    docs: RwLock<HashMap<String, DocHandle>>,
    handlers: Arc<Mutex<HashMap<HandlerId, DocHandler>>>,
    next_handler_id: AtomicU64,
    handler_cap: usize,
    error_hook: Arc<Mutex<Option<ErrorHook>>>,
    /// Key material when running without a store.
    mem_keys: Mutex<HashMap<String, KeyPair>>,
}

impl Repository {
    /// Open the repository, backed by disk when `storage_dir` is given.
    ///
    /// A store that fails to open degrades to in-memory operation instead of
    /// failing construction.
    pub fn new(
        database_name: impl Into<String>,
        storage_dir: Option<PathBuf>,
        handler_cap: usize,
    ) -> Self {
        let database_name = database_name.into();
        let degraded = Arc::new(AtomicBool::new(false));
        let store = storage_dir.and_then(|dir| {
            let options = StoreOptions {
                path: dir.join(&database_name),
                ..StoreOptions::default()
            };
            match ChangeStore::open(options) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    log::error!("repository {database_name}: store open failed, running in-memory: {e}");
                    degraded.store(true, Ordering::SeqCst);
                    None
                }
            }
        });
        Self {
            database_name,
            store,
            degraded,
            docs: RwLock::new(HashMap::new()),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_handler_id: AtomicU64::new(1),
            handler_cap,
            error_hook: Arc::new(Mutex::new(None)),
            mem_keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// True once persistence has been lost and the repository carries on
    /// in memory only.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub(crate) fn set_error_hook(&self, hook: ErrorHook) {
        *self.error_hook.lock().unwrap() = Some(hook);
    }

    /// Construct or recover the document and return its handle.
    ///
    /// Creating seeds a fresh replica from `initial_state` (recorded as its
    /// first change); joining replays local state and otherwise starts empty,
    /// awaiting peer sync. Calling `init` again for a known document returns
    /// the existing handle.
    pub fn init(
        &self,
        document_id: &str,
        initial_state: &Value,
        is_creating: bool,
    ) -> Result<DocHandle, RepoError> {
        if let Some(existing) = self.docs.read().unwrap().get(document_id) {
            return Ok(existing.clone());
        }

        let handle = DocHandle::new(document_id, Doc::new(), self.handler_cap);

        // Fan document notifications out to repository-wide handlers. Wired
        // before any mutation so recovery replay and the initial seed reach
        // handlers registered ahead of init.
        let fanout = self.fanout_handler();
        handle.register_handler(fanout)?;

        // Recovery runs before the sink is installed so replayed changes
        // are not appended to the log a second time.
        if !is_creating {
            self.recover(&handle, document_id);
        }

        handle.set_change_sink(self.change_sink(document_id));

        if is_creating {
            if let Value::Object(fields) = initial_state {
                if !fields.is_empty() {
                    handle.update(|txn| {
                        let root = txn.get_or_insert_map(ROOT_MAP);
                        for (key, value) in fields {
                            root.insert(txn, key.as_str(), json_to_any(value));
                        }
                    })?;
                }
            }
        }

        let mut docs = self.docs.write().unwrap();
        let handle = docs
            .entry(document_id.to_string())
            .or_insert(handle)
            .clone();
        log::info!(
            "repository {}: document {document_id} ready ({})",
            self.database_name,
            if is_creating { "created" } else { "joined" }
        );
        Ok(handle)
    }

    /// Replay snapshot and change log into a fresh handle. Failures degrade
    /// rather than abort: the document simply starts empty.
    fn recover(&self, handle: &DocHandle, document_id: &str) {
        let store = match &self.store {
            Some(store) => store.clone(),
            None => return,
        };
        match store.load_snapshot(document_id) {
            Ok(Some(snapshot)) => {
                if let Err(e) = handle.apply_changes(&[crate::protocol::Change::new(snapshot)]) {
                    log::warn!("repository: snapshot replay failed for {document_id}: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.degrade(&e);
                return;
            }
        }
        match store.load_changes(document_id) {
            Ok(changes) if !changes.is_empty() => {
                log::info!(
                    "repository: replaying {} stored change(s) for {document_id}",
                    changes.len()
                );
                if let Err(e) = handle.apply_changes(&changes) {
                    log::warn!("repository: change replay failed for {document_id}: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => self.degrade(&e),
        }
    }

    fn change_sink(&self, document_id: &str) -> ChangeSink {
        let store = self.store.clone();
        let degraded = self.degraded.clone();
        let error_hook = self.error_hook.clone();
        let document_id = document_id.to_string();
        Arc::new(move |changes: &[crate::protocol::Change]| {
            if degraded.load(Ordering::SeqCst) {
                return;
            }
            let store = match &store {
                Some(store) => store,
                None => return,
            };
            if let Err(e) = store.append_changes(&document_id, changes) {
                log::error!("repository: persistence lost for {document_id}, continuing in memory: {e}");
                degraded.store(true, Ordering::SeqCst);
                let hook = error_hook.lock().unwrap().clone();
                if let Some(hook) = hook {
                    hook(&e);
                }
            }
        })
    }

    fn fanout_handler(&self) -> DocHandler {
        let handlers = self.handlers.clone();
        Arc::new(move |document_id: &str| {
            let snapshot: Vec<DocHandler> = handlers.lock().unwrap().values().cloned().collect();
            for handler in snapshot {
                handler(document_id);
            }
        })
    }

    pub fn get_document(&self, document_id: &str) -> Option<DocHandle> {
        self.docs.read().unwrap().get(document_id).cloned()
    }

    /// Register a handler invoked with the document id after every mutation
    /// of any document in this repository.
    pub fn add_handler(&self, handler: DocHandler) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().insert(id, handler);
        id
    }

    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.handlers.lock().unwrap().remove(&id).is_some()
    }

    /// Known document ids: everything in the keychain plus open documents.
    pub fn known_document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = match &self.store {
            Some(store) => store.known_document_ids().unwrap_or_default(),
            None => self.mem_keys.lock().unwrap().keys().cloned().collect(),
        };
        for id in self.docs.read().unwrap().keys() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.sort();
        ids
    }

    /// The discovery key advertised for a document, derived from its
    /// persisted key pair (or an ephemeral one when running in memory).
    pub fn discovery_key(&self, document_id: &str) -> Result<String, RepoError> {
        if !self.is_degraded() {
            if let Some(store) = &self.store {
                match store.discovery_key(document_id) {
                    Ok(key) => return Ok(key),
                    Err(e) => self.degrade(&e),
                }
            }
        }
        let mut keys = self.mem_keys.lock().unwrap();
        let pair = keys
            .entry(document_id.to_string())
            .or_insert_with(|| KeyPair::derive(document_id));
        Ok(pair.discovery_key())
    }

    /// Snapshot every open document and release the replicas.
    pub fn close(&self) {
        let docs: Vec<(String, DocHandle)> = {
            let mut map = self.docs.write().unwrap();
            map.drain().collect()
        };
        for (document_id, handle) in docs {
            if let (Some(store), false) = (&self.store, self.is_degraded()) {
                if let Some(full) = handle.full_state() {
                    match store.save_snapshot(&document_id, full.as_bytes()) {
                        Ok(meta) => {
                            let _ = store.compact_changes(&document_id, meta.change_count);
                            log::debug!("repository: snapshot saved for {document_id}");
                        }
                        Err(e) => {
                            log::warn!("repository: snapshot failed for {document_id}: {e}")
                        }
                    }
                }
            }
            handle.detach();
        }
        self.handlers.lock().unwrap().clear();
        log::info!("repository {} closed", self.database_name);
    }

    fn degrade(&self, error: &StoreError) {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!(
            "repository {}: persistence degraded: {error}",
            self.database_name
        );
        let hook = self.error_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(error);
        }
    }
}
