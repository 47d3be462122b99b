//! # tandem — peer-to-peer CRDT document synchronization
//!
//! Applications get a locally-replicated, offline-capable document whose
//! state converges across an arbitrary set of peers without a central
//! authority. A signal server introduces peers interested in the same
//! document and pipes their sockets together; after that, every pair of
//! peers runs a clock-driven sync protocol directly.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   introductions    ┌──────────────┐
//! │ StoreManager │ ◄────────────────► │ SignalServer │
//! │  (per DB)    │    piped sockets   │  (stateless) │
//! └──────┬───────┘                    └──────────────┘
//!        │ owns
//!        ▼
//! ┌──────────────┐   change hook   ┌──────────────┐
//! │ Repository   │ ───────────────►│ Connection   │ (one per peer)
//! │ (replica +   │                 │ DocumentSync │
//! │  change log) │ ◄───────────────│ + socket     │
//! └──────┬───────┘  apply_changes  └──────┬───────┘
//!        │                                │ {clock, changes?} JSON
//!        ▼                                ▼
//! ┌──────────────┐                 ┌──────────────┐
//! │ ChangeStore  │                 │ remote peer  │
//! │ (RocksDB)    │                 └──────────────┘
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — vector-clock comparison and merge
//! - [`protocol`] — JSON wire messages (sync + signaling)
//! - [`document`] — observable wrapper over one CRDT replica
//! - [`sync`] — per-peer, per-document sync state machine
//! - [`repository`] — replica ownership, change log, recovery
//! - [`storage`] — RocksDB change log, snapshots, keychain
//! - [`connection`] — one peer pairing: sync machine + socket
//! - [`store_manager`] — per-database façade and event surface
//! - [`signal`] — rendezvous server and client

// Reducers write change functions against the CRDT engine directly.
pub use yrs;

pub mod clock;
pub mod protocol;
pub mod document;
pub mod sync;
pub mod storage;
pub mod repository;
pub mod connection;
pub mod store_manager;
pub mod signal;

pub use clock::{less_or_equal, merge, ActorId, VectorClock};
pub use protocol::{Change, ClientMessage, ProtocolError, ServerMessage, SyncMessage};
pub use document::{DocError, DocHandle, HandlerId};
pub use sync::{DocumentSync, SyncError};
pub use storage::{ChangeStore, DocumentMetadata, KeyPair, StoreError, StoreOptions};
pub use repository::{RepoError, Repository};
pub use connection::Connection;
pub use store_manager::{
    Action, ChangeFn, DispatchOutcome, EventHandler, ManagerError, Proposal, Reducer,
    StoreConfig, StoreEvent, StoreManager, DEFAULT_SIGNAL_URLS,
};
pub use signal::client::{SignalClient, SignalError, SignalEvent};
pub use signal::server::{SignalConfig, SignalServer, SignalServerHandle};
