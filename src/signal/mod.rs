//! Peer rendezvous: a stateless broker that introduces peers interested in
//! the same discovery key and pipes their sockets together, plus the client
//! that talks to it.

pub mod client;
pub mod server;
