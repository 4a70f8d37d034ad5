//! Distributed coordination core of a peer-to-peer replicated table store.
//!
//! A cluster of symmetric nodes each holds a local copy of a set of
//! tables. Nodes discover each other over a gossip-based link-state
//! protocol, keep a shared view of the cluster graph, replicate row-level
//! mutations through per-origin transaction logs and apply received
//! entries exactly once, converging replicas wherever connectivity allows.
//!
//! The crate is organized around the flow of a message:
//! - [`conman`] accepts and dials sockets, [`dispatch`] multiplexes frames
//!   per connection, [`peer`] runs the handshake and the p2p handlers.
//! - [`tracker`] owns the cluster graph, [`gossip`] floods link changes,
//!   [`topology`] is the immutable snapshot both work with.
//! - [`storage`] holds everything durable: node identity, known peers,
//!   per-origin TR-logs and the table state itself.
//! - [`datasync`] pulls remote log tails along [`routes`], [`committer`]
//!   replays them into tables, [`jobber`] and [`ebus`] glue the pieces
//!   together without cross-thread tangles.
//!
//! [`core::Core`] wires it all up and is the only type an embedder needs.

pub mod committer;
pub mod config;
pub mod conman;
pub mod core;
pub mod datasync;
pub mod dispatch;
pub mod ebus;
pub mod error;
pub mod gossip;
pub mod jobber;
pub mod peer;
pub mod proto;
pub mod routes;
pub mod storage;
pub mod topology;
pub mod tracker;

pub use crate::core::Core;
pub use config::NodeConfig;
pub use error::{Error, Result};
