//! Voting Cluster Library
//!
//! A two-tier vote counter: stateless gateways forward requests to a
//! partitioned, replicated counter store.
//!
//! ## Architecture Modules
//! - **`storage`**: The counter store. Immutable vote records, snapshot-isolated transactions
//!   with optimistic commits, a binary record codec, per-partition commit logs, and the store
//!   node's HTTP API (public votes API plus internal replication and status endpoints).
//! - **`gateway`**: The front door. Hashes keys to partitions, resolves each partition's
//!   primary replica, and proxies the votes API to it.
//! - **`config`**: Command-line and environment settings of both binaries.

pub mod config;
pub mod gateway;
pub mod storage;
