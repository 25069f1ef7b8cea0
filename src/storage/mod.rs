//! Counter Store Module
//!
//! Implements the partitioned, transactional vote store hosted by a store node.
//!
//! ## Core Concepts
//! - **Records**: `VoteRecord` values are immutable; every vote produces a new record.
//! - **Transactions**: A `Transaction` pins a snapshot of one partition, takes per-key update
//!   locks, and commits optimistically (version compare-and-swap, single writer per partition).
//! - **Durability**: Commits are handed to a `ReplicationSubstrate` before they become visible.
//!   `DurableSubstrate` appends to a per-partition commit log and pushes to backups.
//! - **Codec**: Records are framed in a tagged-field binary format inside the commit log.
//! - **Access**: `handlers::router` exposes the vote API and the internal replication API.

pub mod codec;
pub mod error;
pub mod handlers;
pub mod log;
pub mod protocol;
pub mod replication;
pub mod store;
pub mod substrate;
pub mod transaction;
pub mod types;

pub use error::{CodecError, StoreError, StoreResult};
pub use store::{CounterStore, GET_ALL_LIMIT};
pub use substrate::{InMemorySubstrate, ReplicationSubstrate, Role};
pub use types::{DEFAULT_PARTITION, Mutation, PartitionId, VoteRecord};
