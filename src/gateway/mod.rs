//! Partition Gateway Module
//!
//! The stateless front door of the voting cluster.
//!
//! ## Core Concepts
//! - **Partitioning**: `Partitioner` hashes a routing key to a partition (one partition by default).
//! - **Resolution**: A `PartitionResolver` names the primary replica of a partition. Routes are
//!   invalidated on transport failures so a failover is picked up by the next request.
//! - **Forwarding**: `PartitionGateway` proxies reads (retried with backoff) and writes (never
//!   retried) to the store, and counts every request it handles.

pub mod error;
pub mod handlers;
pub mod partitioner;
pub mod proxy;
pub mod resolver;

pub use error::GatewayError;
pub use partitioner::Partitioner;
pub use proxy::{Endpoint, PartitionGateway};
pub use resolver::{PartitionResolver, ReplicaSetResolver, StaticResolver};

#[cfg(test)]
mod tests;
