//! Command-line and environment configuration for both binaries.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::storage::substrate::Role;

/// A store node hosting the counter store.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct StoreArgs {
    /// Socket address the node's HTTP API binds to.
    #[arg(long, env = "VOTING_BIND", default_value = "127.0.0.1:7000")]
    pub bind: SocketAddr,

    /// Directory for the commit logs. Without it, votes are kept in memory only.
    #[arg(long, env = "VOTING_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Whether this node accepts writes or receives them from a primary.
    #[arg(long, env = "VOTING_ROLE", value_enum, default_value_t = Role::Primary)]
    pub role: Role,

    /// Address other nodes and gateways use to reach this node.
    /// Defaults to the bind address.
    #[arg(long, env = "VOTING_ADVERTISE")]
    pub advertise: Option<String>,

    /// Address of the primary (secondaries only).
    #[arg(long, env = "VOTING_PRIMARY")]
    pub primary: Option<String>,

    /// Backups that receive every committed mutation (primaries only).
    #[arg(long, env = "VOTING_BACKUPS", value_delimiter = ',')]
    pub backups: Vec<String>,

    /// How many times a vote is retried after a commit conflict.
    #[arg(long, env = "VOTING_CONFLICT_RETRIES", default_value_t = 3)]
    pub conflict_retries: usize,
}

impl StoreArgs {
    /// Address of the replica accepting writes, as seen from this node.
    pub fn primary_addr(&self) -> Option<String> {
        match self.role {
            Role::Primary => Some(
                self.advertise
                    .clone()
                    .unwrap_or_else(|| self.bind.to_string()),
            ),
            Role::Secondary => self.primary.clone(),
        }
    }
}

/// The stateless gateway in front of the store nodes.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct GatewayArgs {
    /// Socket address the gateway binds to.
    #[arg(long, env = "VOTING_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Store nodes to route to. A single entry is used as-is; several entries
    /// are probed to find the primary.
    #[arg(
        long,
        env = "VOTING_REPLICAS",
        value_delimiter = ',',
        default_value = "127.0.0.1:7000"
    )]
    pub replicas: Vec<String>,

    /// Directory holding `index.html`.
    #[arg(long, env = "VOTING_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Number of partitions keys are hashed over.
    #[arg(long, env = "VOTING_PARTITIONS", default_value_t = 1)]
    pub partitions: u32,

    /// Timeout for each call to a store node, in milliseconds.
    #[arg(long, env = "VOTING_TIMEOUT_MS", default_value_t = 5000)]
    pub timeout_ms: u64,
}
