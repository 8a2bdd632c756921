//! dsync core library
//!
//! Consistency core of a multi-master directory replication system:
//! change sequence numbers, per-entry historical records, the replay engine
//! with its naming conflict resolver, and the assured replication protocol
//! (send coordinator and receive responder).

pub mod assured;
pub mod config;
pub mod csn;
pub mod dn;
pub mod domain;
pub mod historical;
pub mod protocol;
pub mod replay;
pub mod storage;
pub mod syntax;
pub mod transport;
pub mod types;
pub mod version;

pub use assured::PublishOutcome;
pub use config::{AssuredConfig, AssuredKind, DomainConfig};
pub use csn::{Csn, CsnGenerator};
pub use dn::{Dn, Rdn};
pub use domain::{DomainBuilder, DomainStats, ReplicationDomain, WriteResult};
pub use types::*;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid DN: {0}")]
    InvalidDn(String),

    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),

    #[error("No such entry: {0}")]
    NoSuchEntry(String),

    #[error("Entry already exists: {0}")]
    EntryAlreadyExists(String),

    #[error("Operation not allowed on non-leaf: {0}")]
    NotAllowedOnNonLeaf(String),

    #[error("Unresolved naming conflict on {0}")]
    NamingConflict(String),

    #[error("Replay failed: {0}")]
    Replay(String),

    #[error("Transport failed: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
