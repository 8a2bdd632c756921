//! Peer sessions
//!
//! A domain talks to the rest of the topology through one session to its
//! relay. The session is a reliable, ordered, already authenticated pipe;
//! reconnecting and retrying are the transport's business.

pub mod local;

pub use local::{LocalRelay, LocalSession};

use crate::protocol::ReplicationMsg;
use crate::types::{GroupId, ReplicaId};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Session to the relay a domain is connected to
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Send one message to the peer
    async fn publish(&self, msg: ReplicationMsg) -> Result<()>;

    /// Next message from the peer, `None` once the session is closed
    async fn receive(&self) -> Result<Option<ReplicationMsg>>;

    /// Group id of the peer at the other end
    fn session_group_id(&self) -> GroupId;
}

/// Where this replica is attached, as decided by peer selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Topology {
    /// Replica id of the assigned relay
    pub relay_id: Option<ReplicaId>,

    /// Group id of the assigned relay; the session's own group when unset
    pub relay_group: Option<GroupId>,
}

impl Topology {
    pub fn new(relay_id: ReplicaId, relay_group: GroupId) -> Self {
        Self {
            relay_id: Some(relay_id),
            relay_group: Some(relay_group),
        }
    }
}
