//! Receive-side acknowledgements
//!
//! A directory server only answers Safe Read updates, and only when its
//! relay is in its own group. Safe Data acks come from relays.

use super::metrics::AssuredMetrics;
use crate::protocol::{AckMsg, AssuredMode, UpdateMsg};
use crate::types::{GroupId, ReplicaId, ServerStatus};
use parking_lot::RwLock;
use tracing::debug;

pub struct AssuredResponder {
    replica_id: ReplicaId,
    group_id: GroupId,
    status: RwLock<ServerStatus>,
    metrics: AssuredMetrics,
}

impl AssuredResponder {
    pub fn new(replica_id: ReplicaId, group_id: GroupId, metrics: AssuredMetrics) -> Self {
        Self {
            replica_id,
            group_id,
            status: RwLock::new(ServerStatus::Normal),
            metrics,
        }
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ServerStatus) {
        *self.status.write() = status;
    }

    /// Answer to send once `update` went through replay
    ///
    /// `replay_error` is the failure message when the replay did not apply.
    pub fn respond(
        &self,
        update: &UpdateMsg,
        replay_error: Option<&str>,
        relay_group: GroupId,
    ) -> Option<AckMsg> {
        let assured = update.assured()?;
        if assured.mode != AssuredMode::SafeRead || relay_group != self.group_id {
            return None;
        }
        self.metrics.record_received_safe_read();

        let mut ack = AckMsg::success(update.csn());
        if self.status() != ServerStatus::Normal {
            ack.has_wrong_status = true;
        }
        if let Some(reason) = replay_error {
            debug!(csn = %update.csn(), reason, "Answering Safe Read update with a replay error");
            ack.has_replay_error = true;
        }
        if ack.has_errors() {
            ack.failed = vec![self.replica_id];
        }

        self.metrics.record_safe_read_answer(!ack.has_errors());
        Some(ack)
    }
}
