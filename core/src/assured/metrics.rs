//! Assured replication monitoring
//!
//! Counters for updates this replica published in an assured mode, split
//! by mode, plus the Safe Read updates it received from others.

use crate::protocol::{AckMsg, AssuredMode};
use crate::types::ReplicaId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counters for one assured mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeCounters {
    pub sent: u64,
    pub acknowledged: u64,
    pub not_acknowledged: u64,
    pub timeout: u64,
    pub wrong_status: u64,
    pub replay_error: u64,

    /// Errors charged to each server named in a nack or timeout
    pub server_errors: BTreeMap<ReplicaId, u64>,
}

impl ModeCounters {
    fn charge(&mut self, servers: &[ReplicaId]) {
        for server in servers {
            *self.server_errors.entry(*server).or_insert(0) += 1;
        }
    }
}

/// Point-in-time copy of the assured counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssuredSnapshot {
    pub safe_read: ModeCounters,
    pub safe_data: ModeCounters,

    /// Safe Read updates received from other replicas
    pub received_safe_read: u64,
    pub received_safe_read_acked: u64,
    pub received_safe_read_not_acked: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AssuredMetrics {
    inner: Arc<Mutex<AssuredSnapshot>>,
}

impl AssuredMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn mode<R>(&self, mode: AssuredMode, f: impl FnOnce(&mut ModeCounters) -> R) -> R {
        let mut inner = self.inner.lock();
        match mode {
            AssuredMode::SafeRead => f(&mut inner.safe_read),
            AssuredMode::SafeData => f(&mut inner.safe_data),
        }
    }

    /// Record an assured update leaving for the relay
    pub fn record_sent(&self, mode: AssuredMode) {
        self.mode(mode, |c| c.sent += 1);
    }

    /// Record the resolution of an update by an ack or a nack
    pub fn record_ack(&self, mode: AssuredMode, ack: &AckMsg) {
        self.mode(mode, |c| {
            if !ack.has_errors() {
                c.acknowledged += 1;
                return;
            }
            c.not_acknowledged += 1;
            if ack.has_timeout {
                c.timeout += 1;
            }
            if ack.has_replay_error {
                c.replay_error += 1;
            }
            if ack.has_wrong_status {
                c.wrong_status += 1;
            }
            c.charge(&ack.failed);
        });
    }

    /// Record an update nobody answered in time
    pub fn record_timeout(&self, mode: AssuredMode, failed: &[ReplicaId]) {
        self.mode(mode, |c| {
            c.not_acknowledged += 1;
            c.timeout += 1;
            c.charge(failed);
        });
    }

    pub fn record_received_safe_read(&self) {
        self.inner.lock().received_safe_read += 1;
    }

    pub fn record_safe_read_answer(&self, acked: bool) {
        let mut inner = self.inner.lock();
        if acked {
            inner.received_safe_read_acked += 1;
        } else {
            inner.received_safe_read_not_acked += 1;
        }
    }

    pub fn snapshot(&self) -> AssuredSnapshot {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::Csn;

    #[test]
    fn test_nack_flags_counted_independently() {
        let metrics = AssuredMetrics::new();
        metrics.record_sent(AssuredMode::SafeRead);
        metrics.record_ack(
            AssuredMode::SafeRead,
            &AckMsg {
                csn: Csn::default(),
                has_timeout: true,
                has_replay_error: true,
                has_wrong_status: false,
                failed: vec![ReplicaId(2), ReplicaId(3)],
            },
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.safe_read.sent, 1);
        assert_eq!(snap.safe_read.not_acknowledged, 1);
        assert_eq!(snap.safe_read.timeout, 1);
        assert_eq!(snap.safe_read.replay_error, 1);
        assert_eq!(snap.safe_read.wrong_status, 0);
        assert_eq!(snap.safe_read.server_errors.len(), 2);
        assert_eq!(snap.safe_data, ModeCounters::default());
    }

    #[test]
    fn test_timeout_charged_to_server() {
        let metrics = AssuredMetrics::new();
        metrics.record_timeout(AssuredMode::SafeData, &[ReplicaId(9)]);
        metrics.record_timeout(AssuredMode::SafeData, &[ReplicaId(9)]);
        metrics.record_ack(AssuredMode::SafeData, &AckMsg::success(Csn::default()));

        let snap = metrics.snapshot();
        assert_eq!(snap.safe_data.timeout, 2);
        assert_eq!(snap.safe_data.acknowledged, 1);
        assert_eq!(snap.safe_data.server_errors.get(&ReplicaId(9)), Some(&2));
    }

    #[test]
    fn test_received_counters() {
        let metrics = AssuredMetrics::new();
        metrics.record_received_safe_read();
        metrics.record_received_safe_read();
        metrics.record_safe_read_answer(true);
        metrics.record_safe_read_answer(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.received_safe_read, 2);
        assert_eq!(snap.received_safe_read_acked, 1);
        assert_eq!(snap.received_safe_read_not_acked, 1);
    }
}
