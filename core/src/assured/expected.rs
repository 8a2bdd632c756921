//! Relay-side ack aggregation
//!
//! A relay forwarding an assured update collects the answers it needs
//! before acknowledging to the writer. Safe Data counts stored copies: the
//! writer and the relay hold one each, every successful ack from another
//! server adds one. Safe Read waits for every expected directory server.

use crate::csn::Csn;
use crate::protocol::{AckMsg, AssuredMode, AssuredRequest};
use crate::types::ReplicaId;
use std::collections::BTreeSet;

/// Copies held before any other server answers: the writer and the relay
const LOCAL_COPIES: usize = 2;

#[derive(Debug, Clone)]
pub struct ExpectedAcks {
    csn: Csn,
    request: AssuredRequest,
    expected: BTreeSet<ReplicaId>,
    answered: BTreeSet<ReplicaId>,
    stored: usize,
    has_timeout: bool,
    has_replay_error: bool,
    has_wrong_status: bool,
    failed: BTreeSet<ReplicaId>,
}

impl ExpectedAcks {
    pub fn new(csn: Csn, request: AssuredRequest, expected: impl IntoIterator<Item = ReplicaId>) -> Self {
        Self {
            csn,
            request,
            expected: expected.into_iter().collect(),
            answered: BTreeSet::new(),
            stored: LOCAL_COPIES,
            has_timeout: false,
            has_replay_error: false,
            has_wrong_status: false,
            failed: BTreeSet::new(),
        }
    }

    pub fn csn(&self) -> Csn {
        self.csn
    }

    pub fn mode(&self) -> AssuredMode {
        self.request.mode
    }

    /// Account for the answer `ack` sent by `from`, returns whether the
    /// writer can now be answered
    pub fn process_ack(&mut self, from: ReplicaId, ack: &AckMsg) -> bool {
        if !self.expected.contains(&from) || !self.answered.insert(from) {
            return self.is_complete();
        }

        if ack.has_errors() {
            self.has_timeout |= ack.has_timeout;
            self.has_replay_error |= ack.has_replay_error;
            self.has_wrong_status |= ack.has_wrong_status;
            if ack.failed.is_empty() {
                self.failed.insert(from);
            } else {
                self.failed.extend(ack.failed.iter().copied());
            }
        } else {
            self.stored += 1;
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        match self.request.mode {
            AssuredMode::SafeData => {
                self.stored >= usize::from(self.request.safe_data_level)
                    || (self.answered.len() == self.expected.len() && self.has_errors())
            }
            AssuredMode::SafeRead => self.answered.len() == self.expected.len(),
        }
    }

    fn has_errors(&self) -> bool {
        self.has_timeout || self.has_replay_error || self.has_wrong_status
    }

    /// Merged answer once complete
    pub fn build_ack(&self) -> AckMsg {
        AckMsg {
            csn: self.csn,
            has_timeout: self.has_timeout,
            has_replay_error: self.has_replay_error,
            has_wrong_status: self.has_wrong_status,
            failed: self.failed.iter().copied().collect(),
        }
    }

    /// Answer sent when the relay gives up waiting: every silent server is
    /// named as failed
    pub fn build_timeout_ack(&self) -> AckMsg {
        let mut failed = self.failed.clone();
        failed.extend(self.expected.difference(&self.answered).copied());
        AckMsg {
            csn: self.csn,
            has_timeout: true,
            has_replay_error: self.has_replay_error,
            has_wrong_status: self.has_wrong_status,
            failed: failed.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csn() -> Csn {
        Csn::new(100, 0, ReplicaId(1))
    }

    fn safe_read() -> AssuredRequest {
        AssuredRequest {
            mode: AssuredMode::SafeRead,
            safe_data_level: 1,
        }
    }

    fn safe_data(level: u8) -> AssuredRequest {
        AssuredRequest {
            mode: AssuredMode::SafeData,
            safe_data_level: level,
        }
    }

    #[test]
    fn test_safe_data_level_two_complete_at_relay() {
        let acks = ExpectedAcks::new(csn(), safe_data(2), []);
        assert!(acks.is_complete());
        assert!(!acks.build_ack().has_errors());
    }

    #[test]
    fn test_safe_data_counts_stored_copies() {
        let mut acks = ExpectedAcks::new(csn(), safe_data(4), [ReplicaId(10), ReplicaId(11), ReplicaId(12)]);
        assert!(!acks.process_ack(ReplicaId(10), &AckMsg::success(csn())));
        assert!(!acks.process_ack(ReplicaId(10), &AckMsg::success(csn())));
        assert!(acks.process_ack(ReplicaId(12), &AckMsg::success(csn())));
    }

    #[test]
    fn test_safe_read_waits_for_everyone() {
        let mut acks = ExpectedAcks::new(csn(), safe_read(), [ReplicaId(2), ReplicaId(3)]);
        assert!(!acks.process_ack(ReplicaId(2), &AckMsg::success(csn())));
        assert!(!acks.process_ack(ReplicaId(7), &AckMsg::success(csn())));

        let nack = AckMsg {
            csn: csn(),
            has_replay_error: true,
            ..Default::default()
        };
        assert!(acks.process_ack(ReplicaId(3), &nack));

        let merged = acks.build_ack();
        assert!(merged.has_replay_error);
        assert!(!merged.has_timeout);
        assert_eq!(merged.failed, vec![ReplicaId(3)]);
    }

    #[test]
    fn test_timeout_names_silent_servers() {
        let mut acks = ExpectedAcks::new(csn(), safe_read(), [ReplicaId(2), ReplicaId(3), ReplicaId(4)]);
        acks.process_ack(ReplicaId(3), &AckMsg::success(csn()));
        acks.process_ack(
            ReplicaId(4),
            &AckMsg {
                csn: csn(),
                has_wrong_status: true,
                failed: vec![ReplicaId(4)],
                ..Default::default()
            },
        );

        let ack = acks.build_timeout_ack();
        assert!(ack.has_timeout);
        assert!(ack.has_wrong_status);
        assert_eq!(ack.failed, vec![ReplicaId(2), ReplicaId(4)]);
    }
}
