//! Assured send coordinator
//!
//! Every assured update moves through `Created -> Sent -> {Acked, Nacked,
//! TimedOut}`. The writer parks on an [`AckDeadline`]: a single-fire signal
//! plus the instant at which it gives up. Whichever side removes the
//! update from the pending map (ack delivery or expiry) owns the final
//! transition, so counters move exactly once and a late ack finds nothing.

use super::metrics::AssuredMetrics;
use crate::config::AssuredConfig;
use crate::csn::Csn;
use crate::protocol::{AckMsg, AssuredMode, AssuredRequest, ReplicationMsg, UpdateMsg};
use crate::transport::{PeerSession, Topology};
use crate::types::{GroupId, ReplicaId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a published assured update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssuredState {
    Created,
    Sent,
    Acked,
    Nacked,
    TimedOut,
}

/// What the writer learns about the replication of its update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishOutcome {
    /// Assured replication is off, or Safe Data level 1
    NotAssured,
    /// The relay belongs to another group, nothing was waited for
    CrossGroup,
    Acknowledged,
    Nacked {
        has_timeout: bool,
        has_replay_error: bool,
        has_wrong_status: bool,
        failed: Vec<ReplicaId>,
    },
    TimedOut {
        failed: Vec<ReplicaId>,
    },
}

impl PublishOutcome {
    fn from_ack(ack: AckMsg) -> Self {
        if !ack.has_errors() {
            return PublishOutcome::Acknowledged;
        }
        PublishOutcome::Nacked {
            has_timeout: ack.has_timeout,
            has_replay_error: ack.has_replay_error,
            has_wrong_status: ack.has_wrong_status,
            failed: ack.failed,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PublishOutcome::Nacked { .. } | PublishOutcome::TimedOut { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PublishOutcome::TimedOut { .. } | PublishOutcome::Nacked { has_timeout: true, .. }
        )
    }

    /// Servers blamed for the failure
    pub fn failed(&self) -> &[ReplicaId] {
        match self {
            PublishOutcome::Nacked { failed, .. } | PublishOutcome::TimedOut { failed } => failed,
            _ => &[],
        }
    }

    /// Final state of the update, `None` when it was never assured
    pub fn state(&self) -> Option<AssuredState> {
        match self {
            PublishOutcome::NotAssured | PublishOutcome::CrossGroup => None,
            PublishOutcome::Acknowledged => Some(AssuredState::Acked),
            PublishOutcome::Nacked { .. } => Some(AssuredState::Nacked),
            PublishOutcome::TimedOut { .. } => Some(AssuredState::TimedOut),
        }
    }
}

/// The writer's side of a pending assured update
#[derive(Debug)]
pub struct AckDeadline {
    csn: Csn,
    deadline: Instant,
    signal: oneshot::Receiver<AckMsg>,
}

impl AckDeadline {
    pub fn csn(&self) -> Csn {
        self.csn
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Wait for the ack; `None` when the deadline passes or on shutdown
    pub async fn wait(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<AckMsg> {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            ack = &mut self.signal => ack.ok(),
            _ = tokio::time::sleep_until(self.deadline) => None,
            _ = shutdown.changed() => None,
        }
    }

    /// Ack delivered while the waiter was giving up
    fn try_take(&mut self) -> Option<AckMsg> {
        self.signal.try_recv().ok()
    }
}

struct PendingAssured {
    mode: AssuredMode,
    state: AssuredState,
    signal: oneshot::Sender<AckMsg>,
}

pub struct AssuredSendCoordinator {
    replica_id: ReplicaId,
    group_id: GroupId,
    topology: Arc<RwLock<Topology>>,
    pending: Mutex<HashMap<Csn, PendingAssured>>,
    metrics: AssuredMetrics,
    shutdown: watch::Sender<bool>,
}

impl AssuredSendCoordinator {
    pub fn new(
        replica_id: ReplicaId,
        group_id: GroupId,
        topology: Arc<RwLock<Topology>>,
        metrics: AssuredMetrics,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            replica_id,
            group_id,
            topology,
            pending: Mutex::new(HashMap::new()),
            metrics,
            shutdown,
        }
    }

    pub fn metrics(&self) -> &AssuredMetrics {
        &self.metrics
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_state(&self, csn: &Csn) -> Option<AssuredState> {
        self.pending.lock().get(csn).map(|p| p.state)
    }

    /// Publish `update` and, when assured, wait for its acknowledgement
    pub async fn publish(
        &self,
        session: &dyn PeerSession,
        mut update: UpdateMsg,
        config: &AssuredConfig,
    ) -> PublishOutcome {
        let Some(request) = config.request().filter(needs_ack) else {
            update.set_assured(None);
            self.send(session, update).await;
            return PublishOutcome::NotAssured;
        };

        let relay_group = self
            .topology
            .read()
            .relay_group
            .unwrap_or_else(|| session.session_group_id());
        if relay_group != self.group_id {
            debug!(csn = %update.csn(), relay_group = %relay_group, group = %self.group_id, "Relay in another group, not waiting for ack");
            update.set_assured(None);
            self.send(session, update).await;
            return PublishOutcome::CrossGroup;
        }

        let csn = update.csn();
        update.set_assured(Some(request));
        let mut deadline = self.register(csn, request.mode, config.timeout());

        let sent = session.publish(ReplicationMsg::Update(update)).await;
        self.mark_sent(&csn, request.mode);
        if let Err(e) = sent {
            error!(csn = %csn, error = %e, "Failed to publish assured update");
            return self.expire(&mut deadline);
        }

        let mut shutdown = self.shutdown.subscribe();
        match deadline.wait(&mut shutdown).await {
            Some(ack) => PublishOutcome::from_ack(ack),
            None => self.expire(&mut deadline),
        }
    }

    /// Deliver an ack to its waiting writer, returns false for late or
    /// unknown acks
    pub fn receive_ack(&self, ack: AckMsg) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.remove(&ack.csn) else {
            debug!(csn = %ack.csn, "Dropping ack with no waiting update");
            return false;
        };

        self.metrics.record_ack(entry.mode, &ack);
        if ack.has_errors() {
            info!(
                csn = %ack.csn,
                mode = %entry.mode,
                timeout = ack.has_timeout,
                replay_error = ack.has_replay_error,
                wrong_status = ack.has_wrong_status,
                failed = ?ack.failed,
                "Assured update not acknowledged by every server"
            );
        }
        // The waiter may already be gone through shutdown
        let _ = entry.signal.send(ack);
        true
    }

    /// Resolve every outstanding wait as a timeout
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn register(&self, csn: Csn, mode: AssuredMode, timeout: Duration) -> AckDeadline {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            csn,
            PendingAssured {
                mode,
                state: AssuredState::Created,
                signal: tx,
            },
        );
        AckDeadline {
            csn,
            deadline: Instant::now() + timeout,
            signal: rx,
        }
    }

    fn mark_sent(&self, csn: &Csn, mode: AssuredMode) {
        if let Some(pending) = self.pending.lock().get_mut(csn) {
            pending.state = AssuredState::Sent;
        }
        self.metrics.record_sent(mode);
    }

    fn expire(&self, deadline: &mut AckDeadline) -> PublishOutcome {
        let removed = self.pending.lock().remove(&deadline.csn);
        match removed {
            Some(pending) => {
                let failed: Vec<ReplicaId> = self.topology.read().relay_id.into_iter().collect();
                self.metrics.record_timeout(pending.mode, &failed);
                warn!(
                    csn = %deadline.csn,
                    replica = %self.replica_id,
                    mode = %pending.mode,
                    failed = ?failed,
                    "No ack received for assured update"
                );
                PublishOutcome::TimedOut { failed }
            }
            // The ack won the race: receive_ack sends before releasing the map
            None => deadline
                .try_take()
                .map(PublishOutcome::from_ack)
                .unwrap_or(PublishOutcome::TimedOut { failed: Vec::new() }),
        }
    }

    async fn send(&self, session: &dyn PeerSession, update: UpdateMsg) {
        let csn = update.csn();
        if let Err(e) = session.publish(ReplicationMsg::Update(update)).await {
            error!(csn = %csn, error = %e, "Failed to publish update");
        }
    }
}

/// Safe Data level 1 is met by the writer alone
fn needs_ack(request: &AssuredRequest) -> bool {
    !(request.mode == AssuredMode::SafeData && request.safe_data_level <= 1)
}
