//! In-process relay
//!
//! Fans updates out between the domains connected to it and aggregates
//! assured acknowledgements the way a replication server does. Frames are
//! CBOR-encoded exactly as they would be on a socket. Used by the
//! integration tests and the `dsync` binary.

use super::PeerSession;
use crate::assured::ExpectedAcks;
use crate::csn::Csn;
use crate::protocol::{AckMsg, AssuredMode, ReplicationMsg, UpdateMsg};
use crate::types::{GroupId, ReplicaId};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Frame = (ReplicaId, Bytes);

struct Peer {
    group: GroupId,
    tx: mpsc::UnboundedSender<Bytes>,
}

type Peers = Arc<Mutex<HashMap<ReplicaId, Peer>>>;

struct PendingAcks {
    expected: ExpectedAcks,
    origin: ReplicaId,
    deadline: Instant,
}

/// Relay running as a task inside the current runtime
pub struct LocalRelay {
    relay_id: ReplicaId,
    group_id: GroupId,
    peers: Peers,
    inbound: mpsc::UnboundedSender<Frame>,
    task: JoinHandle<()>,
}

impl LocalRelay {
    /// Start the relay; `ack_timeout` bounds how long it waits for the
    /// servers an assured update needs
    pub fn start(relay_id: ReplicaId, group_id: GroupId, ack_timeout: Duration) -> Self {
        let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
        let (inbound, rx) = mpsc::unbounded_channel();
        let router = Router {
            relay_id,
            group_id,
            peers: peers.clone(),
            pending: HashMap::new(),
            ack_timeout,
        };
        let task = tokio::spawn(router.run(rx));
        info!(relay = %relay_id, group = %group_id, "Local relay started");

        Self {
            relay_id,
            group_id,
            peers,
            inbound,
            task,
        }
    }

    pub fn relay_id(&self) -> ReplicaId {
        self.relay_id
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Attach a directory server
    pub fn connect(&self, replica_id: ReplicaId, group: GroupId) -> LocalSession {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(replica_id, Peer { group, tx });
        debug!(relay = %self.relay_id, replica = %replica_id, group = %group, "Server connected to local relay");

        LocalSession {
            replica_id,
            relay_group: self.group_id,
            to_relay: self.inbound.clone(),
            from_relay: tokio::sync::Mutex::new(rx),
        }
    }

    /// Detach a server; its session sees end of stream
    pub fn disconnect(&self, replica_id: ReplicaId) {
        self.peers.lock().remove(&replica_id);
    }

    pub fn connected(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<_> = self.peers.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Drop for LocalRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Router {
    relay_id: ReplicaId,
    group_id: GroupId,
    peers: Peers,
    pending: HashMap<Csn, PendingAcks>,
    ack_timeout: Duration,
}

impl Router {
    async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        loop {
            let next = self.pending.values().map(|p| p.deadline).min();
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some((from, bytes)) => self.route(from, bytes),
                    None => break,
                },
                _ = wait_until(next) => self.expire(Instant::now()),
            }
        }
        debug!(relay = %self.relay_id, "Local relay stopped");
    }

    fn route(&mut self, from: ReplicaId, bytes: Bytes) {
        match ReplicationMsg::decode(&bytes) {
            Ok(ReplicationMsg::Update(update)) => self.forward(from, update, bytes),
            Ok(ReplicationMsg::Ack(ack)) => self.collect(from, ack),
            Err(e) => warn!(relay = %self.relay_id, from = %from, error = %e, "Dropping undecodable frame"),
        }
    }

    fn forward(&mut self, from: ReplicaId, update: UpdateMsg, bytes: Bytes) {
        let csn = update.csn();
        let (sender_group, targets) = {
            let peers = self.peers.lock();
            for (id, peer) in peers.iter().filter(|(id, _)| **id != from) {
                if peer.tx.send(bytes.clone()).is_err() {
                    debug!(relay = %self.relay_id, replica = %id, "Peer session closed");
                }
            }
            let sender_group = peers.get(&from).map(|p| p.group);
            let targets: Vec<ReplicaId> = peers
                .iter()
                .filter(|(id, peer)| **id != from && peer.group == self.group_id)
                .map(|(id, _)| *id)
                .collect();
            (sender_group, targets)
        };

        let Some(request) = update.assured() else {
            return;
        };
        if sender_group != Some(self.group_id) {
            return;
        }

        // Directory servers never answer Safe Data; there are no peer relays here
        let expected = match request.mode {
            AssuredMode::SafeRead => targets,
            AssuredMode::SafeData => Vec::new(),
        };
        let acks = ExpectedAcks::new(csn, request, expected);
        if acks.is_complete() {
            self.answer(from, acks.build_ack());
            return;
        }
        self.pending.insert(
            csn,
            PendingAcks {
                expected: acks,
                origin: from,
                deadline: Instant::now() + self.ack_timeout,
            },
        );
    }

    fn collect(&mut self, from: ReplicaId, ack: AckMsg) {
        let Some(pending) = self.pending.get_mut(&ack.csn) else {
            debug!(relay = %self.relay_id, csn = %ack.csn, from = %from, "Ack for unknown update");
            return;
        };
        if !pending.expected.process_ack(from, &ack) {
            return;
        }
        if let Some(done) = self.pending.remove(&ack.csn) {
            self.answer(done.origin, done.expected.build_ack());
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<Csn> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(csn, _)| *csn)
            .collect();
        for csn in expired {
            if let Some(done) = self.pending.remove(&csn) {
                let ack = done.expected.build_timeout_ack();
                warn!(relay = %self.relay_id, csn = %csn, failed = ?ack.failed, "Assured update timed out at relay");
                self.answer(done.origin, ack);
            }
        }
    }

    fn answer(&self, to: ReplicaId, ack: AckMsg) {
        let bytes = match ReplicationMsg::Ack(ack).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(relay = %self.relay_id, error = %e, "Failed to encode ack");
                return;
            }
        };
        if let Some(peer) = self.peers.lock().get(&to) {
            let _ = peer.tx.send(bytes);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A directory server's end of a [`LocalRelay`]
pub struct LocalSession {
    replica_id: ReplicaId,
    relay_group: GroupId,
    to_relay: mpsc::UnboundedSender<Frame>,
    from_relay: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl LocalSession {
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }
}

#[async_trait]
impl PeerSession for LocalSession {
    async fn publish(&self, msg: ReplicationMsg) -> Result<()> {
        let bytes = msg.encode()?;
        self.to_relay
            .send((self.replica_id, bytes))
            .map_err(|_| Error::Transport("local relay has stopped".to_string()))
    }

    async fn receive(&self) -> Result<Option<ReplicationMsg>> {
        let frame = self.from_relay.lock().await.recv().await;
        frame.map(|bytes| ReplicationMsg::decode(&bytes)).transpose()
    }

    fn session_group_id(&self) -> GroupId {
        self.relay_group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::protocol::{AssuredRequest, DeleteMsg};
    use crate::types::EntryUuid;

    fn update(assured: Option<AssuredRequest>) -> UpdateMsg {
        UpdateMsg::Delete(DeleteMsg {
            csn: Csn::new(10, 0, ReplicaId(1)),
            dn: Dn::parse("cn=x,dc=example").unwrap(),
            uuid: EntryUuid::new(),
            subtree: false,
            assured,
        })
    }

    fn safe_read() -> Option<AssuredRequest> {
        Some(AssuredRequest {
            mode: AssuredMode::SafeRead,
            safe_data_level: 1,
        })
    }

    async fn next_ack(session: &LocalSession) -> AckMsg {
        match session.receive().await.unwrap() {
            Some(ReplicationMsg::Ack(ack)) => ack,
            other => panic!("expected an ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_updates_fan_out() {
        let relay = LocalRelay::start(ReplicaId(100), GroupId(1), Duration::from_secs(1));
        let a = relay.connect(ReplicaId(1), GroupId(1));
        let b = relay.connect(ReplicaId(2), GroupId(1));
        let c = relay.connect(ReplicaId(3), GroupId(2));

        let sent = update(None);
        a.publish(ReplicationMsg::Update(sent.clone())).await.unwrap();
        for session in [&b, &c] {
            match session.receive().await.unwrap() {
                Some(ReplicationMsg::Update(received)) => assert_eq!(received, sent),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(relay.connected(), vec![ReplicaId(1), ReplicaId(2), ReplicaId(3)]);
        assert_eq!(a.session_group_id(), GroupId(1));
    }

    #[tokio::test]
    async fn test_safe_data_level_two_acked_by_relay() {
        let relay = LocalRelay::start(ReplicaId(100), GroupId(1), Duration::from_secs(1));
        let a = relay.connect(ReplicaId(1), GroupId(1));
        let _b = relay.connect(ReplicaId(2), GroupId(1));

        let request = AssuredRequest {
            mode: AssuredMode::SafeData,
            safe_data_level: 2,
        };
        a.publish(ReplicationMsg::Update(update(Some(request)))).await.unwrap();
        let ack = next_ack(&a).await;
        assert_eq!(ack.csn, update(None).csn());
        assert!(!ack.has_errors());
    }

    #[tokio::test]
    async fn test_safe_read_waits_for_servers() {
        let relay = LocalRelay::start(ReplicaId(100), GroupId(1), Duration::from_secs(5));
        let a = relay.connect(ReplicaId(1), GroupId(1));
        let b = relay.connect(ReplicaId(2), GroupId(1));
        let c = relay.connect(ReplicaId(3), GroupId(1));

        let sent = update(safe_read());
        a.publish(ReplicationMsg::Update(sent.clone())).await.unwrap();
        for session in [&b, &c] {
            assert!(matches!(session.receive().await.unwrap(), Some(ReplicationMsg::Update(_))));
        }

        b.publish(ReplicationMsg::Ack(AckMsg::success(sent.csn()))).await.unwrap();
        c.publish(ReplicationMsg::Ack(AckMsg {
            csn: sent.csn(),
            has_replay_error: true,
            failed: vec![ReplicaId(3)],
            ..Default::default()
        }))
        .await
        .unwrap();

        let ack = next_ack(&a).await;
        assert!(ack.has_replay_error);
        assert_eq!(ack.failed, vec![ReplicaId(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_timeout_names_silent_server() {
        let relay = LocalRelay::start(ReplicaId(100), GroupId(1), Duration::from_millis(500));
        let a = relay.connect(ReplicaId(1), GroupId(1));
        let _b = relay.connect(ReplicaId(2), GroupId(1));

        let start = Instant::now();
        a.publish(ReplicationMsg::Update(update(safe_read()))).await.unwrap();
        let ack = next_ack(&a).await;

        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(ack.has_timeout);
        assert_eq!(ack.failed, vec![ReplicaId(2)]);
    }

    #[tokio::test]
    async fn test_session_closed_after_disconnect() {
        let relay = LocalRelay::start(ReplicaId(100), GroupId(1), Duration::from_secs(1));
        let a = relay.connect(ReplicaId(1), GroupId(1));
        relay.disconnect(ReplicaId(1));
        assert!(a.receive().await.unwrap().is_none());
    }
}
