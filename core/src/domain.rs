//! Replication domain
//!
//! One replicated suffix on one server. It owns the CSN generator, the
//! replay engine and both halves of assured replication, and runs three
//! kinds of tasks once started:
//! - a receiver decoding frames from the relay session; acks go straight to
//!   the send coordinator, updates into a bounded queue
//! - `replay_workers` workers draining that queue through the replay engine
//!   and answering Safe Read updates
//! - a ticker resolving held-back updates whose wait expired
//!
//! Engine calls wait on entry locks, so they run on tokio's blocking pool,
//! local writes included. The entry locks taken to apply a write are
//! released before the assured wait starts.

use crate::assured::{AssuredMetrics, AssuredResponder, AssuredSendCoordinator, AssuredSnapshot, PublishOutcome};
use crate::config::DomainConfig;
use crate::csn::{Clock, Csn, CsnGenerator, SystemClock};
use crate::dn::{Dn, Rdn};
use crate::historical::FakeOperation;
use crate::protocol::{ReplicationMsg, UpdateMsg};
use crate::replay::{ReplayEngine, ReplayOutcome, ReplayReport, ReplayStats};
use crate::storage::{EntryStore, MemoryStore};
use crate::syntax::SyntaxRegistry;
use crate::transport::{PeerSession, Topology};
use crate::types::{AttrDesc, Entry, GroupId, Modification, ReplicaId, ServerStatus};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the queue between the receiver and the replay workers
const REPLAY_QUEUE_SIZE: usize = 1024;

/// Result of a local write
///
/// The write is committed locally whatever `assured` says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub csn: Csn,
    /// Where the entry ended up
    pub dn: Dn,
    pub assured: PublishOutcome,
    pub warnings: Vec<String>,
}

/// Monitoring snapshot of a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStats {
    pub replica_id: ReplicaId,
    pub group_id: GroupId,
    pub status: ServerStatus,
    pub sent_updates: u64,
    pub received_updates: u64,
    pub replay: ReplayStats,
    pub assured: AssuredSnapshot,
}

/// Builds a [`ReplicationDomain`]; everything but the session has a default
pub struct DomainBuilder {
    config: DomainConfig,
    store: Arc<dyn EntryStore>,
    registry: Arc<SyntaxRegistry>,
    clock: Arc<dyn Clock>,
    topology: Topology,
}

impl DomainBuilder {
    pub fn new(config: DomainConfig) -> Self {
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
            registry: Arc::new(SyntaxRegistry::with_defaults()),
            clock: Arc::new(SystemClock),
            topology: Topology::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EntryStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_registry(mut self, registry: Arc<SyntaxRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Clock used for CSNs, holdback expiry and purging
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn build(self, session: Arc<dyn PeerSession>) -> Result<ReplicationDomain> {
        self.config.validate()?;
        let config = self.config;

        let generator = Arc::new(CsnGenerator::with_clock(config.replica_id, self.clock.clone()));
        let engine = Arc::new(
            ReplayEngine::new(self.store, self.registry, config.base_dn.clone())
                .with_solve_conflicts(config.solve_conflicts)
                .with_holdback(config.holdback_expiry_ms, config.max_holdback)
                .with_clock(self.clock),
        );
        let topology = Arc::new(RwLock::new(self.topology));
        let metrics = AssuredMetrics::new();
        let coordinator = AssuredSendCoordinator::new(
            config.replica_id,
            config.group_id,
            topology.clone(),
            metrics.clone(),
        );
        let responder = AssuredResponder::new(config.replica_id, config.group_id, metrics.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(ReplicationDomain {
            inner: Arc::new(DomainInner {
                config,
                generator,
                engine,
                session,
                topology,
                coordinator,
                responder,
                metrics,
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        })
    }
}

struct DomainInner {
    config: DomainConfig,
    generator: Arc<CsnGenerator>,
    engine: Arc<ReplayEngine>,
    session: Arc<dyn PeerSession>,
    topology: Arc<RwLock<Topology>>,
    coordinator: AssuredSendCoordinator,
    responder: AssuredResponder,
    metrics: AssuredMetrics,
    sent: AtomicU64,
    received: AtomicU64,
}

pub struct ReplicationDomain {
    inner: Arc<DomainInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl ReplicationDomain {
    pub fn builder(config: DomainConfig) -> DomainBuilder {
        DomainBuilder::new(config)
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.inner.config.replica_id
    }

    pub fn config(&self) -> &DomainConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &ReplayEngine {
        &self.inner.engine
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        self.inner.engine.store()
    }

    /// Spawn the receiver, the replay workers and the holdback ticker
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(Error::Replay(format!("domain {} already started", self.inner.config.base_dn)));
        }

        let (queue_tx, queue_rx) = mpsc::channel::<UpdateMsg>(REPLAY_QUEUE_SIZE);
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        tasks.push(tokio::spawn(receive_loop(
            self.inner.clone(),
            queue_tx,
            self.shutdown.subscribe(),
        )));

        for worker in 0..self.inner.config.replay_workers {
            let inner = self.inner.clone();
            let queue = queue_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = { queue.lock().await.recv().await };
                    match next {
                        Some(update) => inner.handle_update(update).await,
                        None => break,
                    }
                }
                debug!(worker, "Replay worker stopped");
            }));
        }

        tasks.push(tokio::spawn(expiry_loop(self.inner.clone(), self.shutdown.subscribe())));

        info!(
            replica = %self.inner.config.replica_id,
            base_dn = %self.inner.config.base_dn,
            workers = self.inner.config.replay_workers,
            "Replication domain started"
        );
        Ok(())
    }

    /// Stop the tasks; outstanding assured waits resolve as timeouts
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.inner.coordinator.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Domain task ended abnormally");
            }
        }
        info!(replica = %self.inner.config.replica_id, "Replication domain stopped");
    }

    /// Process one message as if it came from the session
    pub async fn handle_message(&self, msg: ReplicationMsg) {
        match msg {
            ReplicationMsg::Ack(ack) => {
                self.inner.coordinator.receive_ack(ack);
            }
            ReplicationMsg::Update(update) => {
                self.inner.received.fetch_add(1, Ordering::Relaxed);
                self.inner.handle_update(update).await;
            }
        }
    }

    /// Peer selection moved this replica to another relay
    pub fn update_topology(&self, topology: Topology) {
        info!(relay = ?topology.relay_id, group = ?topology.relay_group, "Topology changed");
        *self.inner.topology.write() = topology;
    }

    pub fn set_status(&self, status: ServerStatus) {
        self.inner.responder.set_status(status);
    }

    pub fn metrics(&self) -> DomainStats {
        let inner = &self.inner;
        DomainStats {
            replica_id: inner.config.replica_id,
            group_id: inner.config.group_id,
            status: inner.responder.status(),
            sent_updates: inner.sent.load(Ordering::Relaxed),
            received_updates: inner.received.load(Ordering::Relaxed),
            replay: inner.engine.stats(),
            assured: inner.metrics.snapshot(),
        }
    }

    pub async fn add(&self, dn: &Dn, attributes: Vec<(AttrDesc, Vec<String>)>) -> Result<WriteResult> {
        let dn = dn.clone();
        let (update, report) = self
            .inner
            .blocking(move |engine, generator| engine.local_add(generator, &dn, attributes))
            .await?;
        Ok(self.inner.publish(update, report).await)
    }

    pub async fn modify(&self, dn: &Dn, mods: Vec<Modification>) -> Result<WriteResult> {
        let dn = dn.clone();
        let (update, report) = self
            .inner
            .blocking(move |engine, generator| engine.local_modify(generator, &dn, mods))
            .await?;
        Ok(self.inner.publish(update, report).await)
    }

    pub async fn delete(&self, dn: &Dn, subtree: bool) -> Result<WriteResult> {
        let dn = dn.clone();
        let (update, report) = self
            .inner
            .blocking(move |engine, generator| engine.local_delete(generator, &dn, subtree))
            .await?;
        Ok(self.inner.publish(update, report).await)
    }

    pub async fn modify_dn(
        &self,
        dn: &Dn,
        new_rdn: Rdn,
        delete_old_rdn: bool,
        new_superior: Option<Dn>,
    ) -> Result<WriteResult> {
        let dn = dn.clone();
        let (update, report) = self
            .inner
            .blocking(move |engine, generator| {
                engine.local_modify_dn(generator, &dn, new_rdn, delete_old_rdn, new_superior)
            })
            .await?;
        Ok(self.inner.publish(update, report).await)
    }

    pub fn read(&self, dn: &Dn) -> Result<Option<Entry>> {
        self.store().read_entry(dn)
    }

    /// Drop historical tuples older than the configured purge delay
    pub fn purge_historical(&self, dn: &Dn) -> Result<usize> {
        self.inner
            .engine
            .purge_historical(dn, self.inner.config.purge_delay_ms)
    }

    /// Purge every entry and forget old tombstones
    pub fn purge_all(&self) -> Result<usize> {
        self.inner.engine.purge_all(self.inner.config.purge_delay_ms)
    }

    pub fn fake_operations(&self, dn: &Dn) -> Result<Vec<FakeOperation>> {
        self.inner.engine.fake_operations(dn)
    }

    pub fn recovery_operations(&self, since: Option<Csn>) -> Result<Vec<FakeOperation>> {
        self.inner.engine.recovery_operations(since)
    }
}

impl DomainInner {
    fn relay_group(&self) -> GroupId {
        self.topology
            .read()
            .relay_group
            .unwrap_or_else(|| self.session.session_group_id())
    }

    /// Run engine work on the blocking pool
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&ReplayEngine, &CsnGenerator) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        let generator = self.generator.clone();
        tokio::task::spawn_blocking(move || work(&engine, &generator))
            .await
            .map_err(|e| Error::Replay(format!("replay task failed: {}", e)))?
    }

    async fn publish(&self, update: UpdateMsg, report: ReplayReport) -> WriteResult {
        let csn = update.csn();
        let uuid = update.uuid();
        let dn = self
            .engine
            .store()
            .read_by_uuid(&uuid)
            .ok()
            .flatten()
            .map(|e| e.dn)
            .unwrap_or_else(|| update.dn().clone());

        let assured = self
            .coordinator
            .publish(self.session.as_ref(), update, &self.config.assured)
            .await;
        self.sent.fetch_add(1, Ordering::Relaxed);
        if assured.is_error() {
            warn!(csn = %csn, dn = %dn, outcome = ?assured, "Local write committed, assured replication failed");
        }

        WriteResult {
            csn,
            dn,
            assured,
            warnings: report.warnings,
        }
    }

    /// Replay a remote update and whatever it releases from the holdback
    async fn handle_update(&self, update: UpdateMsg) {
        self.generator.adjust(&update.csn());

        let mut queue = VecDeque::from([update]);
        while let Some(update) = queue.pop_front() {
            let result = self.replay(&update).await;
            self.settle(&update, result, &mut queue).await;
        }
    }

    async fn replay(&self, update: &UpdateMsg) -> Result<ReplayReport> {
        let update = update.clone();
        self.blocking(move |engine, _| engine.replay(&update)).await
    }

    async fn settle(&self, update: &UpdateMsg, result: Result<ReplayReport>, queue: &mut VecDeque<UpdateMsg>) {
        let replay_error = match result {
            Ok(report) if report.outcome == ReplayOutcome::HeldBack => return,
            Ok(report) => {
                for warning in &report.warnings {
                    debug!(csn = %report.csn, warning = %warning, "Replay note");
                }
                queue.extend(report.released);
                None
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(ack) = self
            .responder
            .respond(update, replay_error.as_deref(), self.relay_group())
        {
            if let Err(e) = self.session.publish(ReplicationMsg::Ack(ack)).await {
                error!(csn = %update.csn(), error = %e, "Failed to send ack");
            }
        }
    }

    async fn expire_holdback(&self) {
        let expired = match self.blocking(|engine, _| Ok(engine.expire_holdback())).await {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "Holdback expiry failed");
                return;
            }
        };
        let mut queue = VecDeque::new();
        for (update, result) in expired {
            self.settle(&update, result, &mut queue).await;
        }
        while let Some(update) = queue.pop_front() {
            let result = self.replay(&update).await;
            self.settle(&update, result, &mut queue).await;
        }
    }
}

async fn receive_loop(
    inner: Arc<DomainInner>,
    queue: mpsc::Sender<UpdateMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            received = inner.session.receive() => received,
            _ = shutdown.changed() => break,
        };
        match received {
            Ok(Some(ReplicationMsg::Ack(ack))) => {
                inner.coordinator.receive_ack(ack);
            }
            Ok(Some(ReplicationMsg::Update(update))) => {
                inner.received.fetch_add(1, Ordering::Relaxed);
                if queue.send(update).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                info!(replica = %inner.config.replica_id, "Relay session closed");
                break;
            }
            Err(e) => warn!(replica = %inner.config.replica_id, error = %e, "Dropping unreadable message"),
        }
    }
    debug!(replica = %inner.config.replica_id, "Receiver stopped");
}

async fn expiry_loop(inner: Arc<DomainInner>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis((inner.config.holdback_expiry_ms / 2).max(50));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => inner.expire_holdback().await,
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssuredConfig;
    use crate::protocol::{AckMsg, AddMsg, AssuredMode, AssuredRequest, ModifyMsg};
    use crate::types::EntryUuid;
    use async_trait::async_trait;

    /// Session recording everything published, never delivering anything
    #[derive(Default)]
    struct SinkSession {
        sent: Mutex<Vec<ReplicationMsg>>,
    }

    #[async_trait]
    impl PeerSession for SinkSession {
        async fn publish(&self, msg: ReplicationMsg) -> Result<()> {
            self.sent.lock().push(msg);
            Ok(())
        }

        async fn receive(&self) -> Result<Option<ReplicationMsg>> {
            std::future::pending().await
        }

        fn session_group_id(&self) -> GroupId {
            GroupId(1)
        }
    }

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn config() -> DomainConfig {
        DomainConfig::new(dn("dc=example"), ReplicaId(1))
    }

    fn object_class(value: &str) -> Vec<(AttrDesc, Vec<String>)> {
        vec![(AttrDesc::new("objectClass"), vec![value.to_string()])]
    }

    #[tokio::test]
    async fn test_local_write_published() {
        let session = Arc::new(SinkSession::default());
        let domain = ReplicationDomain::builder(config()).build(session.clone()).unwrap();

        let result = domain.add(&dn("dc=example"), object_class("domain")).await.unwrap();
        assert_eq!(result.assured, PublishOutcome::NotAssured);
        assert_eq!(result.dn, dn("dc=example"));

        let sent = session.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], ReplicationMsg::Update(UpdateMsg::Add(add)) if add.csn == result.csn));
        assert_eq!(domain.metrics().sent_updates, 1);
    }

    #[tokio::test]
    async fn test_rejected_write_not_published() {
        let session = Arc::new(SinkSession::default());
        let domain = ReplicationDomain::builder(config()).build(session.clone()).unwrap();

        let err = domain.delete(&dn("cn=missing,dc=example"), false).await.unwrap_err();
        assert!(matches!(err, Error::NoSuchEntry(_)));
        assert!(session.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remote_update_adjusts_generator_and_acks_safe_read() {
        let session = Arc::new(SinkSession::default());
        let domain = ReplicationDomain::builder(config()).build(session.clone()).unwrap();

        let remote = Csn::new(u64::MAX / 2, 7, ReplicaId(2));
        domain
            .handle_message(ReplicationMsg::Update(UpdateMsg::Add(AddMsg {
                csn: remote,
                dn: dn("dc=example"),
                uuid: EntryUuid::new(),
                parent_uuid: None,
                object_classes: vec!["domain".to_string()],
                attributes: vec![],
                assured: Some(AssuredRequest {
                    mode: AssuredMode::SafeRead,
                    safe_data_level: 1,
                }),
            })))
            .await;

        assert!(matches!(
            session.sent.lock().last(),
            Some(ReplicationMsg::Ack(ack)) if *ack == AckMsg::success(remote)
        ));

        let local = domain
            .add(&dn("cn=x,dc=example"), object_class("person"))
            .await
            .unwrap();
        assert!(local.csn > remote);
        assert_eq!(domain.metrics().received_updates, 1);
    }

    #[tokio::test]
    async fn test_wrong_status_reported() {
        let session = Arc::new(SinkSession::default());
        let domain = ReplicationDomain::builder(config()).build(session.clone()).unwrap();
        domain.set_status(ServerStatus::FullUpdate);

        let csn = Csn::new(10, 0, ReplicaId(2));
        domain
            .handle_message(ReplicationMsg::Update(UpdateMsg::Add(AddMsg {
                csn,
                dn: dn("dc=example"),
                uuid: EntryUuid::new(),
                parent_uuid: None,
                object_classes: vec!["domain".to_string()],
                attributes: vec![],
                assured: Some(AssuredRequest {
                    mode: AssuredMode::SafeRead,
                    safe_data_level: 1,
                }),
            })))
            .await;

        match session.sent.lock().last() {
            Some(ReplicationMsg::Ack(ack)) => {
                assert!(ack.has_wrong_status);
                assert_eq!(ack.failed, vec![ReplicaId(1)]);
            }
            other => panic!("expected an ack, got {:?}", other),
        }
        assert_eq!(domain.metrics().status, ServerStatus::FullUpdate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assured_timeout_keeps_local_write() {
        let session = Arc::new(SinkSession::default());
        let config = config().with_assured(AssuredConfig::safe_read(Duration::from_millis(1_000)));
        let domain = ReplicationDomain::builder(config)
            .with_topology(Topology::new(ReplicaId(50), GroupId(1)))
            .build(session)
            .unwrap();

        let result = domain.add(&dn("dc=example"), object_class("domain")).await.unwrap();
        assert_eq!(result.assured, PublishOutcome::TimedOut { failed: vec![ReplicaId(50)] });
        assert!(domain.read(&dn("dc=example")).unwrap().is_some());
        assert_eq!(domain.metrics().assured.safe_read.timeout, 1);
    }

    #[tokio::test]
    async fn test_replay_waiting_on_entry_lock_leaves_runtime_free() {
        let session = Arc::new(SinkSession::default());
        let domain = Arc::new(ReplicationDomain::builder(config()).build(session).unwrap());
        domain.add(&dn("dc=example"), object_class("domain")).await.unwrap();
        let suffix = domain.read(&dn("dc=example")).unwrap().unwrap();

        let held = domain.engine().locks().acquire([suffix.uuid.to_string()]);
        let replay = tokio::spawn({
            let domain = domain.clone();
            async move {
                domain
                    .handle_message(ReplicationMsg::Update(UpdateMsg::Modify(ModifyMsg {
                        csn: Csn::new(u64::MAX / 2, 0, ReplicaId(2)),
                        dn: dn("dc=example"),
                        mods: vec![Modification::replace("description", &["d"])],
                        uuid: suffix.uuid,
                        assured: None,
                    })))
                    .await
            }
        });

        // Single-threaded runtime: this only wakes if the replay is not
        // parked on the runtime thread
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!replay.is_finished());

        drop(held);
        replay.await.unwrap();
        let suffix = domain.read(&dn("dc=example")).unwrap().unwrap();
        assert_eq!(suffix.first_value("description"), Some("d"));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let domain = ReplicationDomain::builder(config())
            .build(Arc::new(SinkSession::default()))
            .unwrap();
        domain.start().unwrap();
        assert!(domain.start().is_err());
        domain.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ReplicationDomain::builder(config().with_replay_workers(0)).build(Arc::new(SinkSession::default()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
