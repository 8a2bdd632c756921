//! Replay engine
//!
//! Applies replicated updates to the local store. Attribute-level changes
//! are arbitrated by the entry's historical record; naming operations go
//! through the conflict resolver.
//!
//! Locking: every update takes [`EntryLocks`] keys for what it touches and
//! nothing else, so updates of unrelated entries replay in parallel.
//! - MODIFY: the entry
//! - ADD: the entry, its parent (shared), and the name it takes with any
//!   occupant
//! - DELETE: the entry and its subtree, and the name it frees with the
//!   parked entries waiting for that name
//! - MODRDN: everything DELETE and ADD take, for the old and new name
//!
//! Keys are computed from the store before they are held, so they are
//! computed again once held and the set is widened until it stops growing.
//!
//! Updates whose target or parent is not known yet are parked in the
//! [`HoldbackQueue`] and handed back through [`ReplayReport::released`]
//! once the missing entry arrives or is deleted.

pub mod conflict;
pub mod holdback;
pub mod local;
pub mod locks;
pub mod tombstones;

pub use conflict::{conflict_dn, is_parked, natural_dn, naming_rdn, protect_rdn};
pub use holdback::{HoldbackQueue, MAX_HELD_UPDATES};
pub use locks::{EntryLockGuard, EntryLocks, LockSet};
pub use tombstones::{Tombstone, TombstoneSet};

use crate::csn::{Clock, Csn, SystemClock};
use crate::dn::{Dn, Rdn};
use crate::historical::{generate_fake_operations, sort_fake_operations, EntryHistorical, FakeOperation};
use crate::protocol::{AddMsg, DeleteMsg, ModifyDnMsg, ModifyMsg, UpdateMsg};
use crate::storage::EntryStore;
use crate::syntax::SyntaxRegistry;
use crate::types::{AttrDesc, Entry, EntryUuid, ModKind, Modification, ENTRY_UUID_ATTR, OBJECT_CLASS_ATTR};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What replaying one update did
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ReplayOutcome {
    Applied,
    /// Applied, but an entry had to be parked in the conflict namespace
    Parked,
    /// Nothing to do: duplicate, stale, or its target is gone
    Dropped,
    /// Waiting for an entry that has not arrived yet
    HeldBack,
}

#[derive(Clone, Debug)]
pub struct ReplayReport {
    pub csn: Csn,
    pub outcome: ReplayOutcome,
    /// Non-fatal notes: rewritten modifications, entries moved, empty objectClass
    pub warnings: Vec<String>,
    /// Held updates that became ready; replay them next
    pub released: Vec<UpdateMsg>,
}

impl ReplayReport {
    fn new(csn: Csn) -> Self {
        Self {
            csn,
            outcome: ReplayOutcome::Applied,
            warnings: Vec::new(),
            released: Vec::new(),
        }
    }

    fn with_outcome(mut self, outcome: ReplayOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

#[derive(Debug, Default)]
struct ReplayCounters {
    replayed: AtomicU64,
    resolved_naming: AtomicU64,
    unresolved_naming: AtomicU64,
    resolved_modify: AtomicU64,
    replay_errors: AtomicU64,
    held_back: AtomicU64,
}

/// Monitoring snapshot of the replay engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub replayed: u64,
    pub resolved_naming_conflicts: u64,
    pub unresolved_naming_conflicts: u64,
    pub resolved_modify_conflicts: u64,
    pub replay_errors: u64,
    pub held_back: u64,
    pub pending_holdback: usize,
    pub tombstones: usize,
}

/// Where the parent of an added or renamed entry stands
enum ParentLookup {
    Found(Dn),
    /// Deleted by a subtree delete newer than the update
    DeletedAfter(Csn),
    /// Gone for good; the entry becomes an orphan
    Orphaned,
    /// Not seen yet
    Pending(EntryUuid),
}

fn uuid_key(uuid: &EntryUuid) -> String {
    uuid.to_string()
}

fn dn_key(dn: &Dn) -> String {
    format!("dn:{}", dn.normalized())
}

pub struct ReplayEngine {
    store: Arc<dyn EntryStore>,
    registry: Arc<SyntaxRegistry>,
    base_dn: Dn,
    solve_conflicts: bool,
    clock: Arc<dyn Clock>,
    tombstones: Mutex<TombstoneSet>,
    holdback: Mutex<HoldbackQueue>,
    locks: EntryLocks,
    counters: ReplayCounters,
}

impl ReplayEngine {
    pub fn new(store: Arc<dyn EntryStore>, registry: Arc<SyntaxRegistry>, base_dn: Dn) -> Self {
        Self {
            store,
            registry,
            base_dn,
            solve_conflicts: true,
            clock: Arc::new(SystemClock),
            tombstones: Mutex::new(TombstoneSet::new()),
            holdback: Mutex::new(HoldbackQueue::new(30_000, MAX_HELD_UPDATES)),
            locks: EntryLocks::new(),
            counters: ReplayCounters::default(),
        }
    }

    pub fn with_solve_conflicts(mut self, solve_conflicts: bool) -> Self {
        self.solve_conflicts = solve_conflicts;
        self
    }

    pub fn with_holdback(mut self, expiry_ms: u64, capacity: usize) -> Self {
        self.holdback = Mutex::new(HoldbackQueue::new(expiry_ms, capacity));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SyntaxRegistry> {
        &self.registry
    }

    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    pub(crate) fn locks(&self) -> &EntryLocks {
        &self.locks
    }

    pub fn stats(&self) -> ReplayStats {
        let c = &self.counters;
        ReplayStats {
            replayed: c.replayed.load(Ordering::Relaxed),
            resolved_naming_conflicts: c.resolved_naming.load(Ordering::Relaxed),
            unresolved_naming_conflicts: c.unresolved_naming.load(Ordering::Relaxed),
            resolved_modify_conflicts: c.resolved_modify.load(Ordering::Relaxed),
            replay_errors: c.replay_errors.load(Ordering::Relaxed),
            held_back: c.held_back.load(Ordering::Relaxed),
            pending_holdback: self.holdback.lock().len(),
            tombstones: self.tombstones.lock().len(),
        }
    }

    pub fn tombstone(&self, uuid: &EntryUuid) -> Option<Tombstone> {
        self.tombstones.lock().get(uuid).cloned()
    }

    /// Replay one update received from another replica
    pub fn replay(&self, update: &UpdateMsg) -> Result<ReplayReport> {
        self.replay_with(update, false)
    }

    /// Resolve held updates whose wait expired
    ///
    /// An expired ADD is created as an orphan, an expired MODRDN marks its
    /// entry as conflicting, anything else is dropped.
    pub fn expire_holdback(&self) -> Vec<(UpdateMsg, Result<ReplayReport>)> {
        let expired = self.holdback.lock().expire(self.clock.now_millis());
        expired
            .into_iter()
            .map(|(update, waiting_on)| {
                warn!(csn = %update.csn(), kind = update.kind_name(), waiting_on = %waiting_on, "Held update expired");
                let result = self.replay_with(&update, true);
                (update, result)
            })
            .collect()
    }

    fn replay_with(&self, update: &UpdateMsg, expired: bool) -> Result<ReplayReport> {
        let result = self
            .lock_keys(|| self.update_keys(update))
            .and_then(|_guard| match update {
                UpdateMsg::Modify(msg) => self.apply_modify(msg, expired),
                UpdateMsg::Add(msg) => self.apply_add(msg, expired),
                UpdateMsg::Delete(msg) => self.apply_delete(msg),
                UpdateMsg::ModifyDn(msg) => self.apply_modify_dn(msg, expired),
            });

        match &result {
            Ok(report) if report.outcome == ReplayOutcome::HeldBack => {}
            Ok(report) => {
                self.counters.replayed.fetch_add(1, Ordering::Relaxed);
                debug!(csn = %report.csn, kind = update.kind_name(), outcome = ?report.outcome, "Update replayed");
            }
            Err(e) => {
                self.counters.replay_errors.fetch_add(1, Ordering::Relaxed);
                error!(csn = %update.csn(), dn = %update.dn(), error = %e, "Replay failed");
            }
        }
        result
    }

    /// Take the keys `keys_for` asks for, then ask again while holding
    /// them; retry with the union until nothing new is asked for
    fn lock_keys<F>(&self, keys_for: F) -> Result<EntryLockGuard<'_>>
    where
        F: Fn() -> Result<LockSet>,
    {
        let mut keys = keys_for()?;
        loop {
            let guard = self.locks.acquire_set(keys.clone());
            let needed = keys_for()?;
            if needed.is_subset(&keys) {
                return Ok(guard);
            }
            drop(guard);
            keys.extend(needed);
        }
    }

    fn update_keys(&self, update: &UpdateMsg) -> Result<LockSet> {
        let mut keys = LockSet::new();
        keys.exclusive(uuid_key(&update.uuid()));
        match update {
            UpdateMsg::Modify(_) => {}
            UpdateMsg::Add(msg) => {
                keys.exclusive(dn_key(&msg.dn));
                let parent = self.parent_keys(msg.parent_uuid, msg.dn.parent(), &mut keys)?;
                if let (Some(parent), Some(rdn)) = (parent, msg.dn.rdn()) {
                    self.claim_keys(&parent.child(rdn.clone()), &mut keys)?;
                }
            }
            UpdateMsg::Delete(msg) => {
                if let Some(entry) = self.store.read_by_uuid(&msg.uuid)? {
                    self.delete_keys(&entry, &mut keys)?;
                }
            }
            UpdateMsg::ModifyDn(msg) => {
                keys.exclusive(dn_key(&msg.new_dn()));
                if let Some(entry) = self.store.read_by_uuid(&msg.uuid)? {
                    let fallback = msg.new_superior.clone().or_else(|| natural_dn(&entry).parent());
                    self.rename_keys(&entry, msg.new_parent_uuid, fallback, &msg.new_rdn, &mut keys)?;
                }
            }
        }
        Ok(keys)
    }

    /// An entry and everything below it
    fn subtree_keys(&self, entry: &Entry, keys: &mut LockSet) -> Result<()> {
        keys.exclusive(uuid_key(&entry.uuid));
        keys.exclusive(dn_key(&entry.dn));
        for below in self.store.subtree(&entry.dn)? {
            keys.exclusive(uuid_key(&below.uuid));
        }
        Ok(())
    }

    /// A name about to be taken; its holder may get parked
    fn claim_keys(&self, dn: &Dn, keys: &mut LockSet) -> Result<()> {
        keys.exclusive(dn_key(dn));
        if let Some(occupant) = self.store.read_entry(dn)? {
            self.subtree_keys(&occupant, keys)?;
        }
        Ok(())
    }

    /// A name about to be freed; a parked entry may move back to it
    fn release_keys(&self, dn: &Dn, keys: &mut LockSet) -> Result<()> {
        keys.exclusive(dn_key(dn));
        for parked in self.store.find_conflicts(dn)? {
            self.subtree_keys(&parked, keys)?;
        }
        Ok(())
    }

    /// Parent of an added or moved entry, by uuid or else by DN, held
    /// shared so siblings can be added side by side
    fn parent_keys(
        &self,
        parent_uuid: Option<EntryUuid>,
        fallback: Option<Dn>,
        keys: &mut LockSet,
    ) -> Result<Option<Dn>> {
        let parent = match (parent_uuid, fallback) {
            (Some(uuid), _) => {
                keys.shared(uuid_key(&uuid));
                self.store.read_by_uuid(&uuid)?
            }
            (None, Some(dn)) => {
                keys.shared(dn_key(&dn));
                self.store.read_entry(&dn)?
            }
            (None, None) => None,
        };
        Ok(parent.map(|p| {
            keys.shared(uuid_key(&p.uuid));
            p.dn
        }))
    }

    fn delete_keys(&self, entry: &Entry, keys: &mut LockSet) -> Result<()> {
        self.subtree_keys(entry, keys)?;
        self.release_keys(&entry.dn, keys)
    }

    fn rename_keys(
        &self,
        entry: &Entry,
        new_parent_uuid: Option<EntryUuid>,
        fallback: Option<Dn>,
        new_rdn: &Rdn,
        keys: &mut LockSet,
    ) -> Result<()> {
        self.delete_keys(entry, keys)?;
        if let Some(parent) = self.parent_keys(new_parent_uuid, fallback, keys)? {
            self.claim_keys(&parent.child(new_rdn.clone()), keys)?;
        }
        Ok(())
    }

    fn hold(&self, update: UpdateMsg, waiting_on: EntryUuid) -> Result<ReplayReport> {
        let csn = update.csn();
        self.holdback
            .lock()
            .hold(update, waiting_on, self.clock.now_millis())?;
        self.counters.held_back.fetch_add(1, Ordering::Relaxed);
        debug!(csn = %csn, waiting_on = %waiting_on, "Update held back");
        Ok(ReplayReport::new(csn).with_outcome(ReplayOutcome::HeldBack))
    }

    fn load(&self, uuid: &EntryUuid) -> Result<Option<(Entry, EntryHistorical)>> {
        Ok(self.store.read_by_uuid(uuid)?.map(|entry| {
            let hist = EntryHistorical::from_entry(&entry, &self.registry);
            (entry, hist)
        }))
    }

    /// Find the parent an entry should live under
    ///
    /// `fallback` is the parent DN used when the update names no parent uuid.
    fn locate_parent(
        &self,
        parent_uuid: Option<EntryUuid>,
        fallback: Option<Dn>,
        csn: Csn,
        expired: bool,
    ) -> Result<ParentLookup> {
        let stone = match parent_uuid {
            Some(puuid) => {
                if let Some(parent) = self.store.read_by_uuid(&puuid)? {
                    return Ok(ParentLookup::Found(parent.dn));
                }
                let stone = self.tombstones.lock().get(&puuid).cloned();
                if stone.is_none() && !expired {
                    return Ok(ParentLookup::Pending(puuid));
                }
                stone
            }
            None => {
                let parent = fallback.unwrap_or_default();
                if !self.in_suffix(&parent) || self.store.read_entry(&parent)?.is_some() {
                    return Ok(ParentLookup::Found(parent));
                }
                self.tombstones.lock().find_by_dn(&parent).cloned()
            }
        };

        Ok(match stone {
            Some(t) if t.subtree && t.csn > csn => ParentLookup::DeletedAfter(t.csn),
            _ => ParentLookup::Orphaned,
        })
    }

    fn build_entry(&self, msg: &AddMsg, rdn: &Rdn) -> Entry {
        let mut entry = Entry::new(msg.dn.clone(), msg.uuid);
        entry.set_values(AttrDesc::new(OBJECT_CLASS_ATTR), msg.object_classes.clone());
        for (attr, values) in &msg.attributes {
            if attr.is_replication_internal() {
                continue;
            }
            for value in values {
                entry.add_value(attr, value, &self.registry);
            }
        }
        for ava in rdn.avas().iter().filter(|a| !a.is_type(ENTRY_UUID_ATTR)) {
            entry.add_value(&AttrDesc::new(ava.attr_type()), ava.value(), &self.registry);
        }
        entry
    }

    pub(crate) fn apply_add(&self, msg: &AddMsg, expired: bool) -> Result<ReplayReport> {
        let mut report = ReplayReport::new(msg.csn);

        if self.store.read_by_uuid(&msg.uuid)?.is_some() {
            debug!(csn = %msg.csn, uuid = %msg.uuid, "Entry already present, ADD dropped");
            return Ok(report.with_outcome(ReplayOutcome::Dropped));
        }
        if self.tombstones.lock().contains(&msg.uuid) {
            debug!(csn = %msg.csn, uuid = %msg.uuid, "Entry already deleted, ADD dropped");
            return Ok(report.with_outcome(ReplayOutcome::Dropped));
        }
        let rdn = msg
            .dn
            .rdn()
            .cloned()
            .ok_or_else(|| Error::InvalidDn("cannot add the root DN".to_string()))?;

        let natural = match self.locate_parent(msg.parent_uuid, msg.dn.parent(), msg.csn, expired)? {
            ParentLookup::Found(parent) => {
                let natural = parent.child(rdn.clone());
                if natural != msg.dn {
                    self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
                    info!(csn = %msg.csn, from = %msg.dn, to = %natural, "Parent renamed, ADD re-parented");
                }
                Some(natural)
            }
            ParentLookup::DeletedAfter(delete_csn) => {
                debug!(csn = %msg.csn, dn = %msg.dn, delete_csn = %delete_csn, "Parent removed by a newer subtree delete, ADD dropped");
                return Ok(report.with_outcome(ReplayOutcome::Dropped));
            }
            ParentLookup::Orphaned => None,
            ParentLookup::Pending(parent) => return self.hold(UpdateMsg::Add(msg.clone()), parent),
        };

        let mut entry = self.build_entry(msg, &rdn);
        EntryHistorical::for_add(msg.csn).store(&mut entry, &self.registry);

        match natural {
            None => {
                self.park(&mut entry, &msg.dn, false)?;
                report.outcome = ReplayOutcome::Parked;
            }
            Some(natural) => {
                entry.dn = natural.clone();
                match self.store.read_entry(&natural)? {
                    None => self.store.write_entry(&entry)?,
                    Some(mut occupant) => {
                        let occupant_hist = EntryHistorical::from_entry(&occupant, &self.registry);
                        if occupant_hist.added_or_renamed_after(&msg.csn) {
                            self.park(&mut occupant, &natural, true)?;
                            self.store.write_entry(&entry)?;
                        } else {
                            self.park(&mut entry, &natural, false)?;
                        }
                        report.outcome = ReplayOutcome::Parked;
                    }
                }
            }
        }

        report.released = self.holdback.lock().release(&msg.uuid);
        Ok(report)
    }

    pub(crate) fn apply_delete(&self, msg: &DeleteMsg) -> Result<ReplayReport> {
        let mut report = ReplayReport::new(msg.csn);

        let Some(entry) = self.store.read_by_uuid(&msg.uuid)? else {
            let mut tombstones = self.tombstones.lock();
            if tombstones.contains(&msg.uuid) {
                self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
            }
            tombstones.add(
                msg.uuid,
                Tombstone {
                    csn: msg.csn,
                    subtree: msg.subtree,
                    dn: msg.dn.clone(),
                },
            );
            drop(tombstones);
            debug!(csn = %msg.csn, uuid = %msg.uuid, "Entry not present, DELETE recorded");
            report.released = self.holdback.lock().release(&msg.uuid);
            return Ok(report.with_outcome(ReplayOutcome::Dropped));
        };

        if natural_dn(&entry) != msg.dn {
            self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
            info!(csn = %msg.csn, from = %msg.dn, to = %entry.dn, "Entry renamed concurrently, DELETE re-targeted");
        }

        let mut doomed = Vec::new();
        let mut orphans = Vec::new();
        if msg.subtree {
            // Entries named below after the delete was issued survive it
            let mut rescued: Vec<Dn> = Vec::new();
            for below in self.store.subtree(&entry.dn)? {
                if rescued.iter().any(|r| below.dn.is_descendant_of(r)) {
                    continue;
                }
                let hist = EntryHistorical::from_entry(&below, &self.registry);
                if hist.added_or_renamed_after(&msg.csn) {
                    rescued.push(below.dn.clone());
                    orphans.push(below);
                } else {
                    doomed.push(below);
                }
            }
        } else {
            orphans = self.store.children(&entry.dn)?;
        }

        for mut orphan in orphans {
            let natural = natural_dn(&orphan);
            self.park(&mut orphan, &natural, true)?;
            report.outcome = ReplayOutcome::Parked;
        }

        for below in doomed.iter().rev().chain(std::iter::once(&entry)) {
            self.store.delete_entry(&below.dn)?;
            self.tombstones.lock().add(
                below.uuid,
                Tombstone {
                    csn: msg.csn,
                    subtree: msg.subtree,
                    dn: below.dn.clone(),
                },
            );
        }
        debug!(csn = %msg.csn, dn = %entry.dn, removed = doomed.len() + 1, "Entry deleted");

        self.cleanup_conflicts(&entry.dn, &mut report)?;
        Ok(report)
    }

    pub(crate) fn apply_modify_dn(&self, msg: &ModifyDnMsg, expired: bool) -> Result<ReplayReport> {
        let mut report = ReplayReport::new(msg.csn);

        let Some((mut entry, mut hist)) = self.load(&msg.uuid)? else {
            if self.tombstones.lock().contains(&msg.uuid) || expired {
                self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
                debug!(csn = %msg.csn, uuid = %msg.uuid, "Entry gone, MODRDN dropped");
                return Ok(report.with_outcome(ReplayOutcome::Dropped));
            }
            return self.hold(UpdateMsg::ModifyDn(msg.clone()), msg.uuid);
        };

        if hist.added_or_renamed_after(&msg.csn) {
            debug!(csn = %msg.csn, dn = %entry.dn, "Entry renamed since, stale MODRDN dropped");
            return Ok(report.with_outcome(ReplayOutcome::Dropped));
        }

        let natural = natural_dn(&entry);
        let fallback = msg.new_superior.clone().or_else(|| natural.parent());
        let new_parent = match self.locate_parent(msg.new_parent_uuid, fallback, msg.csn, expired)? {
            ParentLookup::Found(parent) => parent,
            ParentLookup::Pending(parent) => return self.hold(UpdateMsg::ModifyDn(msg.clone()), parent),
            ParentLookup::DeletedAfter(_) | ParentLookup::Orphaned => {
                if !self.solve_conflicts {
                    return Err(Error::NamingConflict(msg.new_dn().to_string()));
                }
                let intended = msg.new_dn();
                entry.set_conflict_marker(Some(&intended));
                self.store.write_entry(&entry)?;
                self.counters.unresolved_naming.fetch_add(1, Ordering::Relaxed);
                warn!(csn = %msg.csn, dn = %entry.dn, intended = %intended, "New superior is gone, entry marked as conflicting");
                return Ok(report.with_outcome(ReplayOutcome::Parked));
            }
        };

        let new_dn = new_parent.child(msg.new_rdn.clone());
        if new_dn == entry.dn {
            debug!(csn = %msg.csn, dn = %new_dn, "MODRDN already applied");
            return Ok(report.with_outcome(ReplayOutcome::Dropped));
        }
        if natural != msg.dn {
            self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
            info!(csn = %msg.csn, from = %msg.dn, to = %entry.dn, "Entry renamed concurrently, MODRDN re-targeted");
        }

        let mods = self.rdn_modifications(&entry, &msg.new_rdn, msg.delete_old_rdn);
        hist.replay_modifications(&mut entry, msg.csn, &mods, &self.registry);
        hist.set_moddn(msg.csn);
        hist.store(&mut entry, &self.registry);
        entry.set_conflict_marker(None);

        let mut target = new_dn.clone();
        if let Some(mut occupant) = self.store.read_entry(&new_dn)? {
            let occupant_hist = EntryHistorical::from_entry(&occupant, &self.registry);
            if occupant_hist.added_or_renamed_after(&msg.csn) {
                self.park(&mut occupant, &new_dn, true)?;
            } else {
                if !self.solve_conflicts {
                    return Err(Error::NamingConflict(new_dn.to_string()));
                }
                target = conflict_dn(&entry.uuid, &msg.new_rdn, &self.base_dn);
                entry.set_conflict_marker(Some(&new_dn));
                self.counters.unresolved_naming.fetch_add(1, Ordering::Relaxed);
                warn!(uuid = %entry.uuid, natural = %new_dn, parked = %target, "Unresolved naming conflict, entry parked");
            }
            report.outcome = ReplayOutcome::Parked;
        }

        let old_dn = entry.dn.clone();
        self.move_subtree(&entry, &target)?;
        debug!(csn = %msg.csn, from = %old_dn, to = %target, "Entry renamed");

        self.cleanup_conflicts(&old_dn, &mut report)?;
        Ok(report)
    }

    /// Value changes carried by a rename: the new RDN values are added and,
    /// with `delete_old_rdn`, old RDN values not in the new RDN are removed
    fn rdn_modifications(&self, entry: &Entry, new_rdn: &Rdn, delete_old_rdn: bool) -> Vec<Modification> {
        let mut mods: Vec<Modification> = new_rdn
            .avas()
            .iter()
            .filter(|a| !a.is_type(ENTRY_UUID_ATTR))
            .map(|a| Modification {
                kind: ModKind::Add,
                attr: AttrDesc::new(a.attr_type()),
                values: vec![a.value().to_string()],
            })
            .collect();

        if delete_old_rdn {
            if let Some(old_rdn) = naming_rdn(entry) {
                for ava in old_rdn.avas().iter().filter(|a| !a.is_type(ENTRY_UUID_ATTR)) {
                    let attr = AttrDesc::new(ava.attr_type());
                    let key = self.registry.normalize(&attr, ava.value());
                    let kept = new_rdn
                        .values_of(ava.attr_type())
                        .any(|v| self.registry.normalize(&attr, v) == key);
                    if !kept {
                        mods.push(Modification {
                            kind: ModKind::Delete,
                            attr,
                            values: vec![ava.value().to_string()],
                        });
                    }
                }
            }
        }
        mods
    }

    pub(crate) fn apply_modify(&self, msg: &ModifyMsg, expired: bool) -> Result<ReplayReport> {
        let mut report = ReplayReport::new(msg.csn);

        let Some((mut entry, mut hist)) = self.load(&msg.uuid)? else {
            if self.tombstones.lock().contains(&msg.uuid) || expired {
                self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
                debug!(csn = %msg.csn, uuid = %msg.uuid, "Entry gone, MODIFY dropped");
                return Ok(report.with_outcome(ReplayOutcome::Dropped));
            }
            return self.hold(UpdateMsg::Modify(msg.clone()), msg.uuid);
        };

        if natural_dn(&entry) != msg.dn {
            self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
            debug!(csn = %msg.csn, from = %msg.dn, to = %entry.dn, "Entry renamed concurrently, MODIFY re-targeted");
        }

        let mods: Vec<Modification> = msg
            .mods
            .iter()
            .filter(|m| !m.attr.is_replication_internal())
            .cloned()
            .collect();
        if mods.len() != msg.mods.len() {
            report
                .warnings
                .push("modifications of replication attributes ignored".to_string());
        }

        let mods = match naming_rdn(&entry) {
            Some(rdn) => {
                let (mods, notes) = protect_rdn(mods, &rdn, &self.registry);
                if !notes.is_empty() {
                    self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
                    debug!(csn = %msg.csn, dn = %entry.dn, "MODIFY rewritten to keep the RDN values");
                }
                report.warnings.extend(notes);
                mods
            }
            None => mods,
        };

        let outcome = hist.replay_modifications(&mut entry, msg.csn, &mods, &self.registry);
        if outcome.superseded > 0 {
            self.counters.resolved_modify.fetch_add(1, Ordering::Relaxed);
            debug!(csn = %msg.csn, dn = %entry.dn, superseded = outcome.superseded, "Modify conflict resolved by newer history");
        }
        if entry.object_classes().is_empty() {
            warn!(csn = %msg.csn, dn = %entry.dn, "Entry left without objectClass");
            report.warnings.push(format!("{} has no objectClass left", entry.dn));
        }

        hist.store(&mut entry, &self.registry);
        self.store.write_entry(&entry)?;
        Ok(report)
    }

    /// Purge old historical tuples from one entry
    ///
    /// Returns the number of tuples removed.
    pub fn purge_historical(&self, dn: &Dn, purge_delay_ms: u64) -> Result<usize> {
        let entry = self
            .store
            .read_entry(dn)?
            .ok_or_else(|| Error::NoSuchEntry(dn.to_string()))?;
        let _entry = self.locks.acquire([uuid_key(&entry.uuid)]);
        self.purge_entry(&entry.uuid, purge_delay_ms)
    }

    /// Purge every entry's historical record and the old tombstones
    pub fn purge_all(&self, purge_delay_ms: u64) -> Result<usize> {
        let mut removed = 0;
        for entry in self.store.all_entries()? {
            let _entry = self.locks.acquire([uuid_key(&entry.uuid)]);
            removed += self.purge_entry(&entry.uuid, purge_delay_ms)?;
        }
        let stones = self
            .tombstones
            .lock()
            .purge_older_than(purge_delay_ms, self.clock.now_millis());
        info!(tuples = removed, tombstones = stones, "Historical purge done");
        Ok(removed)
    }

    fn purge_entry(&self, uuid: &EntryUuid, purge_delay_ms: u64) -> Result<usize> {
        let Some((mut entry, mut hist)) = self.load(uuid)? else {
            return Ok(0);
        };
        let (encoded, removed) =
            hist.encode_and_purge(purge_delay_ms, self.clock.now_millis(), &self.registry);
        if removed > 0 {
            entry.set_values(AttrDesc::new(crate::types::HISTORICAL_ATTR), encoded);
            self.store.write_entry(&entry)?;
            debug!(dn = %entry.dn, removed, "Historical tuples purged");
        }
        Ok(removed)
    }

    /// Operations that rebuild the entry at `dn` from its historical record
    pub fn fake_operations(&self, dn: &Dn) -> Result<Vec<FakeOperation>> {
        let entry = self
            .store
            .read_entry(dn)?
            .ok_or_else(|| Error::NoSuchEntry(dn.to_string()))?;
        let _entry = self.locks.acquire([uuid_key(&entry.uuid)]);
        let parent_uuid = self.parent_uuid(&entry)?;
        Ok(generate_fake_operations(&entry, parent_uuid, &self.registry))
    }

    /// Every operation newer than `since`, regenerated from the store and
    /// the tombstones, in replay order
    pub fn recovery_operations(&self, since: Option<Csn>) -> Result<Vec<FakeOperation>> {
        let newer = |csn: &Csn| since.map_or(true, |s| *csn > s);

        let mut ops = Vec::new();
        for entry in self.store.all_entries()? {
            let parent_uuid = self.parent_uuid(&entry)?;
            ops.extend(
                generate_fake_operations(&entry, parent_uuid, &self.registry)
                    .into_iter()
                    .filter(|op| newer(&op.csn)),
            );
        }
        for (uuid, stone) in self.tombstones.lock().iter() {
            if newer(&stone.csn) {
                ops.push(FakeOperation::new(UpdateMsg::Delete(DeleteMsg {
                    csn: stone.csn,
                    dn: stone.dn.clone(),
                    uuid: *uuid,
                    subtree: stone.subtree,
                    assured: None,
                })));
            }
        }
        sort_fake_operations(&mut ops);
        Ok(ops)
    }

    fn parent_uuid(&self, entry: &Entry) -> Result<Option<EntryUuid>> {
        match natural_dn(entry).parent() {
            Some(parent) if self.in_suffix(&parent) => {
                Ok(self.store.read_entry(&parent)?.map(|p| p.uuid))
            }
            _ => Ok(None),
        }
    }
}
