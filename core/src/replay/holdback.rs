//! Holdback queue for updates that arrive before the entry they depend on
//!
//! An ADD can reach this replica before the ADD of its parent, and a
//! MODIFY, DELETE or MODRDN before the ADD of its target. Such updates are
//! buffered here, indexed by the entryUUID they wait for:
//! - When that entry gets added, or a DELETE settles its fate, every update
//!   waiting on it is released
//! - Updates nobody satisfied expire after a configurable delay
//! - The queue is bounded; a full queue rejects new updates

use crate::csn::Csn;
use crate::protocol::UpdateMsg;
use crate::types::EntryUuid;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// Default bound on held updates
pub const MAX_HELD_UPDATES: usize = 10_000;

#[derive(Debug, Clone)]
struct HeldUpdate {
    update: UpdateMsg,

    /// Milliseconds, for expiry
    held_at: u64,

    waiting_on: EntryUuid,
}

/// Buffered updates indexed by the uuid they wait for
#[derive(Debug)]
pub struct HoldbackQueue {
    held: HashMap<Csn, HeldUpdate>,

    /// uuid -> csns of the updates waiting for it
    waiting_for: HashMap<EntryUuid, HashSet<Csn>>,

    /// FIFO for expiry checks
    insertion_order: VecDeque<Csn>,

    expiry_ms: u64,
    capacity: usize,
}

impl HoldbackQueue {
    pub fn new(expiry_ms: u64, capacity: usize) -> Self {
        Self {
            held: HashMap::new(),
            waiting_for: HashMap::new(),
            insertion_order: VecDeque::new(),
            expiry_ms,
            capacity,
        }
    }

    /// Hold `update` until `waiting_on` gets added
    pub fn hold(&mut self, update: UpdateMsg, waiting_on: EntryUuid, now_ms: u64) -> Result<()> {
        let csn = update.csn();
        if self.held.contains_key(&csn) {
            return Ok(());
        }
        if self.held.len() >= self.capacity {
            return Err(Error::Replay(format!(
                "holdback queue full ({} updates), rejecting {}",
                self.capacity, csn
            )));
        }

        self.waiting_for.entry(waiting_on).or_default().insert(csn);
        self.held.insert(
            csn,
            HeldUpdate {
                update,
                held_at: now_ms,
                waiting_on,
            },
        );
        self.insertion_order.push_back(csn);
        Ok(())
    }

    /// Notify that an entry was added, or deleted before it arrived
    ///
    /// Returns the updates that were waiting for it, oldest CSN first.
    pub fn release(&mut self, uuid: &EntryUuid) -> Vec<UpdateMsg> {
        let Some(csns) = self.waiting_for.remove(uuid) else {
            return Vec::new();
        };

        let mut ready: Vec<UpdateMsg> = csns
            .into_iter()
            .filter_map(|csn| self.held.remove(&csn))
            .map(|h| h.update)
            .collect();
        ready.sort_by_key(|u| (u.csn(), u.kind_rank()));
        ready
    }

    /// Remove updates held longer than the expiry delay
    ///
    /// Returns them with the uuid they were waiting for.
    pub fn expire(&mut self, now_ms: u64) -> Vec<(UpdateMsg, EntryUuid)> {
        let mut expired = Vec::new();

        // Check from front of queue (oldest first)
        while let Some(&csn) = self.insertion_order.front() {
            match self.held.get(&csn) {
                Some(held) if now_ms.saturating_sub(held.held_at) > self.expiry_ms => {
                    self.insertion_order.pop_front();
                    if let Some(held) = self.remove(&csn) {
                        expired.push((held.update, held.waiting_on));
                    }
                }
                Some(_) => break,
                None => {
                    // Already released
                    self.insertion_order.pop_front();
                }
            }
        }

        expired
    }

    fn remove(&mut self, csn: &Csn) -> Option<HeldUpdate> {
        let held = self.held.remove(csn)?;
        if let Some(waiting) = self.waiting_for.get_mut(&held.waiting_on) {
            waiting.remove(csn);
            if waiting.is_empty() {
                self.waiting_for.remove(&held.waiting_on);
            }
        }
        Some(held)
    }

    pub fn is_waiting_for(&self, uuid: &EntryUuid) -> bool {
        self.waiting_for.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
