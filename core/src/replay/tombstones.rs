//! Tombstones for deleted entries
//!
//! A DELETE leaves `entryUUID -> (csn, subtree, dn)` behind so that an ADD or
//! MODRDN arriving later, which still references the deleted entry as its
//! parent, can tell a clean subtree-delete win from an orphan.

use crate::csn::Csn;
use crate::dn::Dn;
use crate::types::EntryUuid;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tombstone {
    pub csn: Csn,
    pub subtree: bool,
    /// DN the entry had when it was deleted
    pub dn: Dn,
}

#[derive(Debug, Clone, Default)]
pub struct TombstoneSet {
    tombstones: HashMap<EntryUuid, Tombstone>,
}

impl TombstoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deletion, keeping the newest one per uuid
    pub fn add(&mut self, uuid: EntryUuid, tombstone: Tombstone) {
        match self.tombstones.get(&uuid) {
            Some(existing) if existing.csn >= tombstone.csn => {}
            _ => {
                self.tombstones.insert(uuid, tombstone);
            }
        }
    }

    pub fn get(&self, uuid: &EntryUuid) -> Option<&Tombstone> {
        self.tombstones.get(uuid)
    }

    pub fn contains(&self, uuid: &EntryUuid) -> bool {
        self.tombstones.contains_key(uuid)
    }

    /// Newest tombstone left at `dn`
    pub fn find_by_dn(&self, dn: &Dn) -> Option<&Tombstone> {
        self.tombstones
            .values()
            .filter(|t| t.dn == *dn)
            .max_by_key(|t| t.csn)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntryUuid, &Tombstone)> {
        self.tombstones.iter()
    }

    /// Forget tombstones older than `delay_ms`, returns how many went
    pub fn purge_older_than(&mut self, delay_ms: u64, now_ms: u64) -> usize {
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, t| t.csn.age_ms(now_ms) <= delay_ms);
        before - self.tombstones.len()
    }

    pub fn len(&self) -> usize {
        self.tombstones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicaId;

    fn stone(ts: u64, subtree: bool) -> Tombstone {
        Tombstone {
            csn: Csn::new(ts, 0, ReplicaId(1)),
            subtree,
            dn: Dn::parse("ou=gone,dc=example").unwrap(),
        }
    }

    #[test]
    fn test_newest_tombstone_wins() {
        let mut set = TombstoneSet::new();
        let uuid = EntryUuid::new();
        set.add(uuid, stone(20, true));
        set.add(uuid, stone(10, false));

        let kept = set.get(&uuid).unwrap();
        assert_eq!(kept.csn.timestamp, 20);
        assert!(kept.subtree);
    }

    #[test]
    fn test_purge() {
        let mut set = TombstoneSet::new();
        set.add(EntryUuid::new(), stone(100, false));
        set.add(EntryUuid::new(), stone(900, false));

        assert_eq!(set.purge_older_than(500, 1_000), 1);
        assert_eq!(set.len(), 1);
        assert!(set.iter().all(|(_, t)| t.csn.timestamp == 900));
    }
}
