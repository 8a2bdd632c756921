//! In-memory entry store

use super::EntryStore;
use crate::dn::Dn;
use crate::types::{Entry, EntryUuid};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

#[derive(Default)]
struct Maps {
    by_uuid: HashMap<EntryUuid, Entry>,
    /// normalised DN -> uuid
    by_dn: HashMap<String, EntryUuid>,
    /// normalised parent DN -> child uuids
    children: HashMap<String, BTreeSet<EntryUuid>>,
}

impl Maps {
    fn unlink(&mut self, entry: &Entry) {
        self.by_dn.remove(&entry.dn.normalized());
        if let Some(parent) = entry.dn.parent() {
            let key = parent.normalized();
            if let Some(set) = self.children.get_mut(&key) {
                set.remove(&entry.uuid);
                if set.is_empty() {
                    self.children.remove(&key);
                }
            }
        }
    }

    fn link(&mut self, entry: &Entry) {
        self.by_dn.insert(entry.dn.normalized(), entry.uuid);
        if let Some(parent) = entry.dn.parent() {
            self.children
                .entry(parent.normalized())
                .or_default()
                .insert(entry.uuid);
        }
    }
}

/// Entry store backed by hash maps
#[derive(Default)]
pub struct MemoryStore {
    maps: RwLock<Maps>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryStore for MemoryStore {
    fn read_entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        let maps = self.maps.read();
        Ok(maps
            .by_dn
            .get(&dn.normalized())
            .and_then(|uuid| maps.by_uuid.get(uuid))
            .cloned())
    }

    fn read_by_uuid(&self, uuid: &EntryUuid) -> Result<Option<Entry>> {
        Ok(self.maps.read().by_uuid.get(uuid).cloned())
    }

    fn write_entry(&self, entry: &Entry) -> Result<()> {
        let mut maps = self.maps.write();

        if let Some(holder) = maps.by_dn.get(&entry.dn.normalized()) {
            if *holder != entry.uuid {
                return Err(Error::EntryAlreadyExists(entry.dn.to_string()));
            }
        }

        if let Some(previous) = maps.by_uuid.remove(&entry.uuid) {
            maps.unlink(&previous);
        }
        maps.link(entry);
        maps.by_uuid.insert(entry.uuid, entry.clone());
        Ok(())
    }

    fn delete_entry(&self, dn: &Dn) -> Result<bool> {
        let mut maps = self.maps.write();
        let Some(uuid) = maps.by_dn.get(&dn.normalized()).copied() else {
            return Ok(false);
        };
        if let Some(entry) = maps.by_uuid.remove(&uuid) {
            maps.unlink(&entry);
        }
        Ok(true)
    }

    fn all_entries(&self) -> Result<Vec<Entry>> {
        Ok(self.maps.read().by_uuid.values().cloned().collect())
    }

    fn children(&self, dn: &Dn) -> Result<Vec<Entry>> {
        let maps = self.maps.read();
        Ok(maps
            .children
            .get(&dn.normalized())
            .map(|set| {
                set.iter()
                    .filter_map(|uuid| maps.by_uuid.get(uuid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn entry_count(&self) -> Result<usize> {
        Ok(self.maps.read().by_uuid.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dn: &str) -> Entry {
        Entry::new(Dn::parse(dn).unwrap(), EntryUuid::new()).with_values("objectClass", &["top"])
    }

    #[test]
    fn test_write_and_read() {
        let store = MemoryStore::new();
        let e = entry("cn=a,dc=example");
        store.write_entry(&e).unwrap();

        assert_eq!(store.read_entry(&Dn::parse("CN=A,dc=example").unwrap()).unwrap(), Some(e.clone()));
        assert_eq!(store.read_by_uuid(&e.uuid).unwrap(), Some(e));
        assert_eq!(store.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_dn_collision_rejected() {
        let store = MemoryStore::new();
        store.write_entry(&entry("cn=a,dc=example")).unwrap();
        let err = store.write_entry(&entry("cn=a,dc=example")).unwrap_err();
        assert!(matches!(err, Error::EntryAlreadyExists(_)));
    }

    #[test]
    fn test_rename_moves_indexes() {
        let store = MemoryStore::new();
        let base = entry("dc=example");
        let mut e = entry("cn=a,dc=example");
        store.write_entry(&base).unwrap();
        store.write_entry(&e).unwrap();

        e.dn = Dn::parse("cn=b,dc=example").unwrap();
        store.write_entry(&e).unwrap();

        assert!(store.read_entry(&Dn::parse("cn=a,dc=example").unwrap()).unwrap().is_none());
        assert_eq!(store.children(&base.dn).unwrap(), vec![e.clone()]);
        assert!(store.delete_entry(&e.dn).unwrap());
        assert!(!store.delete_entry(&e.dn).unwrap());
        assert!(store.children(&base.dn).unwrap().is_empty());
    }

    #[test]
    fn test_subtree_and_conflicts() {
        let store = MemoryStore::new();
        let base = entry("dc=example");
        let ou = entry("ou=people,dc=example");
        let leaf = entry("cn=x,ou=people,dc=example");
        let mut parked = entry("entryUUID=1+cn=y,dc=example");
        let natural = Dn::parse("cn=y,dc=example").unwrap();
        parked.set_conflict_marker(Some(&natural));
        for e in [&base, &ou, &leaf, &parked] {
            store.write_entry(e).unwrap();
        }

        let below: Vec<Dn> = store.subtree(&base.dn).unwrap().into_iter().map(|e| e.dn).collect();
        assert_eq!(below.len(), 3);
        assert_eq!(below.last().unwrap(), &leaf.dn);

        assert_eq!(store.find_conflicts(&natural).unwrap(), vec![parked]);
    }
}
