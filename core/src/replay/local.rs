//! Local writes
//!
//! Operations issued by clients of this replica. They are checked the way a
//! directory server checks them, stamped with a fresh CSN while the entry
//! locks of everything they touch are held, then applied through the same code as replicated
//! updates so the historical record is kept identically. The returned
//! [`UpdateMsg`] is what gets published to the other replicas.

use super::{dn_key, naming_rdn, protect_rdn, uuid_key, LockSet, ReplayEngine, ReplayReport};
use crate::csn::CsnGenerator;
use crate::dn::{Dn, Rdn};
use crate::protocol::{AddMsg, DeleteMsg, ModifyDnMsg, ModifyMsg, UpdateMsg};
use crate::types::{AttrDesc, Entry, EntryUuid, Modification, OBJECT_CLASS_ATTR};
use crate::{Error, Result};
use tracing::debug;

impl ReplayEngine {
    /// Add a new entry at `dn`
    pub fn local_add(
        &self,
        generator: &CsnGenerator,
        dn: &Dn,
        attributes: Vec<(AttrDesc, Vec<String>)>,
    ) -> Result<(UpdateMsg, ReplayReport)> {
        let _guard = self.lock_keys(|| {
            let mut keys = LockSet::new();
            keys.exclusive(dn_key(dn));
            self.parent_keys(None, dn.parent(), &mut keys)?;
            Ok(keys)
        })?;

        if dn.is_root() || !self.in_suffix(dn) {
            return Err(Error::InvalidDn(format!("{} is outside {}", dn, self.base_dn)));
        }
        if self.store.read_entry(dn)?.is_some() {
            return Err(Error::EntryAlreadyExists(dn.to_string()));
        }
        let parent_uuid = if *dn == self.base_dn {
            None
        } else {
            let parent = dn.parent().unwrap_or_default();
            let parent = self
                .store
                .read_entry(&parent)?
                .ok_or_else(|| Error::NoSuchEntry(parent.to_string()))?;
            Some(parent.uuid)
        };
        if let Some(attr) = attributes.iter().map(|(a, _)| a).find(|a| a.is_replication_internal()) {
            return Err(Error::InvalidAttribute(format!("{} is maintained by replication", attr)));
        }

        let (object_classes, attributes): (Vec<_>, Vec<_>) = attributes
            .into_iter()
            .partition(|(attr, _)| attr.is_type(OBJECT_CLASS_ATTR));
        let object_classes: Vec<String> = object_classes.into_iter().flat_map(|(_, v)| v).collect();
        if object_classes.is_empty() {
            return Err(Error::InvalidAttribute(format!("{} has no objectClass", dn)));
        }

        let msg = AddMsg {
            csn: generator.next(),
            dn: dn.clone(),
            uuid: EntryUuid::new(),
            parent_uuid,
            object_classes,
            attributes,
            assured: None,
        };
        let report = self.apply_add(&msg, false)?;
        debug!(csn = %msg.csn, dn = %dn, "Local ADD");
        Ok((UpdateMsg::Add(msg), report))
    }

    /// Apply modifications to the entry at `dn`
    pub fn local_modify(
        &self,
        generator: &CsnGenerator,
        dn: &Dn,
        mods: Vec<Modification>,
    ) -> Result<(UpdateMsg, ReplayReport)> {
        let _guard = self.lock_keys(|| {
            let mut keys = LockSet::new();
            keys.exclusive(uuid_key(&self.existing(dn)?.uuid));
            Ok(keys)
        })?;
        let entry = self.existing(dn)?;

        if let Some(m) = mods.iter().find(|m| m.attr.is_replication_internal()) {
            return Err(Error::InvalidAttribute(format!("{} is maintained by replication", m.attr)));
        }
        if let Some(rdn) = naming_rdn(&entry) {
            let (_, notes) = protect_rdn(mods.clone(), &rdn, &self.registry);
            if let Some(note) = notes.into_iter().next() {
                return Err(Error::InvalidAttribute(format!("not allowed on RDN: {}", note)));
            }
        }

        let msg = ModifyMsg {
            csn: generator.next(),
            dn: dn.clone(),
            mods,
            uuid: entry.uuid,
            assured: None,
        };
        let report = self.apply_modify(&msg, false)?;
        debug!(csn = %msg.csn, dn = %dn, "Local MODIFY");
        Ok((UpdateMsg::Modify(msg), report))
    }

    /// Delete the entry at `dn`, and everything below it with `subtree`
    pub fn local_delete(
        &self,
        generator: &CsnGenerator,
        dn: &Dn,
        subtree: bool,
    ) -> Result<(UpdateMsg, ReplayReport)> {
        let _guard = self.lock_keys(|| {
            let mut keys = LockSet::new();
            self.delete_keys(&self.existing(dn)?, &mut keys)?;
            Ok(keys)
        })?;

        let entry = self.existing(dn)?;
        if !subtree && !self.store.children(dn)?.is_empty() {
            return Err(Error::NotAllowedOnNonLeaf(dn.to_string()));
        }

        let msg = DeleteMsg {
            csn: generator.next(),
            dn: dn.clone(),
            uuid: entry.uuid,
            subtree,
            assured: None,
        };
        let report = self.apply_delete(&msg)?;
        debug!(csn = %msg.csn, dn = %dn, subtree, "Local DELETE");
        Ok((UpdateMsg::Delete(msg), report))
    }

    /// Rename the entry at `dn`, optionally moving it under `new_superior`
    pub fn local_modify_dn(
        &self,
        generator: &CsnGenerator,
        dn: &Dn,
        new_rdn: Rdn,
        delete_old_rdn: bool,
        new_superior: Option<Dn>,
    ) -> Result<(UpdateMsg, ReplayReport)> {
        let _guard = self.lock_keys(|| {
            let mut keys = LockSet::new();
            let fallback = new_superior.clone().or_else(|| dn.parent());
            self.rename_keys(&self.existing(dn)?, None, fallback, &new_rdn, &mut keys)?;
            Ok(keys)
        })?;

        let entry = self.existing(dn)?;
        if *dn == self.base_dn {
            return Err(Error::InvalidDn(format!("cannot rename the suffix {}", dn)));
        }
        let parent_dn = new_superior
            .clone()
            .or_else(|| dn.parent())
            .unwrap_or_default();
        if parent_dn == *dn || parent_dn.is_descendant_of(dn) {
            return Err(Error::InvalidDn(format!("cannot move {} below itself", dn)));
        }
        if !self.in_suffix(&parent_dn) {
            return Err(Error::InvalidDn(format!("{} is outside {}", parent_dn, self.base_dn)));
        }
        let parent = self
            .store
            .read_entry(&parent_dn)?
            .ok_or_else(|| Error::NoSuchEntry(parent_dn.to_string()))?;
        let new_dn = parent_dn.child(new_rdn.clone());
        if self.store.read_entry(&new_dn)?.is_some() {
            return Err(Error::EntryAlreadyExists(new_dn.to_string()));
        }

        let msg = ModifyDnMsg {
            csn: generator.next(),
            dn: dn.clone(),
            uuid: entry.uuid,
            new_parent_uuid: Some(parent.uuid),
            delete_old_rdn,
            new_superior,
            new_rdn,
            assured: None,
        };
        let report = self.apply_modify_dn(&msg, false)?;
        debug!(csn = %msg.csn, from = %dn, to = %new_dn, "Local MODRDN");
        Ok((UpdateMsg::ModifyDn(msg), report))
    }

    fn existing(&self, dn: &Dn) -> Result<Entry> {
        self.store
            .read_entry(dn)?
            .ok_or_else(|| Error::NoSuchEntry(dn.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::ReplayOutcome;
    use super::*;
    use crate::historical::EntryHistorical;
    use crate::storage::{EntryStore, MemoryStore};
    use crate::syntax::SyntaxRegistry;
    use crate::types::ReplicaId;
    use std::sync::Arc;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn attrs(pairs: &[(&str, &[&str])]) -> Vec<(AttrDesc, Vec<String>)> {
        pairs
            .iter()
            .map(|(a, v)| (AttrDesc::new(a), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    fn setup() -> (ReplayEngine, CsnGenerator) {
        let store: Arc<dyn EntryStore> = Arc::new(MemoryStore::new());
        let engine = ReplayEngine::new(store, Arc::new(SyntaxRegistry::with_defaults()), dn("dc=example"));
        let generator = CsnGenerator::new(ReplicaId(1));
        engine
            .local_add(&generator, &dn("dc=example"), attrs(&[("objectClass", &["domain"])]))
            .unwrap();
        (engine, generator)
    }

    #[test]
    fn test_local_add_checks() {
        let (engine, generator) = setup();

        let err = engine
            .local_add(&generator, &dn("cn=x,ou=missing,dc=example"), attrs(&[("objectClass", &["person"])]))
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchEntry(_)));

        engine
            .local_add(&generator, &dn("cn=x,dc=example"), attrs(&[("objectClass", &["person"])]))
            .unwrap();
        let err = engine
            .local_add(&generator, &dn("cn=x,dc=example"), attrs(&[("objectClass", &["person"])]))
            .unwrap_err();
        assert!(matches!(err, Error::EntryAlreadyExists(_)));

        let err = engine
            .local_add(&generator, &dn("cn=y,dc=example"), attrs(&[("sn", &["y"])]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute(_)));
    }

    #[test]
    fn test_local_add_records_history() {
        let (engine, generator) = setup();
        let (update, report) = engine
            .local_add(&generator, &dn("cn=x,dc=example"), attrs(&[("objectClass", &["person"]), ("sn", &["x"])]))
            .unwrap();

        assert_eq!(report.outcome, ReplayOutcome::Applied);
        let entry = engine.store().read_entry(&dn("cn=x,dc=example")).unwrap().unwrap();
        assert_eq!(entry.first_value("cn"), Some("x"));
        let hist = EntryHistorical::from_entry(&entry, engine.registry());
        assert_eq!(hist.add_csn(), Some(update.csn()));
        match update {
            UpdateMsg::Add(add) => assert_eq!(add.parent_uuid, engine.store().read_entry(&dn("dc=example")).unwrap().map(|e| e.uuid)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_local_delete_non_leaf() {
        let (engine, generator) = setup();
        engine
            .local_add(&generator, &dn("ou=p,dc=example"), attrs(&[("objectClass", &["organizationalUnit"])]))
            .unwrap();
        engine
            .local_add(&generator, &dn("cn=c,ou=p,dc=example"), attrs(&[("objectClass", &["person"])]))
            .unwrap();

        let err = engine.local_delete(&generator, &dn("ou=p,dc=example"), false).unwrap_err();
        assert!(matches!(err, Error::NotAllowedOnNonLeaf(_)));

        engine.local_delete(&generator, &dn("ou=p,dc=example"), true).unwrap();
        assert_eq!(engine.store().entry_count().unwrap(), 1);
    }

    #[test]
    fn test_local_modify_rejects_rdn_removal() {
        let (engine, generator) = setup();
        engine
            .local_add(&generator, &dn("cn=x,dc=example"), attrs(&[("objectClass", &["person"])]))
            .unwrap();

        let err = engine
            .local_modify(&generator, &dn("cn=x,dc=example"), vec![Modification::delete("cn", &["x"])])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAttribute(_)));

        let (update, _) = engine
            .local_modify(&generator, &dn("cn=x,dc=example"), vec![Modification::add("description", &["ok"])])
            .unwrap();
        assert_eq!(update.kind_name(), "modify");
    }

    #[test]
    fn test_local_modify_dn_moves_subtree() {
        let (engine, generator) = setup();
        for (name, class) in [("ou=a,dc=example", "organizationalUnit"), ("ou=b,dc=example", "organizationalUnit"), ("cn=c,ou=a,dc=example", "person")] {
            engine.local_add(&generator, &dn(name), attrs(&[("objectClass", &[class])])).unwrap();
        }

        let err = engine
            .local_modify_dn(&generator, &dn("ou=a,dc=example"), Rdn::new("ou", "b"), true, None)
            .unwrap_err();
        assert!(matches!(err, Error::EntryAlreadyExists(_)));

        engine
            .local_modify_dn(&generator, &dn("ou=a,dc=example"), Rdn::new("ou", "moved"), true, Some(dn("ou=b,dc=example")))
            .unwrap();
        let child = engine.store().read_entry(&dn("cn=c,ou=moved,ou=b,dc=example")).unwrap();
        assert!(child.is_some());
    }
}
