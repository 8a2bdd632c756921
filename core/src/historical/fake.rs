//! Rebuild operations from historical data
//!
//! A replica that is behind can be caught up by replaying operations
//! regenerated from an entry's historical record: one ADD carrying the
//! current content, one MODIFY per CSN found in the attribute tuples, and a
//! MODRDN when the entry was renamed. Applied in order on an empty
//! namespace they yield an entry equivalent to the current one.

use super::{EntryHistorical, HistKind, HistTuple};
use crate::csn::Csn;
use crate::protocol::{AddMsg, ModifyDnMsg, ModifyMsg, UpdateMsg};
use crate::syntax::SyntaxRegistry;
use crate::types::{AttrDesc, Entry, EntryUuid, ModKind, Modification, OBJECT_CLASS_ATTR};
use std::collections::BTreeMap;

/// A regenerated operation
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FakeOperation {
    pub csn: Csn,
    pub update: UpdateMsg,
}

impl FakeOperation {
    pub fn new(update: UpdateMsg) -> Self {
        Self {
            csn: update.csn(),
            update,
        }
    }
}

/// Order by CSN, ties broken ADD < DELETE < MODIFY < MODRDN
pub fn sort_fake_operations(ops: &mut [FakeOperation]) {
    ops.sort_by_key(|op| (op.csn, op.update.kind_rank()));
}

/// Regenerate the operations that produced `entry`
///
/// The ADD is only emitted when the record knows the add date. Conflict
/// entries are described under their natural DN.
pub fn generate_fake_operations(
    entry: &Entry,
    parent_uuid: Option<EntryUuid>,
    registry: &SyntaxRegistry,
) -> Vec<FakeOperation> {
    let hist = EntryHistorical::from_entry(entry, registry);
    let dn = entry.conflict_marker().unwrap_or_else(|| entry.dn.clone());
    let mut ops = Vec::new();

    if let Some(csn) = hist.add_csn() {
        let object_class = AttrDesc::new(OBJECT_CLASS_ATTR);
        ops.push(FakeOperation::new(UpdateMsg::Add(AddMsg {
            csn,
            dn: dn.clone(),
            uuid: entry.uuid,
            parent_uuid,
            object_classes: entry.object_classes().to_vec(),
            attributes: entry
                .user_attributes()
                .filter(|(attr, _)| **attr != object_class)
                .map(|(attr, values)| (attr.clone(), values.clone()))
                .collect(),
            assured: None,
        })));
    }

    for (csn, mods) in group_modifications(&hist.tuples()) {
        ops.push(FakeOperation::new(UpdateMsg::Modify(ModifyMsg {
            csn,
            dn: dn.clone(),
            mods,
            uuid: entry.uuid,
            assured: None,
        })));
    }

    if let (Some(csn), Some(rdn)) = (hist.moddn_csn(), dn.rdn()) {
        ops.push(FakeOperation::new(UpdateMsg::ModifyDn(ModifyDnMsg {
            csn,
            dn: dn.clone(),
            uuid: entry.uuid,
            new_parent_uuid: parent_uuid,
            delete_old_rdn: false,
            new_superior: dn.parent(),
            new_rdn: rdn.clone(),
            assured: None,
        })));
    }

    sort_fake_operations(&mut ops);
    ops
}

/// One MODIFY per CSN. Within a CSN whole-attribute changes go first so
/// that value changes made by the same operation land on top of them.
fn group_modifications(tuples: &[HistTuple]) -> BTreeMap<Csn, Vec<Modification>> {
    let mut replaces: BTreeMap<(Csn, AttrDesc), Vec<String>> = BTreeMap::new();
    let mut value_mods: BTreeMap<Csn, Vec<Modification>> = BTreeMap::new();

    for t in tuples {
        match (t.kind, &t.value) {
            (HistKind::Replace, Some(v)) => {
                replaces.entry((t.csn, t.attr.clone())).or_default().push(v.clone());
            }
            (HistKind::AttrDelete, _) => {
                replaces.entry((t.csn, t.attr.clone())).or_default();
            }
            (HistKind::Add, Some(v)) | (HistKind::Delete, Some(v)) => {
                let kind = if t.kind == HistKind::Add {
                    ModKind::Add
                } else {
                    ModKind::Delete
                };
                value_mods.entry(t.csn).or_default().push(Modification {
                    kind,
                    attr: t.attr.clone(),
                    values: vec![v.clone()],
                });
            }
            _ => {}
        }
    }

    let mut grouped: BTreeMap<Csn, Vec<Modification>> = BTreeMap::new();
    for ((csn, attr), values) in replaces {
        let kind = if values.is_empty() {
            ModKind::Delete
        } else {
            ModKind::Replace
        };
        grouped.entry(csn).or_default().push(Modification { kind, attr, values });
    }
    for (csn, mods) in value_mods {
        grouped.entry(csn).or_default().extend(mods);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::{Dn, Rdn};
    use crate::protocol::DeleteMsg;
    use crate::types::ReplicaId;

    fn csn(ts: u64) -> Csn {
        Csn::new(ts, 0, ReplicaId(1))
    }

    fn history_entry(reg: &SyntaxRegistry) -> Entry {
        let mut entry = Entry::new(Dn::parse("cn=f,dc=example").unwrap(), EntryUuid::new())
            .with_values("objectClass", &["top", "person"])
            .with_values("sn", &["f"]);
        let mut hist = EntryHistorical::for_add(csn(10));
        hist.replay_modifications(
            &mut entry,
            csn(20),
            &[
                Modification::replace("description", &["a", "b"]),
                Modification::delete("description", &["b"]),
            ],
            reg,
        );
        hist.replay_modifications(&mut entry, csn(30), &[Modification::add("mail", &["f@example.com"])], reg);
        hist.set_moddn(csn(30));
        hist.store(&mut entry, reg);
        entry
    }

    #[test]
    fn test_generated_sequence() {
        let reg = SyntaxRegistry::with_defaults();
        let entry = history_entry(&reg);
        let ops = generate_fake_operations(&entry, None, &reg);

        let kinds: Vec<(&str, Csn)> = ops.iter().map(|o| (o.update.kind_name(), o.csn)).collect();
        assert_eq!(
            kinds,
            vec![("add", csn(10)), ("modify", csn(20)), ("modify", csn(30)), ("modrdn", csn(30))]
        );

        match &ops[1].update {
            UpdateMsg::Modify(m) => {
                assert_eq!(m.mods[0].kind, ModKind::Replace);
                assert_eq!(m.mods[0].values, vec!["a".to_string()]);
                assert_eq!(m.mods[1].kind, ModKind::Delete);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_replay_on_empty_namespace_is_equivalent() {
        let reg = SyntaxRegistry::with_defaults();
        let entry = history_entry(&reg);
        let ops = generate_fake_operations(&entry, None, &reg);

        let mut rebuilt: Option<(Entry, EntryHistorical)> = None;
        for op in ops {
            match op.update {
                UpdateMsg::Add(add) => {
                    let mut e = Entry::new(add.dn.clone(), add.uuid);
                    e.set_values(AttrDesc::new(OBJECT_CLASS_ATTR), add.object_classes.clone());
                    for (attr, values) in add.attributes {
                        e.set_values(attr, values);
                    }
                    rebuilt = Some((e, EntryHistorical::for_add(add.csn)));
                }
                UpdateMsg::Modify(m) => {
                    let (e, h) = rebuilt.as_mut().unwrap();
                    h.replay_modifications(e, m.csn, &m.mods, &reg);
                }
                UpdateMsg::ModifyDn(m) => {
                    let (e, h) = rebuilt.as_mut().unwrap();
                    assert_eq!(m.new_dn(), e.dn);
                    h.set_moddn(m.csn);
                }
                UpdateMsg::Delete(_) => unreachable!(),
            }
        }

        let (rebuilt, _) = rebuilt.unwrap();
        assert_eq!(rebuilt.user_view(&reg), entry.user_view(&reg));
    }

    #[test]
    fn test_tie_break_order() {
        let uuid = EntryUuid::new();
        let dn = Dn::parse("cn=t,dc=example").unwrap();
        let at = csn(5);
        let mut ops = vec![
            FakeOperation::new(UpdateMsg::ModifyDn(ModifyDnMsg {
                csn: at,
                dn: dn.clone(),
                uuid,
                new_parent_uuid: None,
                delete_old_rdn: false,
                new_superior: None,
                new_rdn: Rdn::new("cn", "t"),
                assured: None,
            })),
            FakeOperation::new(UpdateMsg::Modify(ModifyMsg {
                csn: at,
                dn: dn.clone(),
                mods: vec![],
                uuid,
                assured: None,
            })),
            FakeOperation::new(UpdateMsg::Delete(DeleteMsg {
                csn: at,
                dn: dn.clone(),
                uuid,
                subtree: false,
                assured: None,
            })),
            FakeOperation::new(UpdateMsg::Add(AddMsg {
                csn: at,
                dn,
                uuid,
                parent_uuid: None,
                object_classes: vec![],
                attributes: vec![],
                assured: None,
            })),
        ];
        sort_fake_operations(&mut ops);
        let names: Vec<&str> = ops.iter().map(|o| o.update.kind_name()).collect();
        assert_eq!(names, vec!["add", "delete", "modify", "modrdn"]);
    }
}
