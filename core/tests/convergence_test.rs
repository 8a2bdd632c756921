//! Replicas converge whatever order they receive modifications in

use dsync_core::protocol::{AddMsg, ModifyMsg, UpdateMsg};
use dsync_core::replay::ReplayEngine;
use dsync_core::storage::{EntryStore, MemoryStore};
use dsync_core::syntax::SyntaxRegistry;
use dsync_core::{AttrDesc, Csn, Dn, EntryUuid, ModKind, Modification, ReplicaId};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const ATTRS: [&str; 2] = ["description", "mail"];
const VALUES: [&str; 3] = ["a", "b", "c"];

fn entry_dn() -> Dn {
    Dn::parse("cn=x,dc=example").unwrap()
}

/// Engine holding the suffix and `cn=x` with a couple of initial values
fn seeded_engine(suffix_uuid: EntryUuid, entry_uuid: EntryUuid) -> (ReplayEngine, Arc<SyntaxRegistry>) {
    let registry = Arc::new(SyntaxRegistry::with_defaults());
    let store: Arc<dyn EntryStore> = Arc::new(MemoryStore::new());
    let engine = ReplayEngine::new(store, registry.clone(), Dn::parse("dc=example").unwrap());

    engine
        .replay(&UpdateMsg::Add(AddMsg {
            csn: Csn::new(1, 0, ReplicaId(1)),
            dn: Dn::parse("dc=example").unwrap(),
            uuid: suffix_uuid,
            parent_uuid: None,
            object_classes: vec!["domain".to_string()],
            attributes: Vec::new(),
            assured: None,
        }))
        .unwrap();
    engine
        .replay(&UpdateMsg::Add(AddMsg {
            csn: Csn::new(2, 0, ReplicaId(1)),
            dn: entry_dn(),
            uuid: entry_uuid,
            parent_uuid: Some(suffix_uuid),
            object_classes: vec!["person".to_string()],
            attributes: vec![
                (AttrDesc::new("description"), vec!["a".to_string()]),
                (AttrDesc::new("mail"), vec!["b".to_string(), "c".to_string()]),
            ],
            assured: None,
        }))
        .unwrap();
    (engine, registry)
}

fn view(engine: &ReplayEngine, registry: &SyntaxRegistry) -> BTreeMap<String, BTreeSet<String>> {
    engine
        .store()
        .read_entry(&entry_dn())
        .unwrap()
        .expect("entry present")
        .user_view(registry)
}

fn modification() -> impl Strategy<Value = Modification> {
    let kind = prop_oneof![Just(ModKind::Add), Just(ModKind::Delete), Just(ModKind::Replace)];
    let values = prop::collection::btree_set(prop::sample::select(VALUES.to_vec()), 0..3);
    (kind, prop::sample::select(ATTRS.to_vec()), values).prop_filter_map(
        "an ADD needs values",
        |(kind, attr, values)| {
            if kind == ModKind::Add && values.is_empty() {
                return None;
            }
            Some(Modification {
                kind,
                attr: AttrDesc::new(attr),
                values: values.into_iter().map(str::to_string).collect(),
            })
        },
    )
}

/// Modifications stamped with distinct CSNs from three replicas
fn updates(uuid: EntryUuid) -> impl Strategy<Value = Vec<UpdateMsg>> {
    prop::collection::vec((modification(), 1u16..=3), 1..8).prop_map(move |mods| {
        mods.into_iter()
            .enumerate()
            .map(|(i, (m, origin))| {
                UpdateMsg::Modify(ModifyMsg {
                    csn: Csn::new(10 + i as u64, 0, ReplicaId(origin)),
                    dn: entry_dn(),
                    mods: vec![m],
                    uuid,
                    assured: None,
                })
            })
            .collect()
    })
}

fn scenario() -> impl Strategy<Value = (EntryUuid, EntryUuid, Vec<UpdateMsg>, Vec<UpdateMsg>)> {
    let suffix_uuid = EntryUuid::new();
    let entry_uuid = EntryUuid::new();
    updates(entry_uuid).prop_flat_map(move |in_order| {
        let shuffled = Just(in_order.clone()).prop_shuffle();
        (Just(suffix_uuid), Just(entry_uuid), Just(in_order), shuffled)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_replay_order_does_not_matter((suffix_uuid, entry_uuid, in_order, shuffled) in scenario()) {
        let (a, registry) = seeded_engine(suffix_uuid, entry_uuid);
        let (b, _) = seeded_engine(suffix_uuid, entry_uuid);

        for update in &in_order {
            a.replay(update).unwrap();
        }
        for update in &shuffled {
            b.replay(update).unwrap();
        }

        prop_assert_eq!(view(&a, &registry), view(&b, &registry));
    }

    #[test]
    fn prop_replaying_twice_changes_nothing((suffix_uuid, entry_uuid, in_order, _shuffled) in scenario()) {
        let (engine, registry) = seeded_engine(suffix_uuid, entry_uuid);
        for update in &in_order {
            engine.replay(update).unwrap();
        }
        let once = view(&engine, &registry);

        for update in &in_order {
            engine.replay(update).unwrap();
        }
        prop_assert_eq!(once, view(&engine, &registry));
    }
}
