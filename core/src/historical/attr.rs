//! Per-attribute historical state
//!
//! For every value the attribute remembers the last add or delete and its
//! CSN. On top of that, `delete_time` records the last time the whole
//! attribute was deleted or replaced. Incoming changes older than what is
//! remembered lose.

use super::{HistKind, HistTuple};
use crate::csn::Csn;
use crate::syntax::SyntaxRegistry;
use crate::types::{AttrDesc, Entry};
use std::collections::BTreeMap;

/// Last operation applied to one value
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueOp {
    Add,
    Delete,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ValueHistory {
    /// Value as last written, not normalised
    pub value: String,
    pub csn: Csn,
    pub op: ValueOp,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct AttrHistorical {
    delete_time: Option<Csn>,
    /// Keyed by normalised value
    values: BTreeMap<String, ValueHistory>,
}

impl AttrHistorical {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete_time(&self) -> Option<Csn> {
        self.delete_time
    }

    pub fn value_history(&self, key: &str) -> Option<&ValueHistory> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.delete_time.is_none() && self.values.is_empty()
    }

    /// Newest CSN recorded for this attribute
    pub fn last_csn(&self) -> Option<Csn> {
        self.values
            .values()
            .map(|h| h.csn)
            .chain(self.delete_time)
            .max()
    }

    fn older_than_delete(&self, csn: Csn) -> bool {
        self.delete_time.is_some_and(|dt| csn < dt)
    }

    /// Replay "add value". Returns false when the change lost.
    pub fn add_value(
        &mut self,
        entry: &mut Entry,
        attr: &AttrDesc,
        value: &str,
        csn: Csn,
        registry: &SyntaxRegistry,
    ) -> bool {
        if self.older_than_delete(csn) {
            return false;
        }
        let key = registry.normalize(attr, value);
        if let Some(prev) = self.values.get(&key) {
            if prev.csn > csn || (prev.csn == csn && prev.op == ValueOp::Add) {
                return false;
            }
        }
        self.values.insert(
            key,
            ValueHistory {
                value: value.to_string(),
                csn,
                op: ValueOp::Add,
            },
        );
        entry.add_value(attr, value, registry);
        true
    }

    /// Replay "delete value". Returns false when the change lost.
    ///
    /// The deletion is remembered even if the value is absent, so an older
    /// add arriving later cannot bring it back.
    pub fn delete_value(
        &mut self,
        entry: &mut Entry,
        attr: &AttrDesc,
        value: &str,
        csn: Csn,
        registry: &SyntaxRegistry,
    ) -> bool {
        if self.older_than_delete(csn) {
            return false;
        }
        let key = registry.normalize(attr, value);
        if let Some(prev) = self.values.get(&key) {
            if prev.csn > csn || (prev.csn == csn && prev.op == ValueOp::Delete) {
                return false;
            }
        }
        self.values.insert(
            key,
            ValueHistory {
                value: value.to_string(),
                csn,
                op: ValueOp::Delete,
            },
        );
        entry.remove_value(attr, value, registry);
        true
    }

    /// Replay "delete whole attribute"
    pub fn delete_attribute(
        &mut self,
        entry: &mut Entry,
        attr: &AttrDesc,
        csn: Csn,
        registry: &SyntaxRegistry,
    ) -> bool {
        if self.delete_time.is_some_and(|dt| csn <= dt) {
            return false;
        }
        self.delete_time = Some(csn);
        self.drop_older_than(entry, attr, csn, registry);
        true
    }

    /// Replay "replace attribute values"
    pub fn replace(
        &mut self,
        entry: &mut Entry,
        attr: &AttrDesc,
        values: &[String],
        csn: Csn,
        registry: &SyntaxRegistry,
    ) -> bool {
        if self.older_than_delete(csn) {
            return false;
        }
        self.delete_time = Some(csn);
        self.drop_older_than(entry, attr, csn, registry);
        for value in values {
            self.add_value(entry, attr, value, csn, registry);
        }
        true
    }

    /// Forget history older than `csn` and remove every live value that is
    /// not backed by an add at or after `csn`.
    fn drop_older_than(&mut self, entry: &mut Entry, attr: &AttrDesc, csn: Csn, registry: &SyntaxRegistry) {
        self.values.retain(|_, h| h.csn >= csn);
        let live: Vec<String> = entry.values(attr).to_vec();
        for value in live {
            let key = registry.normalize(attr, &value);
            let survives = self
                .values
                .get(&key)
                .is_some_and(|h| h.op == ValueOp::Add);
            if !survives {
                entry.remove_value(attr, &value, registry);
            }
        }
    }

    /// Tuples describing this state, oldest first
    ///
    /// An add made at exactly `delete_time` came from a replace and is
    /// written as `repl`; a `delete_time` without such a value is written as
    /// a standalone `attrDel`.
    pub fn tuples(&self, attr: &AttrDesc) -> Vec<HistTuple> {
        let mut out = Vec::with_capacity(self.values.len() + 1);
        let mut delete_covered = false;

        for h in self.values.values() {
            let kind = match h.op {
                ValueOp::Add if Some(h.csn) == self.delete_time => {
                    delete_covered = true;
                    HistKind::Replace
                }
                ValueOp::Add => HistKind::Add,
                ValueOp::Delete => HistKind::Delete,
            };
            out.push(HistTuple {
                attr: attr.clone(),
                csn: h.csn,
                kind,
                value: Some(h.value.clone()),
            });
        }

        if let Some(dt) = self.delete_time {
            if !delete_covered {
                out.push(HistTuple {
                    attr: attr.clone(),
                    csn: dt,
                    kind: HistKind::AttrDelete,
                    value: None,
                });
            }
        }

        out.sort_by_key(|t| t.csn);
        out
    }

    /// Fold one decoded tuple into the state
    pub fn absorb(&mut self, tuple: &HistTuple, registry: &SyntaxRegistry) {
        if matches!(tuple.kind, HistKind::Replace | HistKind::AttrDelete) {
            self.delete_time = self.delete_time.max(Some(tuple.csn));
        }
        let Some(value) = &tuple.value else {
            return;
        };
        let op = match tuple.kind {
            HistKind::Delete => ValueOp::Delete,
            _ => ValueOp::Add,
        };
        let key = registry.normalize(&tuple.attr, value);
        if self.values.get(&key).is_some_and(|prev| prev.csn > tuple.csn) {
            return;
        }
        self.values.insert(
            key,
            ValueHistory {
                value: value.clone(),
                csn: tuple.csn,
                op,
            },
        );
    }

    pub fn from_tuples<'a>(tuples: impl IntoIterator<Item = &'a HistTuple>, registry: &SyntaxRegistry) -> Self {
        let mut state = Self::new();
        for tuple in tuples {
            state.absorb(tuple, registry);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::types::{EntryUuid, ReplicaId};

    fn csn(ts: u64) -> Csn {
        Csn::new(ts, 0, ReplicaId(1))
    }

    fn setup() -> (Entry, AttrDesc, SyntaxRegistry) {
        let entry = Entry::new(Dn::parse("cn=x,dc=example").unwrap(), EntryUuid::new())
            .with_values("description", &["initial"]);
        (entry, AttrDesc::new("description"), SyntaxRegistry::with_defaults())
    }

    #[test]
    fn test_add_then_older_delete() {
        let (mut entry, attr, reg) = setup();
        let mut hist = AttrHistorical::new();

        assert!(hist.add_value(&mut entry, &attr, "v", csn(20), &reg));
        assert!(!hist.delete_value(&mut entry, &attr, "v", csn(10), &reg));
        assert!(entry.has_value(&attr, "v", &reg));
    }

    #[test]
    fn test_delete_then_older_add() {
        let (mut entry, attr, reg) = setup();
        let mut hist = AttrHistorical::new();

        assert!(hist.delete_value(&mut entry, &attr, "v", csn(20), &reg));
        assert!(!hist.add_value(&mut entry, &attr, "v", csn(10), &reg));
        assert!(!entry.has_value(&attr, "v", &reg));
    }

    #[test]
    fn test_duplicate_add_is_dropped() {
        let (mut entry, attr, reg) = setup();
        let mut hist = AttrHistorical::new();

        assert!(hist.add_value(&mut entry, &attr, "v", csn(5), &reg));
        assert!(!hist.add_value(&mut entry, &attr, "V", csn(5), &reg));
        assert_eq!(entry.values(&attr).len(), 2);
    }

    #[test]
    fn test_replace_keeps_newer_adds() {
        let (mut entry, attr, reg) = setup();
        let mut hist = AttrHistorical::new();

        hist.add_value(&mut entry, &attr, "late", csn(30), &reg);
        assert!(hist.replace(&mut entry, &attr, &["r".to_string()], csn(20), &reg));

        let mut values = entry.values(&attr).to_vec();
        values.sort();
        assert_eq!(values, vec!["late".to_string(), "r".to_string()]);

        // older than the replace
        assert!(!hist.add_value(&mut entry, &attr, "early", csn(10), &reg));
        assert!(!hist.replace(&mut entry, &attr, &[], csn(15), &reg));
    }

    #[test]
    fn test_delete_attribute_equal_csn_is_duplicate() {
        let (mut entry, attr, reg) = setup();
        let mut hist = AttrHistorical::new();

        assert!(hist.delete_attribute(&mut entry, &attr, csn(10), &reg));
        assert!(entry.values(&attr).is_empty());
        assert!(!hist.delete_attribute(&mut entry, &attr, csn(10), &reg));
        assert_eq!(hist.delete_time(), Some(csn(10)));
    }

    #[test]
    fn test_tuples_encoding_kinds() {
        let (mut entry, attr, reg) = setup();
        let mut hist = AttrHistorical::new();

        hist.replace(&mut entry, &attr, &["a".to_string()], csn(10), &reg);
        hist.add_value(&mut entry, &attr, "b", csn(20), &reg);
        hist.delete_value(&mut entry, &attr, "c", csn(30), &reg);

        let kinds: Vec<HistKind> = hist.tuples(&attr).iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![HistKind::Replace, HistKind::Add, HistKind::Delete]);

        let rebuilt = AttrHistorical::from_tuples(&hist.tuples(&attr), &reg);
        assert_eq!(rebuilt, hist);
    }

    #[test]
    fn test_empty_replace_encodes_as_attr_delete() {
        let (mut entry, attr, reg) = setup();
        let mut hist = AttrHistorical::new();

        hist.replace(&mut entry, &attr, &[], csn(10), &reg);
        let tuples = hist.tuples(&attr);
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0].kind, HistKind::AttrDelete);
    }
}
