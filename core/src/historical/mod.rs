//! Historical record
//!
//! Every replicated entry carries its own change history in the
//! operational attribute `ds-sync-hist`, one value per tuple:
//!
//! - `<attr>:<csn>:add:<value>` / `<attr>:<csn>:del:<value>`: last change of one value
//! - `<attr>:<csn>:repl:<value>`: value written by a replace
//! - `<attr>:<csn>:attrDel`: whole attribute deleted or replaced by nothing
//! - `dn:<csn>:add` / `dn:<csn>:moddn`: when the entry got its current name
//!
//! The replay engine decodes this into an [`EntryHistorical`], lets it
//! arbitrate each attribute change, and writes it back into the entry.

pub mod attr;
pub mod fake;

pub use attr::{AttrHistorical, ValueHistory, ValueOp};
pub use fake::{generate_fake_operations, sort_fake_operations, FakeOperation};

use crate::csn::Csn;
use crate::syntax::SyntaxRegistry;
use crate::types::{AttrDesc, Entry, ModKind, Modification, HISTORICAL_ATTR};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Kind of an attribute-level historical tuple
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HistKind {
    Add,
    Delete,
    Replace,
    AttrDelete,
}

impl HistKind {
    fn as_str(&self) -> &'static str {
        match self {
            HistKind::Add => "add",
            HistKind::Delete => "del",
            HistKind::Replace => "repl",
            HistKind::AttrDelete => "attrDel",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(HistKind::Add),
            "del" => Some(HistKind::Delete),
            "repl" => Some(HistKind::Replace),
            "attrDel" => Some(HistKind::AttrDelete),
            _ => None,
        }
    }
}

/// One attribute-level tuple
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HistTuple {
    pub attr: AttrDesc,
    pub csn: Csn,
    pub kind: HistKind,
    /// `None` only for `AttrDelete`
    pub value: Option<String>,
}

impl HistTuple {
    pub fn encode(&self, registry: &SyntaxRegistry) -> String {
        let mut out = format!("{}:{}:{}", self.attr, self.csn, self.kind.as_str());
        if let Some(value) = &self.value {
            let encoded = registry
                .codec_for(&self.attr)
                .encode(value)
                .unwrap_or_else(|_| value.clone());
            out.push(':');
            out.push_str(&encoded);
        }
        out
    }
}

/// A decoded `ds-sync-hist` value
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum HistLine {
    Attr(HistTuple),
    DnAdd(Csn),
    DnModdn(Csn),
}

impl HistLine {
    pub fn parse(line: &str, registry: &SyntaxRegistry) -> Result<Self> {
        let malformed = || Error::Serialization(format!("malformed historical value '{}'", line));

        let mut parts = line.splitn(4, ':');
        let attr = parts.next().ok_or_else(malformed)?;
        let csn: Csn = parts.next().ok_or_else(malformed)?.parse()?;
        let kind = parts.next().ok_or_else(malformed)?;
        let value = parts.next();

        if attr == "dn" {
            return match kind {
                "add" => Ok(HistLine::DnAdd(csn)),
                "moddn" => Ok(HistLine::DnModdn(csn)),
                _ => Err(malformed()),
            };
        }

        let attr = AttrDesc::parse(attr)?;
        let kind = HistKind::parse(kind).ok_or_else(malformed)?;
        let value = match (kind, value) {
            (HistKind::AttrDelete, _) => None,
            (_, Some(encoded)) => Some(
                registry
                    .codec_for(&attr)
                    .decode(encoded)
                    .unwrap_or_else(|_| encoded.to_string()),
            ),
            (_, None) => return Err(malformed()),
        };

        Ok(HistLine::Attr(HistTuple {
            attr,
            csn,
            kind,
            value,
        }))
    }
}

/// Outcome of replaying the modifications of one MODIFY
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModifyReplay {
    /// Attribute-level changes that won
    pub applied: usize,
    /// Changes dropped because newer history exists
    pub superseded: usize,
}

impl ModifyReplay {
    fn count(&mut self, won: bool) {
        if won {
            self.applied += 1;
        } else {
            self.superseded += 1;
        }
    }
}

/// Decoded historical record of one entry
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct EntryHistorical {
    attributes: BTreeMap<AttrDesc, AttrHistorical>,
    add_csn: Option<Csn>,
    moddn_csn: Option<Csn>,
}

impl EntryHistorical {
    pub fn new() -> Self {
        Self::default()
    }

    /// History of a freshly added entry
    pub fn for_add(csn: Csn) -> Self {
        Self {
            add_csn: Some(csn),
            ..Self::default()
        }
    }

    /// Decode the historical attribute of `entry`
    ///
    /// Unreadable values are skipped with a warning; they cannot be trusted
    /// for conflict resolution anyway.
    pub fn from_entry(entry: &Entry, registry: &SyntaxRegistry) -> Self {
        let mut hist = Self::new();
        let mut per_attr: BTreeMap<AttrDesc, Vec<HistTuple>> = BTreeMap::new();

        for line in entry.values(&AttrDesc::new(HISTORICAL_ATTR)) {
            match HistLine::parse(line, registry) {
                Ok(HistLine::Attr(tuple)) => per_attr.entry(tuple.attr.clone()).or_default().push(tuple),
                Ok(HistLine::DnAdd(csn)) => hist.add_csn = hist.add_csn.max(Some(csn)),
                Ok(HistLine::DnModdn(csn)) => hist.moddn_csn = hist.moddn_csn.max(Some(csn)),
                Err(e) => warn!(dn = %entry.dn, error = %e, "Skipping historical value"),
            }
        }

        for (attr, tuples) in per_attr {
            hist.attributes
                .insert(attr, AttrHistorical::from_tuples(&tuples, registry));
        }
        hist
    }

    pub fn add_csn(&self) -> Option<Csn> {
        self.add_csn
    }

    pub fn moddn_csn(&self) -> Option<Csn> {
        self.moddn_csn
    }

    /// When the entry got its current DN
    pub fn dn_date(&self) -> Option<Csn> {
        self.moddn_csn.max(self.add_csn)
    }

    pub fn set_moddn(&mut self, csn: Csn) {
        self.moddn_csn = self.moddn_csn.max(Some(csn));
    }

    /// Was the entry added or renamed after `csn`?
    pub fn added_or_renamed_after(&self, csn: &Csn) -> bool {
        self.dn_date().is_some_and(|d| d > *csn)
    }

    pub fn attribute(&self, attr: &AttrDesc) -> Option<&AttrHistorical> {
        self.attributes.get(attr)
    }

    /// Newest CSN anywhere in the record
    pub fn last_csn(&self) -> Option<Csn> {
        self.attributes
            .values()
            .filter_map(AttrHistorical::last_csn)
            .chain(self.add_csn)
            .chain(self.moddn_csn)
            .max()
    }

    /// Replay the modifications of one MODIFY against `entry`
    pub fn replay_modifications(
        &mut self,
        entry: &mut Entry,
        csn: Csn,
        mods: &[Modification],
        registry: &SyntaxRegistry,
    ) -> ModifyReplay {
        let mut outcome = ModifyReplay::default();

        for m in mods {
            let hist = self.attributes.entry(m.attr.clone()).or_default();
            match m.kind {
                ModKind::Add => {
                    for value in &m.values {
                        outcome.count(hist.add_value(entry, &m.attr, value, csn, registry));
                    }
                }
                ModKind::Delete if m.values.is_empty() => {
                    outcome.count(hist.delete_attribute(entry, &m.attr, csn, registry));
                }
                ModKind::Delete => {
                    for value in &m.values {
                        outcome.count(hist.delete_value(entry, &m.attr, value, csn, registry));
                    }
                }
                ModKind::Replace => {
                    outcome.count(hist.replace(entry, &m.attr, &m.values, csn, registry));
                }
            }
        }

        self.attributes.retain(|_, h| !h.is_empty());
        outcome
    }

    /// All attribute tuples, oldest first
    pub fn tuples(&self) -> Vec<HistTuple> {
        let mut all: Vec<HistTuple> = self
            .attributes
            .iter()
            .flat_map(|(attr, h)| h.tuples(attr))
            .collect();
        all.sort_by_key(|t| t.csn);
        all
    }

    pub fn encode(&self, registry: &SyntaxRegistry) -> Vec<String> {
        let mut out: Vec<String> = self.tuples().iter().map(|t| t.encode(registry)).collect();
        if let Some(csn) = self.add_csn {
            out.push(format!("dn:{}:add", csn));
        }
        if let Some(csn) = self.moddn_csn {
            out.push(format!("dn:{}:moddn", csn));
        }
        out
    }

    /// Write the encoded record into the entry's historical attribute
    pub fn store(&self, entry: &mut Entry, registry: &SyntaxRegistry) {
        entry.set_values(AttrDesc::new(HISTORICAL_ATTR), self.encode(registry));
    }

    /// Drop tuples older than `purge_delay_ms`
    ///
    /// The newest tuple of each attribute always survives, whatever its age,
    /// and the DN dates are never purged. Returns the remaining encoded
    /// values and how many tuples were removed.
    pub fn encode_and_purge(
        &mut self,
        purge_delay_ms: u64,
        now_ms: u64,
        registry: &SyntaxRegistry,
    ) -> (Vec<String>, usize) {
        let mut removed = 0;

        for (attr, hist) in self.attributes.iter_mut() {
            let tuples = hist.tuples(attr);
            let Some(latest) = tuples.iter().map(|t| t.csn).max() else {
                continue;
            };
            let (keep, purge): (Vec<HistTuple>, Vec<HistTuple>) = tuples
                .into_iter()
                .partition(|t| t.csn == latest || t.csn.age_ms(now_ms) <= purge_delay_ms);
            if purge.is_empty() {
                continue;
            }
            removed += purge.len();
            *hist = AttrHistorical::from_tuples(&keep, registry);
        }

        self.attributes.retain(|_, h| !h.is_empty());
        (self.encode(registry), removed)
    }
}

impl fmt::Display for EntryHistorical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attribute(s), dn date {}",
            self.attributes.len(),
            self.dn_date().map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
        )
    }
}
