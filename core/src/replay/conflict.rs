//! Naming conflict resolution
//!
//! An entry that loses a naming conflict is parked directly under the
//! suffix with its entryUUID prepended to its RDN
//! (`entryUUID=<uuid>+cn=x,dc=example`) and tagged with
//! `ds-sync-conflict: <natural dn>`. It moves back as soon as its natural
//! DN is freed by a DELETE or MODRDN.
//!
//! Renames done here are local repairs: they never touch the DN date in the
//! historical record, so every replica keeps ordering entries the same way.

use super::{ReplayEngine, ReplayReport};
use crate::dn::{Ava, Dn, Rdn};
use crate::historical::EntryHistorical;
use crate::syntax::SyntaxRegistry;
use crate::types::{AttrDesc, Entry, EntryUuid, ModKind, Modification, ENTRY_UUID_ATTR};
use crate::{Error, Result};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// DN an entry is parked at when it loses a naming conflict
pub fn conflict_dn(uuid: &EntryUuid, rdn: &Rdn, base_dn: &Dn) -> Dn {
    let ava = Ava::new(ENTRY_UUID_ATTR, uuid.to_string());
    let rdn = match rdn.without(ENTRY_UUID_ATTR) {
        Some(rest) => rest.prepend(ava),
        None => Rdn::new(ENTRY_UUID_ATTR, uuid.to_string()),
    };
    base_dn.child(rdn)
}

/// Is the entry sitting at a conflict DN?
pub fn is_parked(entry: &Entry) -> bool {
    entry
        .dn
        .rdn()
        .is_some_and(|rdn| rdn.values_of(ENTRY_UUID_ATTR).next().is_some())
}

/// Where the entry belongs once its conflicts are gone
pub fn natural_dn(entry: &Entry) -> Dn {
    entry.conflict_marker().unwrap_or_else(|| entry.dn.clone())
}

/// RDN the entry is named by, without the conflict prefix
pub fn naming_rdn(entry: &Entry) -> Option<Rdn> {
    if is_parked(entry) {
        if let Some(natural) = entry.conflict_marker() {
            return natural.rdn().cloned();
        }
        return entry.dn.rdn().and_then(|rdn| rdn.without(ENTRY_UUID_ATTR));
    }
    entry.dn.rdn().cloned()
}

/// Rewrite modifications so they cannot remove the values used in `rdn`
///
/// - a value delete loses the RDN values it names (and vanishes if nothing is left)
/// - an attribute delete becomes a replace with the RDN values
/// - a replace gets the missing RDN values added
///
/// Returns the rewritten list and one note per adjusted modification.
pub fn protect_rdn(
    mods: Vec<Modification>,
    rdn: &Rdn,
    registry: &SyntaxRegistry,
) -> (Vec<Modification>, Vec<String>) {
    let mut out = Vec::with_capacity(mods.len());
    let mut notes = Vec::new();

    for mut m in mods {
        if !m.attr.options().is_empty() {
            out.push(m);
            continue;
        }
        let rdn_values: Vec<String> = rdn.values_of(m.attr.name()).map(str::to_string).collect();
        if rdn_values.is_empty() {
            out.push(m);
            continue;
        }

        let in_rdn = |attr: &AttrDesc, value: &str| {
            let key = registry.normalize(attr, value);
            rdn_values.iter().any(|r| registry.normalize(attr, r) == key)
        };

        match m.kind {
            ModKind::Add => {}
            ModKind::Delete if m.values.is_empty() => {
                m.kind = ModKind::Replace;
                m.values = rdn_values.clone();
                notes.push(format!("delete of {} kept the RDN value(s)", m.attr));
            }
            ModKind::Delete => {
                let before = m.values.len();
                let attr = m.attr.clone();
                m.values.retain(|v| !in_rdn(&attr, v));
                if m.values.len() != before {
                    notes.push(format!("RDN value(s) of {} not deleted", m.attr));
                }
                if m.values.is_empty() {
                    continue;
                }
            }
            ModKind::Replace => {
                let missing: Vec<String> = rdn_values
                    .iter()
                    .filter(|r| {
                        let key = registry.normalize(&m.attr, r);
                        !m.values.iter().any(|v| registry.normalize(&m.attr, v) == key)
                    })
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    m.values.extend(missing);
                    notes.push(format!("replace of {} kept the RDN value(s)", m.attr));
                }
            }
        }
        out.push(m);
    }

    (out, notes)
}

impl ReplayEngine {
    /// Move an entry and everything below it to `new_dn`
    ///
    /// `entry` is written as given (attributes included) at `new_dn`.
    pub(super) fn move_subtree(&self, entry: &Entry, new_dn: &Dn) -> Result<()> {
        let old_dn = entry.dn.clone();
        let below = if old_dn == *new_dn {
            Vec::new()
        } else {
            self.store.subtree(&old_dn)?
        };

        let mut moved = entry.clone();
        moved.dn = new_dn.clone();
        self.store.write_entry(&moved)?;

        for mut descendant in below {
            if let Some(dn) = descendant.dn.rebase(&old_dn, new_dn) {
                descendant.dn = dn;
                self.store.write_entry(&descendant)?;
            }
        }
        Ok(())
    }

    /// Park `entry` at its conflict DN with `natural` as its real name
    ///
    /// `stored` tells whether the entry (and a subtree) already exists in
    /// the store; a new entry is written directly.
    pub(super) fn park(&self, entry: &mut Entry, natural: &Dn, stored: bool) -> Result<()> {
        if !self.solve_conflicts {
            return Err(Error::NamingConflict(natural.to_string()));
        }
        let rdn = natural
            .rdn()
            .or_else(|| entry.dn.rdn())
            .cloned()
            .ok_or_else(|| Error::InvalidDn("the root entry cannot be parked".to_string()))?;
        let target = conflict_dn(&entry.uuid, &rdn, &self.base_dn);

        entry.set_conflict_marker(Some(natural));
        if stored {
            self.move_subtree(entry, &target)?;
        } else {
            entry.dn = target.clone();
            self.store.write_entry(entry)?;
        }
        entry.dn = target;

        self.counters.unresolved_naming.fetch_add(1, Ordering::Relaxed);
        warn!(uuid = %entry.uuid, natural = %natural, parked = %entry.dn, "Unresolved naming conflict, entry parked");
        Ok(())
    }

    /// Give `freed` back to the oldest entry waiting for it
    pub(super) fn cleanup_conflicts(&self, freed: &Dn, report: &mut ReplayReport) -> Result<()> {
        if self.store.read_entry(freed)?.is_some() {
            return Ok(());
        }
        if !self.parent_exists(freed)? {
            return Ok(());
        }

        let candidate = self
            .store
            .find_conflicts(freed)?
            .into_iter()
            .filter(is_parked)
            .min_by_key(|e| {
                (
                    EntryHistorical::from_entry(e, &self.registry).dn_date(),
                    e.uuid,
                )
            });
        let Some(mut entry) = candidate else {
            return Ok(());
        };

        let parked_at = entry.dn.clone();
        entry.set_conflict_marker(None);
        self.move_subtree(&entry, freed)?;

        self.counters.resolved_naming.fetch_add(1, Ordering::Relaxed);
        report
            .warnings
            .push(format!("entry {} moved back from {} to {}", entry.uuid, parked_at, freed));
        info!(uuid = %entry.uuid, from = %parked_at, to = %freed, "Naming conflict resolved, entry renamed back");
        Ok(())
    }

    /// Does the parent of `dn` exist (or lie outside the replicated suffix)?
    pub(super) fn parent_exists(&self, dn: &Dn) -> Result<bool> {
        match dn.parent() {
            None => Ok(true),
            Some(parent) if !self.in_suffix(&parent) => Ok(true),
            Some(parent) => Ok(self.store.read_entry(&parent)?.is_some()),
        }
    }

    pub(super) fn in_suffix(&self, dn: &Dn) -> bool {
        *dn == self.base_dn || dn.is_descendant_of(&self.base_dn)
    }
}
