//! Entry storage
//!
//! The replication core does not own the directory backend. It talks to it
//! through [`EntryStore`], whose operations are atomic per entry; nothing
//! here assumes cross-entry transactions.
//!
//! - [`MemoryStore`]: in-process maps, used by tests and the demo binary
//! - `RocksStore`: persistent store, behind the `rocksdb-store` feature

pub mod memory;
#[cfg(feature = "rocksdb-store")]
pub mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-store")]
pub use rocks::RocksStore;

use crate::dn::Dn;
use crate::types::{Entry, EntryUuid};
use crate::Result;
use std::collections::VecDeque;

/// Backend holding the replicated entries
pub trait EntryStore: Send + Sync {
    fn read_entry(&self, dn: &Dn) -> Result<Option<Entry>>;

    fn read_by_uuid(&self, uuid: &EntryUuid) -> Result<Option<Entry>>;

    /// Insert or update an entry, keyed by its uuid
    ///
    /// Moving an entry to a DN held by a different entry fails with
    /// `Error::EntryAlreadyExists`.
    fn write_entry(&self, entry: &Entry) -> Result<()>;

    /// Returns false when nothing was stored at `dn`
    fn delete_entry(&self, dn: &Dn) -> Result<bool>;

    fn all_entries(&self) -> Result<Vec<Entry>>;

    /// Immediate children of `dn`
    fn children(&self, dn: &Dn) -> Result<Vec<Entry>> {
        Ok(self
            .all_entries()?
            .into_iter()
            .filter(|e| e.dn.parent().as_ref() == Some(dn))
            .collect())
    }

    /// Every entry strictly below `dn`, shallowest first
    fn subtree(&self, dn: &Dn) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut frontier = VecDeque::from([dn.clone()]);
        while let Some(next) = frontier.pop_front() {
            for child in self.children(&next)? {
                frontier.push_back(child.dn.clone());
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Entries parked at a conflict DN whose natural DN is `natural_dn`
    fn find_conflicts(&self, natural_dn: &Dn) -> Result<Vec<Entry>> {
        Ok(self
            .all_entries()?
            .into_iter()
            .filter(|e| e.conflict_marker().as_ref() == Some(natural_dn))
            .collect())
    }

    fn entry_count(&self) -> Result<usize> {
        Ok(self.all_entries()?.len())
    }
}
