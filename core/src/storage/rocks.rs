//! RocksDB-based persistent entry store
//!
//! Key layout:
//! - `uuid:<16 bytes>` -> CBOR-encoded entry
//! - `dn:<normalised dn>` -> uuid bytes
//! - `child:<normalised parent dn>\0<16 bytes>` -> empty

use super::EntryStore;
use crate::dn::Dn;
use crate::types::{Entry, EntryUuid};
use crate::{Error, Result};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use uuid::Uuid;

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        Ok(Self { db })
    }

    fn get_uuid(&self, dn: &Dn) -> Result<Option<EntryUuid>> {
        match self.db.get(self.dn_key(dn)) {
            Ok(Some(bytes)) => {
                let uuid = Uuid::from_slice(&bytes)
                    .map_err(|e| Error::Serialization(format!("Corrupt DN index: {}", e)))?;
                Ok(Some(EntryUuid(uuid)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read DN index: {}", e))),
        }
    }

    fn decode_entry(value: &[u8]) -> Result<Entry> {
        minicbor::decode(value)
            .map_err(|e| Error::Serialization(format!("Failed to decode entry: {}", e)))
    }

    fn unlink(&self, batch: &mut WriteBatch, entry: &Entry) {
        batch.delete(self.dn_key(&entry.dn));
        if let Some(parent) = entry.dn.parent() {
            batch.delete(self.child_key(&parent, &entry.uuid));
        }
    }

    // Key construction helpers
    fn uuid_key(&self, uuid: &EntryUuid) -> Vec<u8> {
        let mut key = b"uuid:".to_vec();
        key.extend_from_slice(uuid.0.as_bytes());
        key
    }

    fn dn_key(&self, dn: &Dn) -> Vec<u8> {
        let mut key = b"dn:".to_vec();
        key.extend_from_slice(dn.normalized().as_bytes());
        key
    }

    fn child_prefix(&self, parent: &Dn) -> Vec<u8> {
        let mut prefix = b"child:".to_vec();
        prefix.extend_from_slice(parent.normalized().as_bytes());
        prefix.push(0);
        prefix
    }

    fn child_key(&self, parent: &Dn, uuid: &EntryUuid) -> Vec<u8> {
        let mut key = self.child_prefix(parent);
        key.extend_from_slice(uuid.0.as_bytes());
        key
    }
}

impl EntryStore for RocksStore {
    fn read_entry(&self, dn: &Dn) -> Result<Option<Entry>> {
        match self.get_uuid(dn)? {
            Some(uuid) => self.read_by_uuid(&uuid),
            None => Ok(None),
        }
    }

    fn read_by_uuid(&self, uuid: &EntryUuid) -> Result<Option<Entry>> {
        match self.db.get(self.uuid_key(uuid)) {
            Ok(Some(value)) => Ok(Some(Self::decode_entry(&value)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to get entry: {}", e))),
        }
    }

    fn write_entry(&self, entry: &Entry) -> Result<()> {
        if let Some(holder) = self.get_uuid(&entry.dn)? {
            if holder != entry.uuid {
                return Err(Error::EntryAlreadyExists(entry.dn.to_string()));
            }
        }

        let value = minicbor::to_vec(entry)
            .map_err(|e| Error::Serialization(format!("Failed to encode entry: {}", e)))?;

        let mut batch = WriteBatch::default();
        if let Some(previous) = self.read_by_uuid(&entry.uuid)? {
            self.unlink(&mut batch, &previous);
        }
        batch.put(self.uuid_key(&entry.uuid), &value);
        batch.put(self.dn_key(&entry.dn), entry.uuid.0.as_bytes());
        if let Some(parent) = entry.dn.parent() {
            batch.put(self.child_key(&parent, &entry.uuid), b"");
        }

        self.db
            .write(batch)
            .map_err(|e| Error::Storage(format!("Failed to store entry: {}", e)))
    }

    fn delete_entry(&self, dn: &Dn) -> Result<bool> {
        let Some(entry) = self.read_entry(dn)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::default();
        self.unlink(&mut batch, &entry);
        batch.delete(self.uuid_key(&entry.uuid));
        self.db
            .write(batch)
            .map_err(|e| Error::Storage(format!("Failed to delete entry: {}", e)))?;
        Ok(true)
    }

    fn all_entries(&self) -> Result<Vec<Entry>> {
        let prefix = b"uuid:".to_vec();
        let mut entries = Vec::new();

        let iter = self.db.iterator(IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| Error::Storage(format!("Iterator error: {}", e)))?;
            if !key.starts_with(&prefix) {
                break;
            }
            entries.push(Self::decode_entry(&value)?);
        }

        Ok(entries)
    }

    fn children(&self, dn: &Dn) -> Result<Vec<Entry>> {
        let prefix = self.child_prefix(dn);
        let mut children = Vec::new();

        let iter = self.db.iterator(IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(|e| Error::Storage(format!("Iterator error: {}", e)))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let uuid = Uuid::from_slice(&key[prefix.len()..])
                .map_err(|e| Error::Serialization(format!("Corrupt child index: {}", e)))?;
            if let Some(child) = self.read_by_uuid(&EntryUuid(uuid))? {
                children.push(child);
            }
        }

        Ok(children)
    }
}
