//! Core types and identifiers used throughout the system

use crate::dn::Dn;
use crate::syntax::SyntaxRegistry;
use crate::{Error, Result};
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Operational attribute carrying the historical record
pub const HISTORICAL_ATTR: &str = "ds-sync-hist";

/// Operational attribute marking an entry parked at a conflict DN.
/// Its value is the natural DN the entry lost.
pub const CONFLICT_ATTR: &str = "ds-sync-conflict";

pub const OBJECT_CLASS_ATTR: &str = "objectclass";

pub const ENTRY_UUID_ATTR: &str = "entryUUID";

/// Replica (server) identifier, unique within the topology
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize, Debug, Default)]
#[cbor(transparent)]
pub struct ReplicaId(#[n(0)] pub u16);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Topology partition tag
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize, Debug)]
#[cbor(transparent)]
pub struct GroupId(#[n(0)] pub u8);

impl Default for GroupId {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable entry identity, survives renames
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct EntryUuid(pub Uuid);

impl EntryUuid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidAttribute(format!("invalid entryUUID '{}': {}", s, e)))
    }
}

impl Default for EntryUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<C> Encode<C> for EntryUuid {
    fn encode<W: minicbor::encode::Write>(&self, e: &mut minicbor::Encoder<W>, _ctx: &mut C) -> std::result::Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(self.0.as_bytes())?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for EntryUuid {
    fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> std::result::Result<Self, minicbor::decode::Error> {
        let bytes = d.bytes()?;
        let uuid = Uuid::from_slice(bytes).map_err(|_| minicbor::decode::Error::message("invalid UUID"))?;
        Ok(EntryUuid(uuid))
    }
}

/// Replication status of a directory server
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug, Default)]
pub enum ServerStatus {
    #[default]
    Normal,
    /// Too far behind its relay, updates are queued
    Degraded,
    /// Being re-initialised from a peer
    FullUpdate,
}

/// Attribute description: type plus options (`description;lang-fr`)
///
/// Stored lowercased with sorted options so that it can key maps directly.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AttrDesc {
    name: String,
    options: Vec<String>,
}

impl AttrDesc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_ascii_lowercase(),
            options: Vec::new(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() || name.contains(':') {
            return Err(Error::InvalidAttribute(format!("invalid attribute description '{}'", s)));
        }
        let mut desc = Self::new(name);
        for option in parts {
            desc = desc.with_option(option);
        }
        Ok(desc)
    }

    pub fn with_option(mut self, option: &str) -> Self {
        let option = option.trim().to_ascii_lowercase();
        if !option.is_empty() && !self.options.contains(&option) {
            self.options.push(option);
            self.options.sort();
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn is_type(&self, attr_type: &str) -> bool {
        self.name.eq_ignore_ascii_case(attr_type)
    }

    /// Attributes maintained by replication itself
    pub fn is_replication_internal(&self) -> bool {
        self.is_type(HISTORICAL_ATTR) || self.is_type(CONFLICT_ATTR)
    }
}

impl fmt::Display for AttrDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for option in &self.options {
            write!(f, ";{}", option)?;
        }
        Ok(())
    }
}

impl<C> Encode<C> for AttrDesc {
    fn encode<W: minicbor::encode::Write>(&self, e: &mut minicbor::Encoder<W>, _ctx: &mut C) -> std::result::Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.to_string())?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for AttrDesc {
    fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> std::result::Result<Self, minicbor::decode::Error> {
        let s = d.str()?;
        AttrDesc::parse(s).map_err(|_| minicbor::decode::Error::message("invalid attribute description"))
    }
}

/// Kind of an attribute-level modification
#[derive(Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Debug)]
#[cbor(index_only)]
pub enum ModKind {
    #[n(0)]
    Add,
    #[n(1)]
    Delete,
    #[n(2)]
    Replace,
}

/// One attribute-level change inside a MODIFY
#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug)]
pub struct Modification {
    #[n(0)]
    pub kind: ModKind,

    #[n(1)]
    pub attr: AttrDesc,

    /// Empty for "delete whole attribute" / "replace with nothing"
    #[n(2)]
    pub values: Vec<String>,
}

impl Modification {
    pub fn add(attr: &str, values: &[&str]) -> Self {
        Self::build(ModKind::Add, attr, values)
    }

    pub fn delete(attr: &str, values: &[&str]) -> Self {
        Self::build(ModKind::Delete, attr, values)
    }

    pub fn replace(attr: &str, values: &[&str]) -> Self {
        Self::build(ModKind::Replace, attr, values)
    }

    fn build(kind: ModKind, attr: &str, values: &[&str]) -> Self {
        Self {
            kind,
            attr: AttrDesc::new(attr),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Directory entry
#[derive(Clone, PartialEq, Eq, Encode, Decode, Debug)]
pub struct Entry {
    #[n(0)]
    pub dn: Dn,

    #[n(1)]
    pub uuid: EntryUuid,

    #[n(2)]
    pub attributes: BTreeMap<AttrDesc, Vec<String>>,
}

impl Entry {
    pub fn new(dn: Dn, uuid: EntryUuid) -> Self {
        Self {
            dn,
            uuid,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style helper used by tests and local writes
    pub fn with_values(mut self, attr: &str, values: &[&str]) -> Self {
        self.attributes
            .entry(AttrDesc::new(attr))
            .or_default()
            .extend(values.iter().map(|v| v.to_string()));
        self
    }

    pub fn values(&self, attr: &AttrDesc) -> &[String] {
        self.attributes.get(attr).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first_value(&self, attr_type: &str) -> Option<&str> {
        self.values(&AttrDesc::new(attr_type)).first().map(String::as_str)
    }

    pub fn object_classes(&self) -> &[String] {
        self.values(&AttrDesc::new(OBJECT_CLASS_ATTR))
    }

    pub fn has_value(&self, attr: &AttrDesc, value: &str, registry: &SyntaxRegistry) -> bool {
        let key = registry.normalize(attr, value);
        self.values(attr)
            .iter()
            .any(|v| registry.normalize(attr, v) == key)
    }

    /// Add a value, returns false when an equal value is already present
    pub fn add_value(&mut self, attr: &AttrDesc, value: &str, registry: &SyntaxRegistry) -> bool {
        if self.has_value(attr, value, registry) {
            return false;
        }
        self.attributes
            .entry(attr.clone())
            .or_default()
            .push(value.to_string());
        true
    }

    /// Remove a value, returns false when it was not present
    pub fn remove_value(&mut self, attr: &AttrDesc, value: &str, registry: &SyntaxRegistry) -> bool {
        let key = registry.normalize(attr, value);
        let Some(values) = self.attributes.get_mut(attr) else {
            return false;
        };
        let before = values.len();
        values.retain(|v| registry.normalize(attr, v) != key);
        let removed = values.len() != before;
        if values.is_empty() {
            self.attributes.remove(attr);
        }
        removed
    }

    pub fn remove_attribute(&mut self, attr: &AttrDesc) -> bool {
        self.attributes.remove(attr).is_some()
    }

    pub fn set_values(&mut self, attr: AttrDesc, values: Vec<String>) {
        if values.is_empty() {
            self.attributes.remove(&attr);
        } else {
            self.attributes.insert(attr, values);
        }
    }

    /// Natural DN recorded when the entry was parked at a conflict DN
    pub fn conflict_marker(&self) -> Option<Dn> {
        self.first_value(CONFLICT_ATTR).and_then(|v| Dn::parse(v).ok())
    }

    pub fn set_conflict_marker(&mut self, natural_dn: Option<&Dn>) {
        let attr = AttrDesc::new(CONFLICT_ATTR);
        match natural_dn {
            Some(dn) => self.set_values(attr, vec![dn.to_string()]),
            None => {
                self.attributes.remove(&attr);
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.attributes.contains_key(&AttrDesc::new(CONFLICT_ATTR))
    }

    /// User-visible attributes (replication bookkeeping excluded)
    pub fn user_attributes(&self) -> impl Iterator<Item = (&AttrDesc, &Vec<String>)> {
        self.attributes
            .iter()
            .filter(|(attr, _)| !attr.is_replication_internal())
    }

    /// Order-insensitive view of the user attributes, for comparing replicas
    pub fn user_view(&self, registry: &SyntaxRegistry) -> BTreeMap<String, BTreeSet<String>> {
        self.user_attributes()
            .map(|(attr, values)| {
                let normalized = values.iter().map(|v| registry.normalize(attr, v)).collect();
                (attr.to_string(), normalized)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Entry {
        Entry::new(Dn::parse("cn=a,dc=example").unwrap(), EntryUuid::new())
            .with_values("objectClass", &["top", "person"])
            .with_values("description", &["One"])
    }

    #[test]
    fn test_attr_desc_parse() {
        let a = AttrDesc::parse("Description;Lang-FR;binary").unwrap();
        assert_eq!(a.name(), "description");
        assert_eq!(a.to_string(), "description;binary;lang-fr");
        assert_eq!(a, AttrDesc::parse("description;binary;lang-fr").unwrap());
        assert!(AttrDesc::parse(";x").is_err());
        assert!(AttrDesc::parse("a:b").is_err());
    }

    #[test]
    fn test_add_remove_values() {
        let registry = SyntaxRegistry::with_defaults();
        let attr = AttrDesc::new("description");
        let mut e = entry();

        assert!(!e.add_value(&attr, "ONE", &registry));
        assert!(e.add_value(&attr, "two", &registry));
        assert_eq!(e.values(&attr).len(), 2);

        assert!(e.remove_value(&attr, "one", &registry));
        assert!(e.remove_value(&attr, "Two", &registry));
        assert!(!e.remove_value(&attr, "two", &registry));
        assert!(!e.attributes.contains_key(&attr));
    }

    #[test]
    fn test_conflict_marker() {
        let mut e = entry();
        assert!(!e.is_conflict());
        let natural = Dn::parse("cn=a,dc=example").unwrap();
        e.set_conflict_marker(Some(&natural));
        assert_eq!(e.conflict_marker().unwrap(), natural);
        assert_eq!(e.user_attributes().count(), 2);
        e.set_conflict_marker(None);
        assert!(!e.is_conflict());
    }

    #[test]
    fn test_entry_cbor() {
        let e = entry();
        let bytes = minicbor::to_vec(&e).unwrap();
        let decoded: Entry = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded, e);
    }
}
