//! Distinguished names
//!
//! A [`Dn`] is an ordered list of [`Rdn`]s, leaf first. Equality and hashing
//! work on a normalised form: attribute types and values are lowercased, inner
//! whitespace collapses to a single space, and the AVAs of a multi-valued RDN
//! compare regardless of order.

use crate::{Error, Result};
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Normalise an attribute value for DN matching.
pub(crate) fn normalize_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Attribute value assertion (`cn=Alice`)
#[derive(Clone, Debug)]
pub struct Ava {
    attr_type: String,
    value: String,
}

impl Ava {
    pub fn new(attr_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attr_type: attr_type.into(),
            value: value.into(),
        }
    }

    pub fn attr_type(&self) -> &str {
        &self.attr_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_type(&self, attr_type: &str) -> bool {
        self.attr_type.eq_ignore_ascii_case(attr_type)
    }

    fn normalized(&self) -> String {
        format!(
            "{}={}",
            self.attr_type.to_ascii_lowercase(),
            normalize_value(&self.value)
        )
    }

    fn parse(s: &str) -> Result<Self> {
        let eq = find_unescaped(s, '=')
            .ok_or_else(|| Error::InvalidDn(format!("missing '=' in '{}'", s)))?;
        let attr_type = s[..eq].trim();
        if attr_type.is_empty() {
            return Err(Error::InvalidDn(format!("empty attribute type in '{}'", s)));
        }
        Ok(Self::new(attr_type, unescape(&s[eq + 1..])?))
    }
}

impl fmt::Display for Ava {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attr_type, escape(&self.value))
    }
}

/// Relative distinguished name, one or more AVAs joined with `+`
#[derive(Clone, Debug)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    pub fn new(attr_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            avas: vec![Ava::new(attr_type, value)],
        }
    }

    pub fn from_avas(avas: Vec<Ava>) -> Result<Self> {
        if avas.is_empty() {
            return Err(Error::InvalidDn("RDN without any AVA".to_string()));
        }
        Ok(Self { avas })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let avas = split_unescaped(s, '+')
            .into_iter()
            .map(Ava::parse)
            .collect::<Result<Vec<_>>>()?;
        Self::from_avas(avas)
    }

    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// Values carried by this RDN for one attribute type
    pub fn values_of<'a>(&'a self, attr_type: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.avas
            .iter()
            .filter(move |ava| ava.is_type(attr_type))
            .map(|ava| ava.value())
    }

    /// Copy of this RDN without AVAs of `attr_type`, `None` if nothing is left
    pub fn without(&self, attr_type: &str) -> Option<Rdn> {
        let avas: Vec<Ava> = self
            .avas
            .iter()
            .filter(|ava| !ava.is_type(attr_type))
            .cloned()
            .collect();
        if avas.is_empty() {
            None
        } else {
            Some(Rdn { avas })
        }
    }

    /// Copy of this RDN with `ava` placed in front
    pub fn prepend(&self, ava: Ava) -> Rdn {
        let mut avas = Vec::with_capacity(self.avas.len() + 1);
        avas.push(ava);
        avas.extend(self.avas.iter().cloned());
        Rdn { avas }
    }

    pub fn normalized(&self) -> String {
        let mut parts: Vec<String> = self.avas.iter().map(Ava::normalized).collect();
        parts.sort();
        parts.join("+")
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Rdn {}

impl Hash for Rdn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}", ava)?;
        }
        Ok(())
    }
}

/// Distinguished name, leaf RDN first
#[derive(Clone, Debug, Default)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The empty (root) DN
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::root());
        }
        let rdns = split_unescaped(s, ',')
            .into_iter()
            .map(Rdn::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rdns })
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// True when `self` sits strictly below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.rdns.len() > ancestor.rdns.len()
            && self.rdns[self.rdns.len() - ancestor.rdns.len()..] == ancestor.rdns[..]
    }

    /// Move `self` from under `old_base` to under `new_base`.
    ///
    /// Returns `None` when `self` is neither `old_base` nor below it.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if self == old_base {
            return Some(new_base.clone());
        }
        if !self.is_descendant_of(old_base) {
            return None;
        }
        let keep = self.rdns.len() - old_base.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Some(Dn { rdns })
    }

    pub fn normalized(&self) -> String {
        self.rdns
            .iter()
            .map(Rdn::normalized)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Dn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Dn::parse(s)
    }
}

impl<C> Encode<C> for Dn {
    fn encode<W: minicbor::encode::Write>(&self, e: &mut minicbor::Encoder<W>, _ctx: &mut C) -> std::result::Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.to_string())?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for Dn {
    fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> std::result::Result<Self, minicbor::decode::Error> {
        let s = d.str()?;
        Dn::parse(s).map_err(|_| minicbor::decode::Error::message("invalid DN"))
    }
}

impl<C> Encode<C> for Rdn {
    fn encode<W: minicbor::encode::Write>(&self, e: &mut minicbor::Encoder<W>, _ctx: &mut C) -> std::result::Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.to_string())?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for Rdn {
    fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> std::result::Result<Self, minicbor::decode::Error> {
        let s = d.str()?;
        Rdn::parse(s).map_err(|_| minicbor::decode::Error::message("invalid RDN"))
    }
}

impl Serialize for Dn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Dn::parse(&s).map_err(serde::de::Error::custom)
    }
}

// Parsing helpers

fn find_unescaped(s: &str, sep: char) -> Option<usize> {
    let mut escaped = false;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            quoted = !quoted;
        } else if c == sep && !quoted {
            return Some(i);
        }
    }
    None
}

fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(i) = find_unescaped(rest, sep) {
        parts.push(&rest[..i]);
        rest = &rest[i + sep.len_utf8()..];
    }
    parts.push(rest);
    parts
}

fn unescape(raw: &str) -> Result<String> {
    let start = raw.trim_start();
    let mut raw = start.trim_end();
    if raw.ends_with('\\') && start.len() > raw.len() {
        // keep an escaped trailing space
        raw = &start[..raw.len() + 1];
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Ok(raw[1..raw.len() - 1].replace("\\\"", "\""));
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match (bytes.get(i + 1), bytes.get(i + 2)) {
            (Some(hi), Some(lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                out.push(hex_val(*hi) << 4 | hex_val(*lo));
                i += 3;
            }
            (Some(next), _) => {
                out.push(*next);
                i += 2;
            }
            (None, _) => {
                return Err(Error::InvalidDn(format!("dangling escape in '{}'", raw)));
            }
        }
    }
    String::from_utf8(out).map_err(|e| Error::InvalidDn(format!("invalid UTF-8 in value: {}", e)))
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let needs = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (i == 0 && (c == '#' || c == ' '))
            || (i == last && c == ' ');
        if needs {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let dn = Dn::parse("cn=Alice Smith,ou=People,dc=example,dc=com").unwrap();
        assert_eq!(dn.depth(), 4);
        assert_eq!(dn.to_string(), "cn=Alice Smith,ou=People,dc=example,dc=com");
        assert_eq!(dn.rdn().unwrap().to_string(), "cn=Alice Smith");
    }

    #[test]
    fn test_normalized_equality() {
        let a = Dn::parse("CN=alice  smith, ou=people,dc=Example,dc=com").unwrap();
        let b = Dn::parse("cn=Alice Smith,ou=People,dc=example,dc=com").unwrap();
        assert_eq!(a, b);

        let multi_a = Rdn::parse("cn=x+sn=y").unwrap();
        let multi_b = Rdn::parse("sn=Y+cn=X").unwrap();
        assert_eq!(multi_a, multi_b);
    }

    #[test]
    fn test_escaped_separators() {
        let dn = Dn::parse(r"cn=Smith\, John,dc=example,dc=com").unwrap();
        assert_eq!(dn.depth(), 3);
        assert_eq!(dn.rdn().unwrap().avas()[0].value(), "Smith, John");
        assert_eq!(dn.to_string(), r"cn=Smith\, John,dc=example,dc=com");

        let hex = Dn::parse(r"cn=a\2Cb,dc=com").unwrap();
        assert_eq!(hex.rdn().unwrap().avas()[0].value(), "a,b");
    }

    #[test]
    fn test_parent_child_descendant() {
        let base = Dn::parse("dc=example,dc=com").unwrap();
        let people = base.child(Rdn::new("ou", "People"));
        let alice = people.child(Rdn::new("cn", "alice"));

        assert_eq!(alice.parent().unwrap(), people);
        assert!(alice.is_descendant_of(&base));
        assert!(!base.is_descendant_of(&alice));
        assert!(!people.is_descendant_of(&people));
        assert!(Dn::root().parent().is_none());
    }

    #[test]
    fn test_rebase() {
        let old = Dn::parse("ou=old,dc=com").unwrap();
        let new = Dn::parse("ou=new,dc=com").unwrap();
        let leaf = Dn::parse("cn=x,ou=old,dc=com").unwrap();

        assert_eq!(leaf.rebase(&old, &new).unwrap(), Dn::parse("cn=x,ou=new,dc=com").unwrap());
        assert_eq!(old.rebase(&old, &new).unwrap(), new);
        assert!(new.rebase(&old, &new).is_none());
    }

    #[test]
    fn test_rdn_without_and_prepend() {
        let rdn = Rdn::parse("entryUUID=1234+cn=alice").unwrap();
        assert_eq!(rdn.without("entryuuid").unwrap(), Rdn::new("cn", "alice"));
        assert!(Rdn::new("cn", "a").without("cn").is_none());

        let tagged = Rdn::new("cn", "alice").prepend(Ava::new("entryUUID", "1234"));
        assert_eq!(tagged.to_string(), "entryUUID=1234+cn=alice");
    }

    #[test]
    fn test_invalid() {
        assert!(Dn::parse("cn").is_err());
        assert!(Dn::parse("=x,dc=com").is_err());
        assert!(Dn::parse(r"cn=abc\").is_err());
    }
}
