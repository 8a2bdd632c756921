//! Attribute syntaxes
//!
//! Each syntax is a [`ValueCodec`]: it normalises values for matching and
//! converts them to and from the form kept in the historical attribute.
//! [`SyntaxRegistry`] maps syntax ids to codecs and attribute types to
//! syntax ids. Types nobody registered fall back to `directory-string`.

use crate::dn::{normalize_value, Dn};
use crate::types::AttrDesc;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub const DIRECTORY_STRING: &str = "directory-string";
pub const CASE_EXACT_STRING: &str = "case-exact-string";
pub const INTEGER: &str = "integer";
pub const DN_SYNTAX: &str = "dn";

/// Encoder/decoder pair for one attribute syntax
pub trait ValueCodec: Send + Sync {
    fn syntax_id(&self) -> &'static str;

    /// Matching form of `value`
    fn normalize(&self, value: &str) -> Result<String>;

    /// Form written into a historical tuple
    fn encode(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }

    /// Inverse of [`ValueCodec::encode`]
    fn decode(&self, encoded: &str) -> Result<String> {
        Ok(encoded.to_string())
    }
}

/// Case-insensitive string, inner whitespace collapsed
pub struct DirectoryStringCodec;

impl ValueCodec for DirectoryStringCodec {
    fn syntax_id(&self) -> &'static str {
        DIRECTORY_STRING
    }

    fn normalize(&self, value: &str) -> Result<String> {
        Ok(normalize_value(value))
    }
}

/// Case-sensitive string, inner whitespace collapsed
pub struct CaseExactStringCodec;

impl ValueCodec for CaseExactStringCodec {
    fn syntax_id(&self) -> &'static str {
        CASE_EXACT_STRING
    }

    fn normalize(&self, value: &str) -> Result<String> {
        Ok(value.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

/// Signed decimal integer
pub struct IntegerCodec;

impl IntegerCodec {
    fn parse(value: &str) -> Result<i128> {
        value
            .trim()
            .parse::<i128>()
            .map_err(|e| Error::InvalidAttribute(format!("invalid integer '{}': {}", value, e)))
    }
}

impl ValueCodec for IntegerCodec {
    fn syntax_id(&self) -> &'static str {
        INTEGER
    }

    fn normalize(&self, value: &str) -> Result<String> {
        Ok(Self::parse(value)?.to_string())
    }

    fn encode(&self, value: &str) -> Result<String> {
        Ok(Self::parse(value)?.to_string())
    }

    fn decode(&self, encoded: &str) -> Result<String> {
        Ok(Self::parse(encoded)?.to_string())
    }
}

/// Distinguished name values (`member`, `manager`, ...)
pub struct DnCodec;

impl ValueCodec for DnCodec {
    fn syntax_id(&self) -> &'static str {
        DN_SYNTAX
    }

    fn normalize(&self, value: &str) -> Result<String> {
        Ok(Dn::parse(value)?.normalized())
    }

    fn encode(&self, value: &str) -> Result<String> {
        Ok(Dn::parse(value)?.to_string())
    }

    fn decode(&self, encoded: &str) -> Result<String> {
        Ok(Dn::parse(encoded)?.to_string())
    }
}

/// Registry of codecs keyed by syntax id
#[derive(Clone)]
pub struct SyntaxRegistry {
    codecs: HashMap<&'static str, Arc<dyn ValueCodec>>,
    attribute_syntax: HashMap<String, &'static str>,
    fallback: Arc<dyn ValueCodec>,
}

impl SyntaxRegistry {
    /// Registry holding only the fallback directory-string codec
    pub fn new() -> Self {
        let fallback: Arc<dyn ValueCodec> = Arc::new(DirectoryStringCodec);
        let mut codecs = HashMap::new();
        codecs.insert(DIRECTORY_STRING, fallback.clone());
        Self {
            codecs,
            attribute_syntax: HashMap::new(),
            fallback,
        }
    }

    /// Registry with the built-in codecs and the usual attribute mappings
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_codec(Arc::new(CaseExactStringCodec));
        registry.register_codec(Arc::new(IntegerCodec));
        registry.register_codec(Arc::new(DnCodec));

        let mappings = [
            ("member", DN_SYNTAX),
            ("uniquemember", DN_SYNTAX),
            ("manager", DN_SYNTAX),
            ("seealso", DN_SYNTAX),
            ("owner", DN_SYNTAX),
            ("ds-sync-conflict", DN_SYNTAX),
            ("uidnumber", INTEGER),
            ("gidnumber", INTEGER),
            ("employeenumber", INTEGER),
            ("userpassword", CASE_EXACT_STRING),
            ("ds-sync-hist", CASE_EXACT_STRING),
        ];
        for (attr, syntax) in mappings {
            registry.attribute_syntax.insert(attr.to_string(), syntax);
        }
        registry
    }

    pub fn register_codec(&mut self, codec: Arc<dyn ValueCodec>) {
        self.codecs.insert(codec.syntax_id(), codec);
    }

    /// Bind an attribute type to a registered syntax
    pub fn map_attribute(&mut self, attr_type: &str, syntax_id: &str) -> Result<()> {
        let (id, _) = self
            .codecs
            .get_key_value(syntax_id)
            .ok_or_else(|| Error::Config(format!("unknown syntax '{}'", syntax_id)))?;
        self.attribute_syntax.insert(attr_type.to_ascii_lowercase(), *id);
        Ok(())
    }

    pub fn codec(&self, syntax_id: &str) -> Option<&dyn ValueCodec> {
        self.codecs.get(syntax_id).map(|c| c.as_ref())
    }

    pub fn codec_for(&self, attr: &AttrDesc) -> &dyn ValueCodec {
        self.attribute_syntax
            .get(attr.name())
            .and_then(|id| self.codecs.get(id))
            .unwrap_or(&self.fallback)
            .as_ref()
    }

    /// Matching key for a value of `attr`
    ///
    /// Values the codec rejects still get a usable key from the generic
    /// string normalisation; replay must not stall on a bad value.
    pub fn normalize(&self, attr: &AttrDesc, value: &str) -> String {
        self.codec_for(attr)
            .normalize(value)
            .unwrap_or_else(|_| normalize_value(value))
    }
}

impl Default for SyntaxRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SyntaxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.codecs.keys().collect();
        ids.sort();
        f.debug_struct("SyntaxRegistry")
            .field("codecs", &ids)
            .field("attributes", &self.attribute_syntax.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fallback() {
        let registry = SyntaxRegistry::with_defaults();
        let attr = AttrDesc::new("description");
        assert_eq!(registry.codec_for(&attr).syntax_id(), DIRECTORY_STRING);
        assert_eq!(registry.normalize(&attr, "  Hello   World "), "hello world");
    }

    #[test]
    fn test_case_exact() {
        let registry = SyntaxRegistry::with_defaults();
        let attr = AttrDesc::new("userPassword");
        assert_eq!(registry.normalize(&attr, "Secret"), "Secret");
    }

    #[test]
    fn test_integer_codec() {
        let registry = SyntaxRegistry::with_defaults();
        let attr = AttrDesc::new("uidNumber");
        assert_eq!(registry.normalize(&attr, "+0042"), "42");
        assert!(registry.codec_for(&attr).encode("abc").is_err());
        // unparseable values still normalise
        assert_eq!(registry.normalize(&attr, "ABC"), "abc");
    }

    #[test]
    fn test_dn_codec() {
        let registry = SyntaxRegistry::with_defaults();
        let attr = AttrDesc::new("member");
        assert_eq!(
            registry.normalize(&attr, "CN=Bob, dc=Example"),
            registry.normalize(&attr, "cn=bob,dc=example")
        );
    }

    #[test]
    fn test_map_attribute() {
        let mut registry = SyntaxRegistry::with_defaults();
        registry.map_attribute("roomNumber", INTEGER).unwrap();
        assert_eq!(
            registry.codec_for(&AttrDesc::new("roomnumber")).syntax_id(),
            INTEGER
        );
        assert!(registry.map_attribute("x", "no-such-syntax").is_err());
    }
}
