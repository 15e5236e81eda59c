use base64::Engine;
use std::fmt;

use crate::error::{Error, Result};

/// Suffix marking a key whose values are opaque bytes rather than text.
const BINARY_SUFFIX: &str = "-bin";

/// A single metadata value: UTF-8 text for ordinary keys, raw bytes for
/// `-bin` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Vec<u8>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Ascii(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Ascii(s)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        MetadataValue::Binary(b)
    }
}

/// Whether a key names a binary-valued entry.
pub fn is_binary_key(key: &str) -> bool {
    key.to_ascii_lowercase().ends_with(BINARY_SUFFIX)
}

/// An ordered multimap of header entries.
///
/// Keys are ASCII and case-insensitive for lookup, but the spelling used
/// at insertion is preserved on emit. A key may carry several values;
/// `get_all` returns them in insertion order. Keys ending in `-bin` carry
/// binary values, all other keys carry UTF-8 text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    /// Append a value under `key`, keeping any existing values.
    ///
    /// Fails if the key is empty or non-ASCII, or if the value typing does
    /// not match the key (`-bin` keys take binary values, others text).
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        validate_entry(&key, &value)?;
        self.entries.push((key, value));
        Ok(())
    }

    /// Replace all values under `key` with the single given value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        validate_entry(&key, &value)?;
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(&key));
        self.entries.push((key, value));
        Ok(())
    }

    /// The first value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// All values under `key`, in insertion order. Empty if absent.
    pub fn get_all(&self, key: &str) -> Vec<&MetadataValue> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
            .collect()
    }

    /// Remove every value under `key`.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// Append all of `other`'s entries after this map's own, preserving
    /// both insertion orders.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_entry(key: &str, value: &MetadataValue) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("metadata key is empty".into()));
    }
    if !key.is_ascii() {
        return Err(Error::InvalidArgument(format!(
            "metadata key {key:?} is not ASCII"
        )));
    }
    match value {
        MetadataValue::Binary(_) if !is_binary_key(key) => Err(Error::InvalidArgument(format!(
            "binary metadata value requires a key ending in \"-bin\", got {key:?}"
        ))),
        MetadataValue::Ascii(_) if is_binary_key(key) => Err(Error::InvalidArgument(format!(
            "metadata key {key:?} requires a binary value"
        ))),
        _ => Ok(()),
    }
}

impl fmt::Display for Metadata {
    /// One `name: value` line per entry; binary values are base64-encoded.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("(empty)");
        }
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                writeln!(f)?;
            }
            first = false;
            match value {
                MetadataValue::Ascii(s) => write!(f, "{key}: {s}")?,
                MetadataValue::Binary(b) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(b);
                    write!(f, "{key}: {encoded}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get_single_value() {
        let mut md = Metadata::new();
        md.add("authorization", "Bearer token123").unwrap();
        assert_eq!(
            md.get("authorization").and_then(|v| v.as_str()),
            Some("Bearer token123")
        );
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut md = Metadata::new();
        md.add("X-Custom", "v").unwrap();
        assert!(md.get("x-custom").is_some());
        assert!(md.get("X-CUSTOM").is_some());
    }

    #[test]
    fn spelling_preserved_on_emit() {
        let mut md = Metadata::new();
        md.add("X-Custom", "v").unwrap();
        let keys: Vec<&str> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["X-Custom"]);
    }

    #[test]
    fn add_appends_get_all_preserves_order() {
        let mut md = Metadata::new();
        md.add("k", "one").unwrap();
        md.add("K", "two").unwrap();
        let values: Vec<&str> = md.get_all("k").iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(values, ["one", "two"]);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut md = Metadata::new();
        md.add("k", "one").unwrap();
        md.add("k", "two").unwrap();
        md.set("k", "three").unwrap();
        let values: Vec<&str> = md.get_all("k").iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(values, ["three"]);
    }

    #[test]
    fn binary_key_takes_binary_value() {
        let mut md = Metadata::new();
        md.add("x-data-bin", vec![0xAB, 0xAB, 0xAB]).unwrap();
        assert_eq!(md.get("x-data-bin").unwrap().as_bytes(), &[0xAB, 0xAB, 0xAB]);
    }

    #[test]
    fn binary_value_under_text_key_rejected() {
        let mut md = Metadata::new();
        let err = md.add("x-data", vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn text_value_under_binary_key_rejected() {
        let mut md = Metadata::new();
        let err = md.add("x-data-bin", "text").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn empty_key_rejected() {
        let mut md = Metadata::new();
        assert!(md.add("", "v").is_err());
    }

    #[test]
    fn clone_is_independent_both_ways() {
        let mut original = Metadata::new();
        original.add("k", "v").unwrap();

        let mut copy = original.clone();
        copy.add("k", "extra").unwrap();
        copy.set("other", "x").unwrap();
        assert_eq!(original.get_all("k").len(), 1);
        assert!(original.get("other").is_none());

        original.remove("k");
        assert_eq!(copy.get_all("k").len(), 2);
    }

    #[test]
    fn merge_concatenates_preserving_order() {
        let mut a = Metadata::new();
        a.add("k", "one").unwrap();
        let mut b = Metadata::new();
        b.add("k", "two").unwrap();
        b.add("j", "three").unwrap();
        a.merge(b);
        let values: Vec<&str> = a.get_all("k").iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(values, ["one", "two"]);
        assert!(a.get("j").is_some());
    }

    #[test]
    fn display_encodes_binary_as_base64() {
        let mut md = Metadata::new();
        md.add("x-data-bin", b"hello".to_vec()).unwrap();
        assert_eq!(md.to_string(), "x-data-bin: aGVsbG8=");
    }

    #[test]
    fn display_empty() {
        assert_eq!(Metadata::new().to_string(), "(empty)");
    }
}
