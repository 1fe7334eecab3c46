//! Hierarchical configuration keys.
//!
//! Key names follow the `namespace:/segment/segment` shape, e.g.
//! `system:/config/sys/name`. Names sort by plain byte collation, which is
//! the native order of a [`KeySet`](super::KeySet) and the order array
//! elements are visited in.

use std::collections::BTreeMap;

/// A hierarchical key name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyName(String);

impl KeyName {
    pub fn new(name: &str) -> Self {
        Self(name.trim_end_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one base-name component.
    pub fn push(&mut self, base: &str) {
        if !base.is_empty() {
            self.0.push('/');
            self.0.push_str(base);
        }
    }

    /// A new name one component below this one.
    pub fn child(&self, base: &str) -> KeyName {
        let mut name = self.clone();
        name.push(base);
        name
    }

    /// The last path component.
    pub fn base_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// True when `self` sits exactly one level below `base`, with no
    /// intermediate segments.
    pub fn is_directly_below(&self, base: &KeyName) -> bool {
        match self.0.strip_prefix(base.as_str()) {
            Some(rest) => {
                rest.len() > 1 && rest.starts_with('/') && !rest[1..].contains('/')
            }
            None => false,
        }
    }

    /// True when `self` is anywhere below `base`.
    pub fn is_below(&self, base: &KeyName) -> bool {
        match self.0.strip_prefix(base.as_str()) {
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }
}

impl std::fmt::Display for KeyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decide how a selector name roots itself: a name carrying a namespace
/// (a colon before any slash) or starting at the root is absolute and
/// replaces the selection; anything else appends below the parent.
pub fn is_absolute_name(name: &str) -> bool {
    if name.starts_with('/') {
        return true;
    }
    match name.find('/') {
        Some(slash) => name[..slash].contains(':'),
        None => name.contains(':'),
    }
}

/// A key's payload: template-visible text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Binary(Vec<u8>),
}

/// One configuration entry: a name, a value, and meta attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    name: KeyName,
    value: Value,
    meta: BTreeMap<String, String>,
}

impl Key {
    pub fn text(name: KeyName, value: impl Into<String>) -> Self {
        Self {
            name,
            value: Value::Text(value.into()),
            meta: BTreeMap::new(),
        }
    }

    pub fn binary(name: KeyName, value: Vec<u8>) -> Self {
        Self {
            name,
            value: Value::Binary(value),
            meta: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &KeyName {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set_meta(&mut self, name: &str, value: impl Into<String>) {
        self.meta.insert(name.to_string(), value.into());
    }

    pub fn with_meta(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_meta(name, value);
        self
    }

    pub fn meta(&self, name: &str) -> Option<&str> {
        self.meta.get(name).map(String::as_str)
    }
}
