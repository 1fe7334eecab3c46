//! Hierarchical configuration store backing template rendering.
//!
//! The store presents an ordered set of keys namespaced under
//! [`ROOT_KEY`]. It is loaded from an INI file, mapped as follows:
//!
//! ```ini
//! [sys]
//! name = world            ; -> system:/config/sys/name = "world"
//!
//! [items]
//! @array = #2             ; meta attribute "array" on system:/config/items
//! #0 = a                  ; -> system:/config/items/#0
//! #1 = b
//! #2 = c
//! ```
//!
//! Section names may contain `/` to nest deeper. Entries whose name starts
//! with `@` become meta attributes of the section key itself; the `array`
//! attribute is what marks a key as iterable. Every render opens the store
//! fresh, so edits to the backing file are visible on the next open.

mod key;
mod keyset;

pub use key::{is_absolute_name, Key, KeyName, Value};
pub use keyset::KeySet;

use ini::Ini;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The namespace every configuration key lives under.
pub const ROOT_KEY: &str = "system:/config";

/// Errors raised while opening the store or populating its key set.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open configuration store \"{path}\": {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse configuration store \"{path}\": {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ini::ParseError,
    },
}

/// A handle on the configuration store, opened once per render.
#[derive(Debug)]
pub struct ConfigStore {
    raw: String,
    path: PathBuf,
}

impl ConfigStore {
    /// Open the store rooted at [`ROOT_KEY`], reading the backing file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            raw,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the backing file and materialize the full key set, so later
    /// lookups never touch the file again.
    pub fn key_set(&self) -> Result<KeySet, StoreError> {
        let ini = Ini::load_from_str(&self.raw).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let root = KeyName::new(ROOT_KEY);
        let mut set = KeySet::new();

        for (section, properties) in ini.iter() {
            let section_key = match section {
                Some(name) => {
                    let mut key = root.clone();
                    for segment in name.split('/').filter(|s| !s.is_empty()) {
                        key.push(segment);
                    }
                    key
                }
                None => root.clone(),
            };

            for (prop, value) in properties.iter() {
                if let Some(meta) = prop.strip_prefix('@') {
                    if set.lookup(&section_key).is_none() {
                        set.insert(Key::text(section_key.clone(), ""));
                    }
                    if let Some(key) = set.lookup_mut(&section_key) {
                        key.set_meta(meta, value);
                    }
                } else {
                    set.insert(Key::text(section_key.child(prop), value));
                }
            }
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn keys_from(contents: &str) -> KeySet {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        ConfigStore::open(file.path()).unwrap().key_set().unwrap()
    }

    #[test]
    fn open_missing_file_fails() {
        assert!(matches!(
            ConfigStore::open(Path::new("/nonexistent/store.ini")),
            Err(StoreError::Open { .. })
        ));
    }

    #[test]
    fn sections_map_to_key_prefixes() {
        let keys = keys_from("[sys]\nname = world\n");
        let key = keys
            .lookup(&KeyName::new("system:/config/sys/name"))
            .unwrap();
        assert_eq!(key.value(), &Value::Text("world".to_string()));
    }

    #[test]
    fn global_entries_sit_at_the_root() {
        let keys = keys_from("greeting = hello\n");
        assert!(keys
            .lookup(&KeyName::new("system:/config/greeting"))
            .is_some());
    }

    #[test]
    fn nested_section_names_split_on_slash() {
        let keys = keys_from("[net/eth0]\naddress = 10.0.0.1\n");
        assert!(keys
            .lookup(&KeyName::new("system:/config/net/eth0/address"))
            .is_some());
    }

    #[test]
    fn at_entries_become_meta_attributes() {
        let keys = keys_from("[items]\n@array = #2\n#0 = a\n#1 = b\n#2 = c\n");

        let base = keys.lookup(&KeyName::new("system:/config/items")).unwrap();
        assert_eq!(base.meta("array"), Some("#2"));

        let first = keys
            .lookup(&KeyName::new("system:/config/items/#0"))
            .unwrap();
        assert_eq!(first.value(), &Value::Text("a".to_string()));
    }

    #[test]
    fn array_elements_iterate_in_collation_order() {
        let keys = keys_from("[items]\n@array = #2\n#1 = b\n#0 = a\n#2 = c\n");
        let base = KeyName::new("system:/config/items");
        let children: Vec<_> = keys
            .iter()
            .filter(|k| k.name().is_directly_below(&base))
            .map(|k| match k.value() {
                Value::Text(s) => s.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(children, ["a", "b", "c"]);
    }
}
