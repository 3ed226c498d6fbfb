//! The key-value tree.

use crate::{
    Error, KeyExistsSnafu, KeyNotFoundSnafu, MalformedValueSnafu, ReadOnlySnafu, Result,
    VersionMismatchSnafu,
};
use parking_lot::Mutex;
use serde_json::Value;
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Name of the blob carrying a packed subtree under its parent key.
pub const PACKED_CHILD: &str = ".packed.json";

/// Key of the schema version record.
pub const VERSION_KEY: &str = "/css_meta/version";

/// The key-value interface the configuration view and the placement layer
/// consume.
///
/// Keys are slash-separated paths, values are strings. A subtree may be
/// stored packed: a single JSON object at `<path>/.packed.json` whose
/// members read as children of `<path>`. Readers merge packed and unpacked
/// children; writers always write unpacked.
pub trait KvInterface: Debug + Send + Sync {
    /// Create a new key holding `value`.
    ///
    /// With `unique` set, a sibling named `key` plus a monotonically
    /// increasing zero-padded numeric suffix is created instead; the actual
    /// key is returned either way.
    fn create(&self, key: &str, value: &str, unique: bool) -> Result<String>;

    /// Set (create or replace) the value of a key.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Whether the key exists, packed or unpacked.
    fn exists(&self, key: &str) -> Result<bool>;

    /// The value of the key. Packed subtrees are consulted transparently;
    /// non-scalar packed nodes read as compact JSON.
    fn get(&self, key: &str) -> Result<String>;

    /// Values of several keys at once; missing keys are skipped.
    fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, String>>;

    /// Names of the direct children of the key, merged over packed and
    /// unpacked storage, sorted and deduplicated.
    fn get_children(&self, key: &str) -> Result<Vec<String>>;

    /// Direct children with their values.
    fn get_children_values(&self, key: &str) -> Result<BTreeMap<String, String>>;

    /// Delete a key (unpacked storage only).
    fn delete_key(&self, key: &str) -> Result<()>;

    /// A printable dump of the subtree under `prefix` (everything when
    /// empty), one `key\tvalue` line per entry of the unpacked storage.
    fn dump(&self, prefix: &str) -> String;
}

/// Fail unless the tree's schema version matches this reader.
pub fn check_version(kv: &dyn KvInterface) -> Result<()> {
    let actual = kv.get(VERSION_KEY).map_err(|_| Error::VersionMismatch {
        expected: crate::CATALOG_VERSION,
        actual: "<missing>".to_string(),
    })?;
    ensure!(
        actual.parse::<i32>() == Ok(crate::CATALOG_VERSION),
        VersionMismatchSnafu {
            expected: crate::CATALOG_VERSION,
            actual,
        }
    );
    Ok(())
}

/// Write the schema version record of this reader into a fresh tree.
pub fn initialize_version(kv: &dyn KvInterface) -> Result<()> {
    kv.set(VERSION_KEY, &crate::CATALOG_VERSION.to_string())
}

/// An in-memory [`KvInterface`] backend.
#[derive(Debug, Default)]
pub struct MemKv {
    map: Mutex<BTreeMap<String, String>>,
    read_only: bool,
}

impl MemKv {
    /// Create an empty, writable tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tree seeded with `entries`; `read_only` freezes it.
    pub fn with_entries(
        entries: impl IntoIterator<Item = (String, String)>,
        read_only: bool,
    ) -> Self {
        Self {
            map: Mutex::new(entries.into_iter().collect()),
            read_only,
        }
    }

    /// A writable deep copy of this tree.
    pub fn deep_clone(&self) -> Self {
        Self {
            map: Mutex::new(self.map.lock().clone()),
            read_only: false,
        }
    }

    fn ensure_writable(&self, key: &str) -> Result<()> {
        ensure!(!self.read_only, ReadOnlySnafu { key });
        Ok(())
    }

    /// Resolve `key` against a packed ancestor blob, if any.
    ///
    /// Walks from the nearest ancestor down: for `/a/b/c` it looks for
    /// `/a/b/.packed.json` with member `c`, then `/a/.packed.json` with
    /// members `b`/`c`, and so on.
    fn packed_lookup(map: &BTreeMap<String, String>, key: &str) -> Option<Value> {
        let components: Vec<&str> = key.split('/').filter(|c| !c.is_empty()).collect();
        for split in (0..components.len()).rev() {
            let parent = format!("/{}", components[..split].join("/"));
            let parent = if split == 0 { String::new() } else { parent };
            let packed_key = format!("{}/{}", parent, PACKED_CHILD);
            let Some(blob) = map.get(&packed_key) else {
                continue;
            };
            let Ok(mut node) = serde_json::from_str::<Value>(blob) else {
                continue;
            };
            let mut found = true;
            for component in &components[split..] {
                match node.get(*component) {
                    Some(next) => node = next.clone(),
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                return Some(node);
            }
        }
        None
    }

    fn packed_value_to_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Direct children of `key` found in packed storage.
    fn packed_children(map: &BTreeMap<String, String>, key: &str) -> BTreeMap<String, String> {
        let mut children = BTreeMap::new();
        let node = if let Some(blob) = map.get(&format!("{}/{}", key, PACKED_CHILD)) {
            serde_json::from_str::<Value>(blob).ok()
        } else {
            Self::packed_lookup(map, key)
        };
        if let Some(Value::Object(members)) = node {
            for (name, value) in &members {
                children.insert(name.clone(), Self::packed_value_to_string(value));
            }
        }
        children
    }
}

impl KvInterface for MemKv {
    fn create(&self, key: &str, value: &str, unique: bool) -> Result<String> {
        self.ensure_writable(key)?;
        let mut map = self.map.lock();

        let key = if unique {
            let next = map
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .filter_map(|(k, _)| k[key.len()..].parse::<u64>().ok())
                .max()
                .map(|n| n + 1)
                .unwrap_or_default();
            format!("{}{:010}", key, next)
        } else {
            ensure!(!map.contains_key(key), KeyExistsSnafu { key });
            key.to_string()
        };
        map.insert(key.clone(), value.to_string());
        Ok(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_writable(key)?;
        self.map.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let map = self.map.lock();
        Ok(map.contains_key(key) || Self::packed_lookup(&map, key).is_some())
    }

    fn get(&self, key: &str) -> Result<String> {
        let map = self.map.lock();
        if let Some(value) = map.get(key) {
            return Ok(value.clone());
        }
        Self::packed_lookup(&map, key)
            .map(|v| Self::packed_value_to_string(&v))
            .ok_or_else(|| Error::KeyNotFound {
                key: key.to_string(),
            })
    }

    fn get_many(&self, keys: &[String]) -> Result<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        for key in keys {
            if let Ok(value) = self.get(key) {
                values.insert(key.clone(), value);
            }
        }
        Ok(values)
    }

    fn get_children(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.get_children_values(key)?.into_keys().collect())
    }

    fn get_children_values(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let map = self.map.lock();
        let prefix = format!("{}/", key.trim_end_matches('/'));

        let mut children = Self::packed_children(&map, key.trim_end_matches('/'));
        for (k, v) in map.range(prefix.clone()..) {
            let Some(rest) = k.strip_prefix(&prefix) else {
                break;
            };
            if rest == PACKED_CHILD {
                continue;
            }
            let child = match rest.split_once('/') {
                // A nested key makes its first component a (valueless)
                // child; do not overwrite a value that is already there.
                Some((first, _)) => {
                    children.entry(first.to_string()).or_default();
                    continue;
                }
                None => rest,
            };
            children.insert(child.to_string(), v.clone());
        }
        Ok(children)
    }

    fn delete_key(&self, key: &str) -> Result<()> {
        self.ensure_writable(key)?;
        let mut map = self.map.lock();
        ensure!(map.remove(key).is_some(), KeyNotFoundSnafu { key });
        Ok(())
    }

    fn dump(&self, prefix: &str) -> String {
        let map = self.map.lock();
        map.iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| format!("{}\t{}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse the JSON value stored at `key` into a typed record.
pub fn get_json<T: serde::de::DeserializeOwned>(kv: &dyn KvInterface, key: &str) -> Result<T> {
    let raw = kv.get(key)?;
    serde_json::from_str(&raw).context(MalformedValueSnafu { key })
}

/// Store a typed record as JSON at `key`.
pub fn set_json<T: serde::Serialize>(kv: &dyn KvInterface, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value).expect("serializing catalog record");
    kv.set(key, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn create_set_get_delete() {
        let kv = MemKv::new();
        kv.create("/DBS/db1", "READY", false).unwrap();
        assert_eq!(kv.get("/DBS/db1").unwrap(), "READY");
        assert!(kv.exists("/DBS/db1").unwrap());

        assert_matches!(
            kv.create("/DBS/db1", "x", false),
            Err(Error::KeyExists { .. })
        );

        kv.set("/DBS/db1", "IGNORE").unwrap();
        assert_eq!(kv.get("/DBS/db1").unwrap(), "IGNORE");

        kv.delete_key("/DBS/db1").unwrap();
        assert_matches!(kv.get("/DBS/db1"), Err(Error::KeyNotFound { .. }));
        assert_matches!(kv.delete_key("/DBS/db1"), Err(Error::KeyNotFound { .. }));
    }

    #[test]
    fn unique_create_appends_increasing_suffixes() {
        let kv = MemKv::new();
        let first = kv.create("/LOCKS/lock-", "a", true).unwrap();
        let second = kv.create("/LOCKS/lock-", "b", true).unwrap();
        assert_eq!(first, "/LOCKS/lock-0000000000");
        assert_eq!(second, "/LOCKS/lock-0000000001");
        assert_eq!(kv.get(&second).unwrap(), "b");
    }

    #[test]
    fn children_merge_packed_and_unpacked() {
        let kv = MemKv::new();
        kv.set("/DBS/db1/TABLES/Object", "{}").unwrap();
        kv.set(
            "/DBS/db1/TABLES/.packed.json",
            r#"{"Source": "{}", "ForcedSource": {"nested": 1}}"#,
        )
        .unwrap();

        let children = kv.get_children("/DBS/db1/TABLES").unwrap();
        assert_eq!(children, vec!["ForcedSource", "Object", "Source"]);

        let values = kv.get_children_values("/DBS/db1/TABLES").unwrap();
        assert_eq!(values["Source"], "{}");
        assert_eq!(values["ForcedSource"], r#"{"nested":1}"#);
    }

    #[test]
    fn packed_lookup_resolves_nested_paths() {
        let kv = MemKv::new();
        kv.set(
            "/PARTITIONING/.packed.json",
            r#"{"0000000001": {"stripes": "340", "subStripes": "3"}}"#,
        )
        .unwrap();

        assert!(kv.exists("/PARTITIONING/0000000001/stripes").unwrap());
        assert_eq!(kv.get("/PARTITIONING/0000000001/stripes").unwrap(), "340");
        assert_matches!(
            kv.get("/PARTITIONING/0000000001/overlap"),
            Err(Error::KeyNotFound { .. })
        );
    }

    #[test]
    fn read_only_rejects_mutation() {
        let kv = MemKv::with_entries([("/a".to_string(), "1".to_string())], true);
        assert_eq!(kv.get("/a").unwrap(), "1");
        assert_matches!(kv.set("/a", "2"), Err(Error::ReadOnly { .. }));
        assert_matches!(kv.create("/b", "2", false), Err(Error::ReadOnly { .. }));
        assert_matches!(kv.delete_key("/a"), Err(Error::ReadOnly { .. }));

        // A clone of a read-only tree is writable.
        let clone = kv.deep_clone();
        clone.set("/a", "2").unwrap();
        assert_eq!(clone.get("/a").unwrap(), "2");
        assert_eq!(kv.get("/a").unwrap(), "1");
    }

    #[test]
    fn version_gate() {
        let kv = MemKv::new();
        assert_matches!(check_version(&kv), Err(Error::VersionMismatch { .. }));

        kv.set(VERSION_KEY, "1000000").unwrap();
        assert_matches!(check_version(&kv), Err(Error::VersionMismatch { .. }));

        initialize_version(&kv).unwrap();
        check_version(&kv).unwrap();
    }

    #[test]
    fn get_many_skips_missing_keys() {
        let kv = MemKv::new();
        kv.set("/a", "1").unwrap();
        kv.set("/b", "2").unwrap();

        let values = kv
            .get_many(&["/a".to_string(), "/b".to_string(), "/c".to_string()])
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["/a"], "1");
        assert_eq!(values["/b"], "2");
    }
}
