use std::{
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
    sync::RwLock,
};

use crate::{coordinates::CoordinateSet, node::NodeDefinition, units::UnitsArray};

/// Stable hash of `(node definition, request coordinates)` identifying a
/// cached evaluation result.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(definition: &NodeDefinition, request: &CoordinateSet) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        let def =
            serde_json::to_vec(definition).expect("node definition serializes to JSON");
        hasher.update(&def);
        hasher.update(&[0]);
        hasher.update(request.definition().to_string().as_bytes());
        Fingerprint(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

#[derive(Clone)]
pub enum CacheEntry {
    Array(UnitsArray),
    Coordinates(CoordinateSet),
    SourceListing(Vec<String>),
}

/// Shared snapshots keyed by fingerprint.
///
/// Implementations backed by shared storage must keep writes exclusive per
/// key; readers see a consistent snapshot or a miss. A corrupt entry is
/// non-fatal: log it and report a miss.
pub trait Cache: Send + Sync {
    fn get(&self, key: &Fingerprint) -> Option<CacheEntry>;

    /// Returns whether the entry was stored. Without `overwrite`, an
    /// existing entry wins.
    fn put(&self, key: Fingerprint, entry: CacheEntry, overwrite: bool) -> bool;
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        self.entries.read().expect("cache lock poisoned").get(key).cloned()
    }

    fn put(&self, key: Fingerprint, entry: CacheEntry, overwrite: bool) -> bool {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        if !overwrite && entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, entry);
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::coordinates::{Axis, AxisName};

    fn coords(values: Vec<f64>) -> CoordinateSet {
        CoordinateSet::from_axes([Axis::from_values(AxisName::Lat, values).unwrap()]).unwrap()
    }

    fn def(kind: &str) -> NodeDefinition {
        NodeDefinition {
            kind: kind.to_string(),
            attrs: json!({}),
            inputs: Default::default(),
        }
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let a = Fingerprint::of(&def("mean"), &coords(vec![0.0, 1.0]));
        let b = Fingerprint::of(&def("mean"), &coords(vec![0.0, 1.0]));
        assert_eq!(a, b);

        let other_node = Fingerprint::of(&def("sum"), &coords(vec![0.0, 1.0]));
        let other_request = Fingerprint::of(&def("mean"), &coords(vec![0.0, 2.0]));
        assert_ne!(a, other_node);
        assert_ne!(a, other_request);

        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn put_respects_overwrite_flag() {
        let cache = MemoryCache::new();
        let key = Fingerprint::of(&def("mean"), &coords(vec![0.0]));

        assert!(cache.put(key, CacheEntry::SourceListing(vec!["a".into()]), false));
        assert!(!cache.put(key, CacheEntry::SourceListing(vec!["b".into()]), false));
        let Some(CacheEntry::SourceListing(items)) = cache.get(&key) else {
            panic!("expected a source listing");
        };
        assert_eq!(items, vec!["a".to_string()]);

        assert!(cache.put(key, CacheEntry::SourceListing(vec!["b".into()]), true));
        let Some(CacheEntry::SourceListing(items)) = cache.get(&key) else {
            panic!("expected a source listing");
        };
        assert_eq!(items, vec!["b".to_string()]);
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = MemoryCache::new();
        let key = Fingerprint::of(&def("mean"), &coords(vec![0.0]));
        assert!(cache.get(&key).is_none());
    }
}
