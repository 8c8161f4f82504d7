use kube::{Resource, ResourceExt};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Last known state of one object
#[derive(Debug, Clone)]
pub struct CacheEntry<K> {
    pub uid: String,
    pub object: K,
    pub resource_version: Option<String>,
}

impl<K: Resource> CacheEntry<K> {
    #[must_use]
    pub fn new(uid: String, object: K) -> Self {
        let resource_version = object.resource_version();
        Self {
            uid,
            object,
            resource_version,
        }
    }
}

/// UID keyed view of a watched collection. Owned by exactly one session.
#[derive(Debug)]
pub struct ObjectCache<K> {
    entries: HashMap<String, CacheEntry<K>>,
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Resource + Clone> ObjectCache<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, uid: &str) -> Option<&CacheEntry<K>> {
        self.entries.get(uid)
    }

    #[must_use]
    pub fn contains(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the entry for `uid`
    pub fn upsert(&mut self, uid: String, object: K) {
        self.entries.insert(uid.clone(), CacheEntry::new(uid, object));
    }

    pub fn remove(&mut self, uid: &str) -> Option<CacheEntry<K>> {
        self.entries.remove(uid)
    }

    /// Clone of the current objects, used as the removal candidates of a list
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, K> {
        self.entries
            .iter()
            .map(|(uid, entry)| (uid.clone(), entry.object.clone()))
            .collect()
    }

    /// `true` if `observed` carries a strictly newer version than the cache
    #[must_use]
    pub fn is_newer(&self, uid: &str, observed: &K) -> bool {
        let cached = self.entries.get(uid).and_then(|e| e.resource_version.as_deref());
        is_newer_version(cached, observed.resource_version().as_deref())
    }
}

/// Compare resource versions. Numeric versions compare as integers. When
/// either side is missing or not numeric, any difference counts as newer so a
/// change is never dropped.
#[must_use]
pub fn is_newer_version(cached: Option<&str>, observed: Option<&str>) -> bool {
    match (parse_version(cached), parse_version(observed)) {
        (Some(cached), Some(observed)) => observed.cmp(&cached) == Ordering::Greater,
        _ => cached != observed,
    }
}

fn parse_version(version: Option<&str>) -> Option<u128> {
    version.and_then(|v| v.trim().parse::<u128>().ok())
}

/// Human readable reference used in logs
pub fn describe<K: Resource>(object: &K) -> String {
    match object.namespace() {
        Some(ns) => format!("{ns}/{}", object.name_any()),
        None => object.name_any(),
    }
}
