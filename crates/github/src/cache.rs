use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::Write,
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Decoded JSON body. List endpoints store one page per entry.
    pub payload: Value,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    /// `rel="next"` link of the cached page.
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    #[serde(flatten)]
    entry: CacheEntry,
}

/// Bounded response cache with insertion-order eviction.
///
/// Replacing a key makes it the newest entry.
#[derive(Debug)]
pub struct ResponseCache {
    max_entries: usize,
    entries: HashMap<String, (u64, CacheEntry)>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> { self.entries.get(key).map(|(_, e)| e) }

    pub fn insert(&mut self, key: String, entry: CacheEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some((old_seq, _)) = self.entries.insert(key.clone(), (seq, entry)) {
            self.order.remove(&old_seq);
        }
        self.order.insert(seq, key);
        while self.entries.len() > self.max_entries {
            let Some((_, oldest)) = self.order.pop_first() else { break };
            self.entries.remove(&oldest);
        }
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &str> { self.order.values().map(String::as_str) }

    /// Load a cache file, keeping only the newest `max_entries` entries.
    /// A missing, unreadable or corrupt file yields an empty cache.
    pub fn load(path: &Path, max_entries: usize) -> Self {
        let mut cache = Self::new(max_entries);
        match read_entries(path) {
            Ok(entries) => {
                for StoredEntry { key, entry } in entries {
                    cache.insert(key, entry);
                }
                tracing::info!("Loaded {} cached responses from {}", cache.len(), path.display());
            }
            Err(e) if path.exists() => {
                tracing::warn!("Discarding cache {}: {:#}", path.display(), e);
            }
            Err(_) => tracing::debug!("No cache found at {}", path.display()),
        }
        cache
    }

    /// Write the cache atomically: a temporary sibling file is renamed into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let entries = self
            .order
            .values()
            .filter_map(|key| self.entries.get(key).map(|(_, entry)| (key, entry)))
            .map(|(key, entry)| StoredEntry { key: key.clone(), entry: entry.clone() })
            .collect::<Vec<_>>();
        let json = serde_json::to_vec(&entries).context("Failed to serialize cache")?;
        let compressed = zstd::encode_all(json.as_slice(), 3).context("Failed to compress cache")?;
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move cache into {}", path.display()))?;
        tracing::info!("Saved {} cached responses to {}", entries.len(), path.display());
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<Vec<StoredEntry>> {
    let data = fs::read(path)?;
    let json = zstd::decode_all(data.as_slice()).context("Failed to decompress cache")?;
    serde_json::from_slice(&json).context("Failed to parse cache")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(n: u64) -> CacheEntry {
        CacheEntry {
            payload: json!({ "n": n }),
            etag: Some(format!("\"{n}\"")),
            last_modified: None,
            next: None,
        }
    }

    #[test]
    fn test_eviction_order() {
        let mut cache = ResponseCache::new(3);
        for n in 0..3 {
            cache.insert(format!("GET /{n}"), entry(n));
        }
        // Refreshing a key makes it the newest.
        cache.insert("GET /0".to_string(), entry(10));
        cache.insert("GET /3".to_string(), entry(3));
        assert_eq!(cache.len(), 3);
        assert!(cache.get("GET /1").is_none());
        assert_eq!(cache.keys().collect::<Vec<_>>(), ["GET /2", "GET /0", "GET /3"]);
        assert_eq!(cache.get("GET /0").unwrap().payload, json!({ "n": 10 }));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        let mut cache = ResponseCache::new(10);
        for n in 0..5 {
            cache.insert(format!("GET /{n}"), entry(n));
        }
        cache.save(&path).unwrap();
        assert!(!dir.path().join("cache.tmp").exists());

        let loaded = ResponseCache::load(&path, 10);
        assert_eq!(loaded.keys().collect::<Vec<_>>(), cache.keys().collect::<Vec<_>>());
        assert_eq!(loaded.get("GET /4"), cache.get("GET /4"));

        // A smaller limit keeps only the newest entries.
        let loaded = ResponseCache::load(&path, 2);
        assert_eq!(loaded.keys().collect::<Vec<_>>(), ["GET /3", "GET /4"]);
    }

    #[test]
    fn test_load_corrupt_or_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        assert!(ResponseCache::load(&path, 10).is_empty());
        fs::write(&path, b"definitely not zstd").unwrap();
        assert!(ResponseCache::load(&path, 10).is_empty());
        let valid_zstd = zstd::encode_all(&b"{not json"[..], 3).unwrap();
        fs::write(&path, valid_zstd).unwrap();
        assert!(ResponseCache::load(&path, 10).is_empty());
    }
}
