//! Data manager / cache. A rooted on-disk tree of per-user key material,
//! generated crypto config, and cached ciphertexts, bounded by
//! `max_cache_size` with LRU-by-directory-mtime eviction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::CacheError;

/// Binary entries are base64-decoded before being written to disk; JSON
/// entries are stored verbatim. A process-wide option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Binary,
    Json,
}

#[derive(Serialize)]
struct CryptoConfig {
    automorphism_key: PathBuf,
    multiplication_key: PathBuf,
    crypto_context: PathBuf,
    neural_network_config: PathBuf,
}

pub struct Cache {
    base: PathBuf,
    max_cache_size: usize,
    encoding: KeyEncoding,
    /// `user_id`s pinned by an in-flight pipeline iteration; never evicted.
    pinned: Mutex<HashSet<String>>,
}

impl Cache {
    pub fn new(base: impl Into<PathBuf>, max_cache_size: usize, encoding: KeyEncoding) -> Self {
        Self {
            base: base.into(),
            max_cache_size,
            encoding,
            pinned: Mutex::new(HashSet::new()),
        }
    }

    fn keys_dir(&self, user_id: &str) -> PathBuf {
        self.base.join("cache").join("keys").join(user_id)
    }

    fn ct_dir(&self, user_id: &str) -> PathBuf {
        self.base.join("ct").join(user_id)
    }

    fn models_config_path(&self, analysis_type: &str) -> PathBuf {
        self.base
            .join("cache")
            .join("models")
            .join(analysis_type)
            .join("config.json")
    }

    pub fn pin(&self, user_id: &str) {
        self.pinned.lock().insert(user_id.to_string());
    }

    pub fn unpin(&self, user_id: &str) {
        self.pinned.lock().remove(user_id);
    }

    /// `lookup_user_keys(user_id) → (present, config_path)`.
    pub fn lookup_user_keys(&self, user_id: &str) -> (bool, PathBuf) {
        let config_path = self.keys_dir(user_id).join("crypto_config.json");
        (config_path.exists(), config_path)
    }

    /// `put_user_keys`: stores each key either base64-decoded or verbatim,
    /// per the process-wide `encoding` option.
    pub fn put_user_keys(
        &self,
        user_id: &str,
        automorphism_key: &[u8],
        multiplication_key: &[u8],
        crypto_context: &[u8],
    ) -> Result<(), CacheError> {
        let dir = self.keys_dir(user_id);
        std::fs::create_dir_all(&dir)?;
        self.put_one(&dir.join("automorphism_key"), automorphism_key)?;
        self.put_one(&dir.join("multiplication_key"), multiplication_key)?;
        self.put_one(&dir.join("crypto_context"), crypto_context)?;
        self.maybe_evict()?;
        Ok(())
    }

    fn put_one(&self, path: &Path, raw: &[u8]) -> Result<(), CacheError> {
        use base64::Engine;
        match self.encoding {
            KeyEncoding::Binary => {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .unwrap_or_else(|_| raw.to_vec());
                std::fs::write(path, decoded)?;
            }
            KeyEncoding::Json => {
                std::fs::write(path, raw)?;
            }
        }
        Ok(())
    }

    /// `generate_config(user_id, analysis_type) → config_path`: writes the
    /// JSON mapping of absolute key paths plus the analysis type's network
    /// config path.
    pub fn generate_config(&self, user_id: &str, analysis_type: &str) -> Result<PathBuf, CacheError> {
        let dir = self.keys_dir(user_id);
        let config = CryptoConfig {
            automorphism_key: dir.join("automorphism_key"),
            multiplication_key: dir.join("multiplication_key"),
            crypto_context: dir.join("crypto_context"),
            neural_network_config: self.models_config_path(analysis_type),
        };
        let config_path = dir.join("crypto_config.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;
        Ok(config_path)
    }

    pub fn lookup_ct(&self, user_id: &str, index: u64) -> (bool, PathBuf) {
        let path = self.ct_dir(user_id).join(index.to_string());
        (path.exists(), path)
    }

    pub fn put_ct(&self, user_id: &str, index: u64, content: &[u8]) -> Result<(), CacheError> {
        let dir = self.ct_dir(user_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(index.to_string()), content)?;
        self.maybe_evict()?;
        Ok(())
    }

    /// LRU-by-directory-mtime eviction bounded at `max_cache_size` user
    /// directories, skipping any user currently pinned by a running
    /// pipeline iteration.
    fn maybe_evict(&self) -> Result<(), CacheError> {
        let keys_root = self.base.join("cache").join("keys");
        if !keys_root.exists() {
            return Ok(());
        }

        let mut entries: Vec<(String, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&keys_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let user_id = entry.file_name().to_string_lossy().into_owned();
            let mtime = entry.metadata()?.modified()?;
            entries.push((user_id, mtime));
        }

        if entries.len() <= self.max_cache_size {
            return Ok(());
        }

        entries.sort_by_key(|(_, mtime)| *mtime);
        let pinned = self.pinned.lock();
        let overflow = entries.len() - self.max_cache_size;
        let mut evicted = 0;
        for (user_id, _) in entries {
            if evicted >= overflow {
                break;
            }
            if pinned.contains(&user_id) {
                continue;
            }
            let _ = std::fs::remove_dir_all(self.keys_dir(&user_id));
            evicted += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_lookup_user_keys_json_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 10, KeyEncoding::Json);
        let (present, _) = cache.lookup_user_keys("alice");
        assert!(!present);

        cache.put_user_keys("alice", b"auto", b"mult", b"ctx").unwrap();
        let config_path = cache.generate_config("alice", "heartbeat").unwrap();
        let (present, path) = cache.lookup_user_keys("alice");
        assert!(present);
        assert_eq!(path, config_path);
    }

    #[test]
    fn put_and_lookup_ct() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 10, KeyEncoding::Json);
        cache.put_ct("alice", 3, b"ciphertext").unwrap();
        let (present, path) = cache.lookup_ct("alice", 3);
        assert!(present);
        assert_eq!(std::fs::read(path).unwrap(), b"ciphertext");
    }

    #[test]
    fn evicts_oldest_unpinned_user_over_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 2, KeyEncoding::Json);
        for user in ["a", "b", "c"] {
            cache.put_user_keys(user, b"x", b"y", b"z").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let (present_a, _) = cache.lookup_user_keys("a");
        let (present_c, _) = cache.lookup_user_keys("c");
        assert!(!present_a);
        assert!(present_c);
    }

    #[test]
    fn pinned_user_survives_eviction_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), 1, KeyEncoding::Json);
        cache.put_user_keys("a", b"x", b"y", b"z").unwrap();
        cache.pin("a");
        std::thread::sleep(std::time::Duration::from_millis(10));
        cache.put_user_keys("b", b"x", b"y", b"z").unwrap();
        let (present_a, _) = cache.lookup_user_keys("a");
        assert!(present_a);
    }
}
