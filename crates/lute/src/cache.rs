// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! Process-wide caches.
//!
//! Two shared structures carry the expensive pipeline results across
//! engines and threads:
//!
//! - [`ArtifactCache`]: fingerprint-keyed compiled artifacts. Lookups go
//!   through one mutex-guarded LRU map; compiles are serialized per
//!   fingerprint with a double-checked build lock so two threads asking for
//!   the same bundle never compile twice. Failed compiles are never cached.
//! - [`EngineCache`]: the single-flight map behind
//!   [`process_template`](crate::process_template). `get_or_insert` runs
//!   the factory at most once per key; entries for other keys are not
//!   blocked while a factory runs.

use crate::compiler::Artifact;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::loader::MemoryLoader;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};

const ARTIFACT_CACHE_CAPACITY: usize = 64;

/// Computes the stable bundle fingerprint: SHA-256 over the given parts
/// separated by a record separator.
pub fn fingerprint<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = Sha256::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update([0x1e]);
        }
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// The process-wide compiled-artifact cache.
pub struct ArtifactCache {
    entries: Mutex<LruCache<String, Arc<Artifact>>>,
    building: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(ARTIFACT_CACHE_CAPACITY).unwrap(),
            )),
            building: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static ArtifactCache {
        static CACHE: OnceLock<ArtifactCache> = OnceLock::new();
        CACHE.get_or_init(ArtifactCache::new)
    }

    /// Looks up a cached artifact by fingerprint.
    pub fn get(&self, fingerprint: &str) -> Result<Option<Arc<Artifact>>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Cache("artifact cache lock poisoned".to_string()))?;
        Ok(entries.get(fingerprint).cloned())
    }

    /// Returns the cached artifact for `fingerprint`, or builds it.
    ///
    /// The build runs under an exclusive per-fingerprint lock with a
    /// double-checked lookup, so concurrent callers of the same bundle
    /// share one compile. A failed build caches nothing.
    pub fn get_or_compile<F>(&self, fingerprint: &str, build: F) -> Result<Arc<Artifact>>
    where
        F: FnOnce() -> Result<Artifact>,
    {
        if let Some(found) = self.get(fingerprint)? {
            tracing::debug!(fingerprint, "artifact cache hit");
            return Ok(found);
        }

        let gate = {
            let mut building = self
                .building
                .lock()
                .map_err(|_| Error::Cache("artifact build registry poisoned".to_string()))?;
            building
                .entry(fingerprint.to_string())
                .or_default()
                .clone()
        };
        let _guard = gate
            .lock()
            .map_err(|_| Error::Cache("artifact build lock poisoned".to_string()))?;

        if let Some(found) = self.get(fingerprint)? {
            tracing::debug!(fingerprint, "artifact compiled while waiting");
            return Ok(found);
        }

        tracing::debug!(fingerprint, "compiling bundle");
        let built = build();
        if let Ok(mut building) = self.building.lock() {
            building.remove(fingerprint);
        }
        let artifact = Arc::new(built?);

        self.entries
            .lock()
            .map_err(|_| Error::Cache("artifact cache lock poisoned".to_string()))?
            .put(fingerprint.to_string(), artifact.clone());
        Ok(artifact)
    }

    /// Drops every cached artifact.
    pub fn clear(&self) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| Error::Cache("artifact cache lock poisoned".to_string()))?
            .clear();
        Ok(())
    }
}

/// The process-wide engine cache behind the one-shot conveniences.
pub struct EngineCache {
    engines: DashMap<String, Arc<Mutex<Engine<MemoryLoader>>>>,
}

impl EngineCache {
    /// The process-wide instance.
    pub fn global() -> &'static EngineCache {
        static CACHE: OnceLock<EngineCache> = OnceLock::new();
        CACHE.get_or_init(|| EngineCache {
            engines: DashMap::new(),
        })
    }

    /// Returns the engine cached under `key`, running `init` at most once
    /// per key to create it.
    pub fn get_or_insert<F>(&self, key: &str, init: F) -> Result<Arc<Mutex<Engine<MemoryLoader>>>>
    where
        F: FnOnce() -> Result<Engine<MemoryLoader>>,
    {
        if let Some(existing) = self.engines.get(key) {
            return Ok(existing.value().clone());
        }
        match self.engines.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(slot) => {
                tracing::debug!(key, "creating cached engine");
                let engine = init()?;
                Ok(slot.insert(Arc::new(Mutex::new(engine))).value().clone())
            }
        }
    }

    /// Drops every cached engine.
    pub fn clear(&self) {
        self.engines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn empty_artifact(fingerprint: &str) -> Artifact {
        Artifact {
            fingerprint: fingerprint.to_string(),
            chunks: Vec::new(),
            references: Vec::new(),
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_separator_sensitive() {
        assert_eq!(fingerprint(["a", "b"]), fingerprint(["a", "b"]));
        assert_ne!(fingerprint(["a", "b"]), fingerprint(["ab"]));
        assert_ne!(fingerprint(["a", "b"]), fingerprint(["b", "a"]));
        assert_eq!(fingerprint(["a", "b"]).len(), 64);
    }

    #[test]
    fn test_artifact_cache_builds_once() {
        let cache = ArtifactCache::new();
        let builds = AtomicUsize::new(0);

        let first = cache
            .get_or_compile("fp-builds-once", || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(empty_artifact("fp-builds-once"))
            })
            .unwrap();
        let second = cache
            .get_or_compile("fp-builds-once", || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(empty_artifact("fp-builds-once"))
            })
            .unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_artifact_cache_does_not_cache_failures() {
        let cache = ArtifactCache::new();

        let err = cache.get_or_compile("fp-fails", || {
            Err(Error::Compilation {
                message: "boom".to_string(),
                context: None,
            })
        });
        assert!(err.is_err());
        assert!(cache.get("fp-fails").unwrap().is_none());

        // The key is retryable after the failure.
        let ok = cache.get_or_compile("fp-fails", || Ok(empty_artifact("fp-fails")));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_engine_cache_single_flight() {
        let cache = EngineCache::global();
        let inits = AtomicUsize::new(0);
        let key = format!("engine-cache-test-{}", std::process::id());

        let make = || {
            inits.fetch_add(1, Ordering::SeqCst);
            Engine::new(MemoryLoader::new())
        };
        let a = cache.get_or_insert(&key, make).unwrap();
        let b = cache
            .get_or_insert(&key, || {
                inits.fetch_add(1, Ordering::SeqCst);
                Engine::new(MemoryLoader::new())
            })
            .unwrap();

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
