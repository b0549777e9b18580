// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Last-known attributes per entity.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use wildmatch::WildMatch;

use super::persistence::{self, Snapshot};
use crate::Attributes;
use crate::entity::{Entity, EntityId};
use crate::event::PublishReason;
use crate::settings::BridgeSettings;

struct CacheInner {
    records: RwLock<Snapshot>,
    exclusions: Vec<WildMatch>,
    dirty: AtomicBool,
    path: Option<PathBuf>,
    save_interval: Duration,
    saver: Mutex<Option<CancellationToken>>,
}

/// Shared per-entity attribute cache.
///
/// [`set`](Self::set) merges a partial update into the cached record and
/// returns the merged record. Keys matching the global exclusion patterns or
/// the entity's `filtered_cache` patterns are returned (so they still get
/// published) but never stored.
///
/// When persistence is configured, a snapshot is loaded on construction and
/// written periodically while the cache is dirty, and once more on
/// [`stop_persistence`](Self::stop_persistence). Persistence failures are
/// logged and the cache keeps working in memory.
///
/// Cloning the cache is cheap and shares the same records.
#[derive(Clone)]
pub struct StateCache {
    inner: Arc<CacheInner>,
}

impl StateCache {
    /// Creates a cache configured from the bridge settings, loading the
    /// snapshot when persistence is enabled.
    #[must_use]
    pub fn new(settings: &BridgeSettings) -> Self {
        let path = settings.persistence_path().cloned();
        let records = path.as_deref().map(load_or_empty).unwrap_or_default();

        Self {
            inner: Arc::new(CacheInner {
                records: RwLock::new(records),
                exclusions: settings
                    .cache_exclusions
                    .iter()
                    .map(|pattern| WildMatch::new(pattern))
                    .collect(),
                dirty: AtomicBool::new(false),
                path,
                save_interval: settings.state_save_interval(),
                saver: Mutex::new(None),
            }),
        }
    }

    /// Creates an in-memory cache with the default exclusions.
    #[must_use]
    pub fn in_memory() -> Self {
        let mut settings = BridgeSettings::default();
        settings.cache_state_persistent = false;
        Self::new(&settings)
    }

    /// Returns the cached attributes, or an empty map for unseen entities.
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Attributes {
        self.inner.records.read().get(id).cloned().unwrap_or_default()
    }

    /// Returns `true` if anything is cached for the entity.
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.inner.records.read().contains_key(id)
    }

    /// Merges `partial` into the entity's record and returns the result.
    ///
    /// The returned map also contains the keys of `partial` that were not
    /// stored because they are excluded from caching.
    pub fn set(&self, entity: &Entity, partial: &Attributes, reason: PublishReason) -> Attributes {
        let id = entity.id();
        let entity_exclusions: Vec<WildMatch> = entity
            .options()
            .filtered_cache
            .iter()
            .map(|pattern| WildMatch::new(pattern))
            .collect();

        let mut excluded = Attributes::new();
        let mut merged = {
            let mut records = self.inner.records.write();
            let record = records.entry(id).or_default();
            for (key, value) in partial {
                let skip = self.inner.exclusions.iter().any(|p| p.matches(key))
                    || entity_exclusions.iter().any(|p| p.matches(key));
                if skip {
                    excluded.insert(key.clone(), value.clone());
                } else {
                    record.insert(key.clone(), value.clone());
                }
            }
            record.clone()
        };
        self.inner.dirty.store(true, Ordering::Release);

        tracing::trace!(
            entity = %entity.name(),
            reason = %reason,
            keys = partial.len(),
            excluded = excluded.len(),
            "State cache updated"
        );

        merged.extend(excluded);
        merged
    }

    /// Drops the record of an entity.
    pub fn remove(&self, id: &EntityId) -> Option<Attributes> {
        let removed = self.inner.records.write().remove(id);
        if removed.is_some() {
            self.inner.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Drops one attribute of an entity.
    pub fn remove_key(&self, id: &EntityId, key: &str) -> Option<serde_json::Value> {
        let removed = self
            .inner
            .records
            .write()
            .get_mut(id)
            .and_then(|record| record.remove(key));
        if removed.is_some() {
            self.inner.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Returns the number of cached entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.records.read().is_empty()
    }

    /// Returns `true` if the cache changed since the last snapshot write.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Writes the snapshot if the cache changed since the last write.
    ///
    /// Does nothing when persistence is disabled. Failures are logged and the
    /// cache stays dirty so the next attempt retries.
    pub fn save(&self) {
        let Some(path) = self.inner.path.as_deref() else {
            return;
        };
        if !self.inner.dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        let snapshot = self.inner.records.read().clone();
        match persistence::save(path, &snapshot) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), entities = snapshot.len(), "State snapshot saved");
            }
            Err(e) => {
                self.inner.dirty.store(true, Ordering::Release);
                tracing::error!(path = %path.display(), error = %e, "Failed to save state snapshot");
            }
        }
    }

    /// Starts the periodic snapshot writer.
    ///
    /// Does nothing when persistence is disabled or the writer already runs.
    pub fn start_persistence(&self) {
        if self.inner.path.is_none() {
            return;
        }
        let mut saver = self.inner.saver.lock();
        if saver.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cache = self.clone();
        let cancelled = token.clone();
        let interval = self.inner.save_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    () = tokio::time::sleep(interval) => cache.save(),
                }
            }
        });
        *saver = Some(token);
    }

    /// Stops the periodic writer and writes a final snapshot.
    pub fn stop_persistence(&self) {
        if let Some(token) = self.inner.saver.lock().take() {
            token.cancel();
        }
        self.save();
    }
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("entities", &self.len())
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

fn load_or_empty(path: &std::path::Path) -> Snapshot {
    match persistence::load(path) {
        Ok(Some(snapshot)) => {
            tracing::info!(path = %path.display(), entities = snapshot.len(), "Loaded state snapshot");
            snapshot
        }
        Ok(None) => {
            tracing::warn!(path = %path.display(), "No state snapshot found, starting with empty cache");
            Snapshot::new()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to load state snapshot, starting with empty cache");
            Snapshot::new()
        }
    }
}
