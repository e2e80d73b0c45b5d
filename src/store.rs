//! Profile store with time-based eviction (Sprint 2)
//!
//! The store is the only state shared between requests. Request threads
//! insert finished profiles and the result-fetch path reads them, while a
//! sidecar thread periodically drops profiles older than the retention
//! window.
//!
//! # Design
//!
//! ```text
//! request threads ──put/get──▶ RwLock<HashMap<ProfileId, Arc<Profile>>>
//!                                          ▲
//! eviction sidecar ──every interval──retain(started >= now - retention)
//! ```
//!
//! Readers get an `Arc<Profile>`, so eviction never pulls an entry out from
//! under a reader that already holds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::profile::{ClientTimings, NavigationTiming, Profile, ProfileId};

/// Default retention window (24 hours)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Default interval between eviction passes (1 hour)
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Errors raised by the profile store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("No such result {0}")]
    NotFound(ProfileId),

    #[error("Profile id collision: {0} is already stored")]
    IdCollision(ProfileId),

    #[error("Profile {0} must be finalized before it is stored")]
    NotFinalized(ProfileId),
}

/// Concurrent map from profile id to finished profile
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: RwLock<HashMap<ProfileId, Arc<Profile>>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a finalized profile under its id.
    ///
    /// Duplicate ids are rejected; ids are never reused.
    pub fn put(&self, profile: Profile) -> Result<Arc<Profile>, StoreError> {
        if !profile.is_finalized() {
            return Err(StoreError::NotFinalized(profile.id().clone()));
        }

        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        if profiles.contains_key(profile.id()) {
            error!(id = %profile.id(), "profile id collision");
            return Err(StoreError::IdCollision(profile.id().clone()));
        }

        let id = profile.id().clone();
        let profile = Arc::new(profile);
        profiles.insert(id.clone(), Arc::clone(&profile));
        debug!(%id, stored = profiles.len(), "profile stored");
        Ok(profile)
    }

    /// Plain lookup; does not mark the profile viewed
    pub fn get(&self, id: &ProfileId) -> Option<Arc<Profile>> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Result-fetch lookup.
    ///
    /// On the first fetch of a profile the viewed flag is set and the
    /// supplied navigation timing (if any) is recorded as its client timings.
    pub fn fetch_result(
        &self,
        id: &ProfileId,
        navigation: Option<&NavigationTiming>,
    ) -> Result<Arc<Profile>, StoreError> {
        let profile = self
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if !profile.has_user_viewed() {
            let client = navigation
                .map(|nav| ClientTimings::from_navigation(nav, profile.started_unix_ms()));
            if profile.mark_viewed(client) {
                debug!(%id, "profile viewed for the first time");
            }
        }
        Ok(profile)
    }

    /// Remove every profile created strictly before `threshold`.
    ///
    /// Returns the number of profiles removed.
    pub fn evict_older_than(&self, threshold: SystemTime) -> usize {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        let before = profiles.len();
        profiles.retain(|_, profile| profile.started() >= threshold);
        before - profiles.len()
    }

    /// Evict everything older than `now - retention`.
    ///
    /// If the threshold cannot be represented (clock before the epoch plus
    /// retention) nothing is evicted.
    pub fn evict_expired(&self, now: SystemTime, retention: Duration) -> usize {
        match now.checked_sub(retention) {
            Some(threshold) => self.evict_older_than(threshold),
            None => 0,
        }
    }

    pub fn contains(&self, id: &ProfileId) -> bool {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.profiles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of stored ids, oldest first
    pub fn ids(&self) -> Vec<ProfileId> {
        let profiles = self.profiles.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = profiles.values().map(|p| (p.started(), p.id().clone())).collect();
        entries.sort();
        entries.into_iter().map(|(_, id)| id).collect()
    }
}

/// Counters published by the eviction sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    pub passes: u64,
    pub evicted: u64,
}

/// Background thread that evicts expired profiles on a fixed interval.
///
/// The first pass runs immediately. Dropping the handle (or calling
/// [`EvictionTask::shutdown`]) stops the thread and waits for it.
pub struct EvictionTask {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
    evicted: Arc<AtomicU64>,
}

impl EvictionTask {
    pub fn spawn(store: Arc<ProfileStore>, interval: Duration, retention: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
        let passes = Arc::new(AtomicU64::new(0));
        let evicted = Arc::new(AtomicU64::new(0));

        let passes_clone = Arc::clone(&passes);
        let evicted_clone = Arc::clone(&evicted);
        let handle = thread::Builder::new()
            .name("miniprof-eviction".to_string())
            .spawn(move || loop {
                let removed = store.evict_expired(SystemTime::now(), retention);
                // a pass is counted only once its evictions are visible
                evicted_clone.fetch_add(removed as u64, Ordering::Relaxed);
                passes_clone.fetch_add(1, Ordering::Release);
                info!(removed, remaining = store.len(), "cleaning up profile cache");

                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("failed to spawn eviction thread: {}", e);
                None
            }
        };

        Self {
            shutdown: Some(shutdown_tx),
            handle,
            passes,
            evicted,
        }
    }

    pub fn stats(&self) -> EvictionStats {
        EvictionStats {
            passes: self.passes.load(Ordering::Acquire),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the sidecar thread and wait for it to exit
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EvictionTask {
    fn drop(&mut self) {
        self.stop();
    }
}
