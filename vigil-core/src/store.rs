//! Object store
//!
//! A keyed map of reference-counted entries. Every entry carries an
//! `in_use` latch set by the API engine for the duration of a mutation;
//! readers that meet a latched entry report the object as busy instead of
//! absent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use vigil_error::{ApiError, ApiStatus};
use vigil_smi::ObjKey;

/// Walk callback verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Continue,
    Stop,
}

/// One stored object with its mutation latch
#[derive(Debug)]
pub struct StoreEntry<T> {
    in_use: AtomicBool,
    data: RwLock<T>,
}

impl<T> StoreEntry<T> {
    fn new(data: T) -> Self {
        Self {
            in_use: AtomicBool::new(false),
            data: RwLock::new(data),
        }
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Set the mutation latch; only the API engine does this
    pub fn latch(&self) {
        self.in_use.store(true, Ordering::Release);
    }

    pub fn unlatch(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.data.write()
    }
}

/// Mapping from object key to entry; keys are unique, iteration order is
/// meaningless
pub struct ObjStore<T> {
    entries: RwLock<HashMap<ObjKey, Arc<StoreEntry<T>>>>,
}

impl<T> ObjStore<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn find(&self, key: &ObjKey) -> Option<Arc<StoreEntry<T>>> {
        self.entries.read().get(key).cloned()
    }

    /// Keyed lookup honoring the latch: absent objects are `NotFound`,
    /// latched objects are `InUse`
    pub fn get(&self, key: &ObjKey) -> Result<Arc<StoreEntry<T>>, ApiError> {
        let entry = self.find(key).ok_or(ApiError::not_found())?;
        if entry.in_use() {
            return Err(ApiError::in_use());
        }
        Ok(entry)
    }

    /// Insert a new entry; fails with `Exists` if the key is present
    pub fn insert(&self, key: ObjKey, data: T) -> Result<(), ApiError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(ApiStatus::Exists.into());
        }
        entries.insert(key, Arc::new(StoreEntry::new(data)));
        Ok(())
    }

    pub fn remove(&self, key: &ObjKey) -> Option<Arc<StoreEntry<T>>> {
        self.entries.write().remove(key)
    }

    /// Visit every entry until the callback says stop
    pub fn walk<F>(&self, mut f: F)
    where
        F: FnMut(&ObjKey, &Arc<StoreEntry<T>>) -> WalkAction,
    {
        // clone the entry list out so callbacks may re-enter the store
        let snapshot: Vec<(ObjKey, Arc<StoreEntry<T>>)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (key, entry) in &snapshot {
            if f(key, entry) == WalkAction::Stop {
                break;
            }
        }
    }

    /// All keys currently present
    pub fn keys(&self) -> Vec<ObjKey> {
        self.entries.read().keys().copied().collect()
    }
}
