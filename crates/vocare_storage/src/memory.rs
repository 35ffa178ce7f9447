#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vocare_kernel_contracts::{Identity, IdentityFields, PhoneKey, PhoneKeyResolver};

use crate::repo::{ResultStore, RosterRow, StoreError};

/// Process-local store. Used by tests and by deployments that only need the
/// pending-results collection endpoint.
pub struct InMemoryResultStore {
    resolver: Arc<dyn PhoneKeyResolver>,
    rows: Mutex<Vec<RosterRow>>,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl std::fmt::Debug for InMemoryResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryResultStore")
            .field("rows", &self.rows.lock().len())
            .field("offline", &self.offline.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl InMemoryResultStore {
    pub fn new(resolver: Arc<dyn PhoneKeyResolver>) -> Self {
        Self::with_rows(resolver, Vec::new())
    }

    pub fn with_rows(resolver: Arc<dyn PhoneKeyResolver>, rows: Vec<RosterRow>) -> Self {
        Self {
            resolver,
            rows: Mutex::new(rows),
            offline: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// While offline every call fails with `StoreError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Successful `insert` and `update` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<RosterRow> {
        self.rows.lock().clone()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    fn position(&self, rows: &[RosterRow], key: &PhoneKey) -> Option<usize> {
        rows.iter()
            .position(|row| row.phone_key(self.resolver.as_ref()).as_ref() == Some(key))
    }
}

impl ResultStore for InMemoryResultStore {
    fn fetch_roster(&self) -> Result<Vec<RosterRow>, StoreError> {
        self.check_online()?;
        Ok(self.rows.lock().clone())
    }

    fn find_by_key(&self, key: &PhoneKey) -> Result<Option<RosterRow>, StoreError> {
        self.check_online()?;
        let rows = self.rows.lock();
        Ok(self.position(&rows, key).map(|i| rows[i].clone()))
    }

    fn insert(&self, identity: &Identity) -> Result<(), StoreError> {
        self.check_online()?;
        let mut rows = self.rows.lock();
        if self.position(&rows, &identity.phone_key).is_some() {
            return Err(StoreError::Rejected(format!(
                "row for {} already exists",
                identity.phone_key
            )));
        }
        rows.push(RosterRow::from_identity(identity));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update(&self, key: &PhoneKey, fields: &IdentityFields) -> Result<(), StoreError> {
        self.check_online()?;
        let mut rows = self.rows.lock();
        let Some(i) = self.position(&rows, key) else {
            return Err(StoreError::Rejected(format!("no row for {key}")));
        };
        rows[i].apply(fields);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
