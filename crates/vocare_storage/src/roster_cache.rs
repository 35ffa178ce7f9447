#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};
use vocare_kernel_contracts::{
    Identity, PendingResult, PhoneKey, PhoneKeyResolver, RosterLookup, RosterUnavailable,
    UnixTimeMs,
};

use crate::repo::{ResultStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterStateKind {
    NotLoaded,
    Unavailable,
    Ready,
}

impl RosterStateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotLoaded => "not_loaded",
            Self::Unavailable => "unavailable",
            Self::Ready => "ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterStatus {
    pub state: RosterStateKind,
    pub identity_count: usize,
    pub loaded_at: Option<UnixTimeMs>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterLoadReport {
    pub identities: usize,
    pub skipped_rows: usize,
    pub duplicate_phones: usize,
    pub unbound_emails: usize,
    /// Not-yet-durable results laid over the fetched rows.
    pub overlaid: usize,
}

#[derive(Debug, Default)]
struct RosterSnapshot {
    by_phone: HashMap<PhoneKey, Identity>,
    by_email: HashMap<String, PhoneKey>,
    loaded_at: UnixTimeMs,
}

impl RosterSnapshot {
    /// Binds `email` to `key` unless another phone already owns it.
    fn bind_email(&mut self, email: &str, key: &PhoneKey) -> bool {
        match self.by_email.get(email) {
            Some(owner) if owner != key => false,
            _ => {
                self.by_email.insert(email.to_string(), key.clone());
                true
            }
        }
    }

    /// Replaces the identity for its phone key and moves its email binding.
    fn replace(&mut self, identity: Identity) {
        if let Some(previous) = self.by_phone.get(&identity.phone_key) {
            if let Some(old_email) = previous.email.as_deref() {
                if self.by_email.get(old_email) == Some(&identity.phone_key) {
                    self.by_email.remove(old_email);
                }
            }
        }
        if let Some(email) = identity.email.as_deref() {
            if !self.bind_email(email, &identity.phone_key) {
                warn!(phone_key = %identity.phone_key, "email already bound to another phone; not indexed");
            }
        }
        self.by_phone.insert(identity.phone_key.clone(), identity);
    }
}

#[derive(Debug)]
enum RosterState {
    NotLoaded,
    Unavailable { reason: String, at: UnixTimeMs },
    Ready(RosterSnapshot),
}

/// In-memory copy of the external roster, indexed by phone key and email.
///
/// `load` replaces the whole state. Readers take the read lock and see either
/// the state before an `upsert` or after it.
pub struct RosterCache {
    resolver: Arc<dyn PhoneKeyResolver>,
    state: RwLock<RosterState>,
}

impl std::fmt::Debug for RosterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterCache")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl RosterCache {
    pub fn new(resolver: Arc<dyn PhoneKeyResolver>) -> Self {
        Self {
            resolver,
            state: RwLock::new(RosterState::NotLoaded),
        }
    }

    /// Fetches every row from `store` and swaps in a fresh snapshot.
    ///
    /// `unwritten` is called under the write lock, right before the swap, with
    /// the identities just fetched. The results it returns are applied on top
    /// of them; pass the ones accepted but not in the store yet.
    ///
    /// On a store failure the cache becomes `Unavailable` and every lookup
    /// fails closed until the next successful load.
    pub fn load<F>(
        &self,
        store: &dyn ResultStore,
        now: UnixTimeMs,
        unwritten: F,
    ) -> Result<RosterLoadReport, StoreError>
    where
        F: FnOnce(&HashMap<PhoneKey, Identity>) -> Vec<PendingResult>,
    {
        let rows = match store.fetch_roster() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "roster load failed; lookups fail closed");
                *self.state.write() = RosterState::Unavailable {
                    reason: e.to_string(),
                    at: now,
                };
                return Err(e);
            }
        };

        let mut report = RosterLoadReport::default();
        let mut snapshot = RosterSnapshot {
            loaded_at: now,
            ..RosterSnapshot::default()
        };
        for (index, row) in rows.iter().enumerate() {
            let identity = match row.to_identity(self.resolver.as_ref()) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(row = index, error = %e, "skipping roster row");
                    report.skipped_rows += 1;
                    continue;
                }
            };
            if snapshot.by_phone.contains_key(&identity.phone_key) {
                warn!(row = index, phone_key = %identity.phone_key, "duplicate phone key; keeping first row");
                report.duplicate_phones += 1;
                continue;
            }
            if let Some(email) = identity.email.as_deref() {
                if !snapshot.bind_email(email, &identity.phone_key) {
                    warn!(row = index, phone_key = %identity.phone_key, "email already bound to another phone; not indexed");
                    report.unbound_emails += 1;
                }
            }
            snapshot
                .by_phone
                .insert(identity.phone_key.clone(), identity);
        }

        let mut state = self.state.write();
        for result in unwritten(&snapshot.by_phone) {
            match result.applied_to(snapshot.by_phone.get(&result.phone_key)) {
                Ok(identity) => {
                    snapshot.replace(identity);
                    report.overlaid += 1;
                }
                Err(e) => {
                    warn!(phone_key = %result.phone_key, error = %e, "unwritten result not applied to roster");
                }
            }
        }
        report.identities = snapshot.by_phone.len();
        *state = RosterState::Ready(snapshot);
        drop(state);

        info!(
            identities = report.identities,
            skipped = report.skipped_rows,
            duplicates = report.duplicate_phones,
            overlaid = report.overlaid,
            "roster loaded"
        );
        Ok(report)
    }

    /// Replaces the cached identity for its phone key, rebinding its email.
    ///
    /// Call only after the durable write (or durable enqueue) succeeded.
    pub fn upsert(&self, identity: Identity) -> Result<(), RosterUnavailable> {
        let mut state = self.state.write();
        let snapshot = match &mut *state {
            RosterState::Ready(snapshot) => snapshot,
            RosterState::NotLoaded => return Err(RosterUnavailable::new("roster not loaded")),
            RosterState::Unavailable { reason, .. } => {
                return Err(RosterUnavailable::new(reason.clone()))
            }
        };
        snapshot.replace(identity);
        Ok(())
    }

    pub fn status(&self) -> RosterStatus {
        match &*self.state.read() {
            RosterState::NotLoaded => RosterStatus {
                state: RosterStateKind::NotLoaded,
                identity_count: 0,
                loaded_at: None,
                reason: None,
            },
            RosterState::Unavailable { reason, at } => RosterStatus {
                state: RosterStateKind::Unavailable,
                identity_count: 0,
                loaded_at: Some(*at),
                reason: Some(reason.clone()),
            },
            RosterState::Ready(snapshot) => RosterStatus {
                state: RosterStateKind::Ready,
                identity_count: snapshot.by_phone.len(),
                loaded_at: Some(snapshot.loaded_at),
                reason: None,
            },
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.read(), RosterState::Ready(_))
    }

    fn with_snapshot<T>(
        &self,
        f: impl FnOnce(&RosterSnapshot) -> T,
    ) -> Result<T, RosterUnavailable> {
        match &*self.state.read() {
            RosterState::Ready(snapshot) => Ok(f(snapshot)),
            RosterState::NotLoaded => Err(RosterUnavailable::new("roster not loaded")),
            RosterState::Unavailable { reason, .. } => Err(RosterUnavailable::new(reason.clone())),
        }
    }
}

impl RosterLookup for RosterCache {
    fn find_by_phone(&self, key: &PhoneKey) -> Result<Option<Identity>, RosterUnavailable> {
        self.with_snapshot(|s| s.by_phone.get(key).cloned())
    }

    fn find_by_email(&self, email: &str) -> Result<Option<Identity>, RosterUnavailable> {
        let email = email.trim().to_lowercase();
        self.with_snapshot(|s| {
            s.by_email
                .get(&email)
                .and_then(|key| s.by_phone.get(key))
                .cloned()
        })
    }
}
