#![forbid(unsafe_code)]

use std::fmt;

use crate::{Identity, PhoneKey};

/// Lookups fail closed with this when no usable roster snapshot is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterUnavailable {
    pub reason: String,
}

impl RosterUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RosterUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "roster unavailable: {}", self.reason)
    }
}

impl std::error::Error for RosterUnavailable {}

/// Read-only view of the roster used for identity resolution.
pub trait RosterLookup {
    fn find_by_phone(&self, key: &PhoneKey) -> Result<Option<Identity>, RosterUnavailable>;

    /// Conflict detection only; never an authentication path.
    fn find_by_email(&self, email: &str) -> Result<Option<Identity>, RosterUnavailable>;
}

/// Maps a raw phone string (as typed by a person or stored in a roster row)
/// to its canonical key, or `None` when it is not an acceptable number.
pub trait PhoneKeyResolver: Send + Sync {
    fn phone_key(&self, raw: &str) -> Option<PhoneKey>;
}
