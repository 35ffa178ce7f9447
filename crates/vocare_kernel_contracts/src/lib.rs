#![forbid(unsafe_code)]

pub mod common;
pub mod identity;
pub mod roster;
pub mod session;
pub mod submission;

pub use common::{ContractViolation, ReasonCodeId, SchemaVersion, UnixTimeMs, Validate};
pub use identity::{Identity, IdentityFields, PhoneKey};
pub use roster::{PhoneKeyResolver, RosterLookup, RosterUnavailable};
pub use session::{ClaimsInput, SessionClaims};
pub use submission::{IdentifiedArea, IntelligenceArea, PendingResult};
