#![forbid(unsafe_code)]

use vocare_kernel_contracts::identity::{canonical_email, emails_match, names_match};
use vocare_kernel_contracts::{Identity, PhoneKey, ReasonCodeId, RosterLookup, RosterUnavailable};

pub mod reason_codes {
    use vocare_kernel_contracts::ReasonCodeId;

    pub const IDENTITY_OK_NEW: ReasonCodeId = ReasonCodeId(0x4944_0001);
    pub const IDENTITY_OK_RETURNING: ReasonCodeId = ReasonCodeId(0x4944_0002);

    pub const IDENTITY_NAME_MISMATCH: ReasonCodeId = ReasonCodeId(0x4944_00F1);
    pub const IDENTITY_EMAIL_MISMATCH: ReasonCodeId = ReasonCodeId(0x4944_00F2);
    pub const IDENTITY_EMAIL_ALREADY_BOUND: ReasonCodeId = ReasonCodeId(0x4944_00F3);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum IdentityConflict {
    #[error("name does not match the roster record for this phone")]
    NameMismatch,
    #[error("email does not match the roster record for this phone")]
    EmailMismatch,
    #[error("email is already bound to a different phone")]
    EmailAlreadyBound,
}

impl IdentityConflict {
    pub fn code(self) -> &'static str {
        match self {
            Self::NameMismatch => "NAME_MISMATCH",
            Self::EmailMismatch => "EMAIL_MISMATCH",
            Self::EmailAlreadyBound => "EMAIL_ALREADY_BOUND",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::NameMismatch => "Credenciais inválidas. Nome de usuário incorreto.",
            Self::EmailMismatch => "Credenciais inválidas. Email não corresponde ao cadastro.",
            Self::EmailAlreadyBound => {
                "Este email já está vinculado a outro telefone. Procure o suporte."
            }
        }
    }

    pub fn reason_code(self) -> ReasonCodeId {
        match self {
            Self::NameMismatch => reason_codes::IDENTITY_NAME_MISMATCH,
            Self::EmailMismatch => reason_codes::IDENTITY_EMAIL_MISMATCH,
            Self::EmailAlreadyBound => reason_codes::IDENTITY_EMAIL_ALREADY_BOUND,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityResolution {
    NewIdentity,
    ReturningIdentity(Identity),
    Conflict(IdentityConflict),
}

impl IdentityResolution {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            Self::NewIdentity => reason_codes::IDENTITY_OK_NEW,
            Self::ReturningIdentity(_) => reason_codes::IDENTITY_OK_RETURNING,
            Self::Conflict(conflict) => conflict.reason_code(),
        }
    }
}

/// Decides whether a login attempt is a new identity, a returning one, or a
/// conflict. Phone is the key, name is the only secret, and email is a
/// uniqueness constraint that never grants access on its own.
///
/// `resolve` only reads the roster. Backfilling an email on a record that has
/// none happens later, on the write path.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMatcher;

impl IdentityMatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve<R>(
        &self,
        phone_key: &PhoneKey,
        name: &str,
        email: Option<&str>,
        roster: &R,
    ) -> Result<IdentityResolution, RosterUnavailable>
    where
        R: RosterLookup + ?Sized,
    {
        let supplied_email = canonical_email(email);

        let Some(stored) = roster.find_by_phone(phone_key)? else {
            if let Some(email) = supplied_email.as_deref() {
                if let Some(owner) = roster.find_by_email(email)? {
                    if &owner.phone_key != phone_key {
                        return Ok(IdentityResolution::Conflict(
                            IdentityConflict::EmailAlreadyBound,
                        ));
                    }
                }
            }
            return Ok(IdentityResolution::NewIdentity);
        };

        if !names_match(&stored.name, name) {
            return Ok(IdentityResolution::Conflict(IdentityConflict::NameMismatch));
        }

        if let (Some(stored_email), Some(_)) = (stored.email.as_deref(), supplied_email.as_deref()) {
            if !emails_match(Some(stored_email), supplied_email.as_deref()) {
                return Ok(IdentityResolution::Conflict(IdentityConflict::EmailMismatch));
            }
        }

        Ok(IdentityResolution::ReturningIdentity(stored))
    }
}
