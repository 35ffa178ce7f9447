#![forbid(unsafe_code)]

use crate::common::validate_text;
use crate::identity::{canonical_email, validate_email, NAME_MAX_CHARS};
use crate::{ContractViolation, PhoneKey, UnixTimeMs, Validate};

/// Identity attributes bound into a session token at issue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimsInput {
    pub subject: PhoneKey,
    pub name: String,
    pub email: Option<String>,
}

impl ClaimsInput {
    pub fn v1(
        subject: PhoneKey,
        name: &str,
        email: Option<&str>,
    ) -> Result<Self, ContractViolation> {
        let input = Self {
            subject,
            name: name.trim().to_string(),
            email: canonical_email(email),
        };
        input.validate()?;
        Ok(input)
    }
}

impl Validate for ClaimsInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.subject.validate()?;
        validate_text("claims_input.name", &self.name, 1, NAME_MAX_CHARS)?;
        if let Some(email) = &self.email {
            validate_email("claims_input.email", email)?;
        }
        Ok(())
    }
}

/// Claims recovered from a verified session token.
///
/// `subject` is the canonical phone key the token was issued for; `name` and
/// `email` are carried context and never authoritative on their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub subject: PhoneKey,
    pub name: String,
    pub email: Option<String>,
    pub issued_at: UnixTimeMs,
    pub expires_at: UnixTimeMs,
}

impl SessionClaims {
    pub fn is_expired_at(&self, now: UnixTimeMs) -> bool {
        now >= self.expires_at
    }
}

impl Validate for SessionClaims {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.subject.validate()?;
        if self.expires_at <= self.issued_at {
            return Err(ContractViolation::InvalidValue {
                field: "session_claims.expires_at",
                reason: "must be after issued_at",
            });
        }
        Ok(())
    }
}
