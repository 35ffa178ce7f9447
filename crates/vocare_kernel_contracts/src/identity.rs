#![forbid(unsafe_code)]

use crate::common::validate_text;
use crate::{ContractViolation, SchemaVersion, Validate};

pub const IDENTITY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const PHONE_KEY_MIN_DIGITS: usize = 8;
pub const PHONE_KEY_MAX_DIGITS: usize = 15;
pub const NAME_MAX_CHARS: usize = 128;
pub const EMAIL_MAX_CHARS: usize = 254;

/// Canonical phone key: country code plus national significant number, digits only.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneKey(String);

impl PhoneKey {
    pub fn new(digits: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(digits.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PhoneKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        let len = self.0.len();
        if !(PHONE_KEY_MIN_DIGITS..=PHONE_KEY_MAX_DIGITS).contains(&len) {
            return Err(ContractViolation::InvalidLength {
                field: "phone_key",
                min: PHONE_KEY_MIN_DIGITS,
                max: PHONE_KEY_MAX_DIGITS,
                got: len,
            });
        }
        if !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ContractViolation::InvalidValue {
                field: "phone_key",
                reason: "must contain ASCII digits only",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for PhoneKey {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PhoneKey> for String {
    fn from(value: PhoneKey) -> Self {
        value.0
    }
}

impl std::fmt::Display for PhoneKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authoritative roster record for one participant.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Identity {
    pub phone_key: PhoneKey,
    pub name: String,
    pub email: Option<String>,
    pub course_result: Option<String>,
}

impl Identity {
    pub fn v1(
        phone_key: PhoneKey,
        name: &str,
        email: Option<&str>,
        course_result: Option<&str>,
    ) -> Result<Self, ContractViolation> {
        let identity = Self {
            phone_key,
            name: name.trim().to_string(),
            email: canonical_email(email),
            course_result: canonical_course(course_result),
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn has_course_result(&self) -> bool {
        self.course_result.is_some()
    }

    /// Returns a copy with the result recorded and the email backfilled when unset.
    pub fn with_result(
        &self,
        course_result: &str,
        email: Option<&str>,
    ) -> Result<Self, ContractViolation> {
        let email = match &self.email {
            Some(existing) => Some(existing.clone()),
            None => canonical_email(email),
        };
        let next = Self {
            phone_key: self.phone_key.clone(),
            name: self.name.clone(),
            email,
            course_result: canonical_course(Some(course_result)),
        };
        next.validate()?;
        Ok(next)
    }
}

impl Validate for Identity {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.phone_key.validate()?;
        validate_text("identity.name", &self.name, 1, NAME_MAX_CHARS)?;
        if let Some(email) = &self.email {
            validate_email("identity.email", email)?;
        }
        if let Some(course) = &self.course_result {
            validate_text("identity.course_result", course, 1, 64)?;
        }
        Ok(())
    }
}

/// Field set written by an `update` against the durable store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdentityFields {
    pub name: String,
    pub email: Option<String>,
    pub course_result: Option<String>,
}

impl From<&Identity> for IdentityFields {
    fn from(identity: &Identity) -> Self {
        Self {
            name: identity.name.clone(),
            email: identity.email.clone(),
            course_result: identity.course_result.clone(),
        }
    }
}

pub fn validate_email(field: &'static str, email: &str) -> Result<(), ContractViolation> {
    validate_text(field, email, 3, EMAIL_MAX_CHARS)?;
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain '@'",
        });
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be local@domain",
        });
    }
    if email.chars().any(char::is_whitespace) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain whitespace",
        });
    }
    Ok(())
}

/// Trimmed, lowercased email; blank input is treated as absent.
pub fn canonical_email(email: Option<&str>) -> Option<String> {
    email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
}

/// Trimmed, uppercased course label; blank input is treated as "no result yet".
pub fn canonical_course(course: Option<&str>) -> Option<String> {
    course
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
}

pub fn names_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Absent and blank emails compare equal.
pub fn emails_match(a: Option<&str>, b: Option<&str>) -> bool {
    canonical_email(a) == canonical_email(b)
}
