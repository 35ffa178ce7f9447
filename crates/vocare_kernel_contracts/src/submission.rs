#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::common::validate_text;
use crate::identity::{canonical_email, validate_email, NAME_MAX_CHARS};
use crate::{ContractViolation, Identity, PhoneKey, UnixTimeMs, Validate};

pub const AREA_MAX_CHARS: usize = 64;

/// Survey outcome label, stored trimmed and uppercased.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct IdentifiedArea(String);

impl IdentifiedArea {
    pub fn new(label: &str) -> Result<Self, ContractViolation> {
        let v = Self(label.trim().to_uppercase());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for IdentifiedArea {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("identified_area", &self.0, 1, AREA_MAX_CHARS)
    }
}

impl TryFrom<String> for IdentifiedArea {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<IdentifiedArea> for String {
    fn from(value: IdentifiedArea) -> Self {
        value.0
    }
}

impl From<IntelligenceArea> for IdentifiedArea {
    fn from(area: IntelligenceArea) -> Self {
        Self(area.as_key().to_uppercase())
    }
}

/// The nine survey categories, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntelligenceArea {
    LogicalMathematical,
    Linguistic,
    Spatial,
    Musical,
    BodilyKinesthetic,
    Interpersonal,
    Intrapersonal,
    Naturalist,
    Existential,
}

impl IntelligenceArea {
    pub const ALL: [IntelligenceArea; 9] = [
        IntelligenceArea::LogicalMathematical,
        IntelligenceArea::Linguistic,
        IntelligenceArea::Spatial,
        IntelligenceArea::Musical,
        IntelligenceArea::BodilyKinesthetic,
        IntelligenceArea::Interpersonal,
        IntelligenceArea::Intrapersonal,
        IntelligenceArea::Naturalist,
        IntelligenceArea::Existential,
    ];

    /// Score key used by the survey client.
    pub fn as_key(self) -> &'static str {
        match self {
            Self::LogicalMathematical => "logicoMatematica",
            Self::Linguistic => "linguistica",
            Self::Spatial => "espacial",
            Self::Musical => "musical",
            Self::BodilyKinesthetic => "corporalCinestesica",
            Self::Interpersonal => "interpessoal",
            Self::Intrapersonal => "intrapessoal",
            Self::Naturalist => "naturalista",
            Self::Existential => "existencial",
        }
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        let key = key.trim();
        Self::ALL
            .into_iter()
            .find(|area| area.as_key().eq_ignore_ascii_case(key))
    }
}

/// Picks the highest-scoring known area. Ties go to the earlier area in
/// canonical order; unknown keys and non-finite scores are ignored.
pub fn top_scoring_area(scores: &BTreeMap<String, f64>) -> Option<IntelligenceArea> {
    let mut by_area: BTreeMap<IntelligenceArea, f64> = BTreeMap::new();
    for (key, score) in scores {
        if !score.is_finite() {
            continue;
        }
        if let Some(area) = IntelligenceArea::parse_key(key) {
            by_area.insert(area, *score);
        }
    }
    let mut best: Option<(IntelligenceArea, f64)> = None;
    for (area, score) in by_area {
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((area, score)),
        }
    }
    best.map(|(area, _)| area)
}

/// An accepted submission waiting to be written to the durable store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PendingResult {
    pub record_id: String,
    pub name: String,
    pub phone_key: PhoneKey,
    pub email: Option<String>,
    pub identified_area: IdentifiedArea,
    pub captured_at: UnixTimeMs,
}

impl PendingResult {
    pub fn v1(
        record_id: String,
        name: &str,
        phone_key: PhoneKey,
        email: Option<String>,
        identified_area: IdentifiedArea,
        captured_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let result = Self {
            record_id,
            name: name.trim().to_string(),
            phone_key,
            email,
            identified_area,
            captured_at,
        };
        result.validate()?;
        Ok(result)
    }

    /// The identity as it should look once this result is recorded on top of
    /// `existing`.
    pub fn applied_to(&self, existing: Option<&Identity>) -> Result<Identity, ContractViolation> {
        match existing {
            Some(identity) => {
                identity.with_result(self.identified_area.as_str(), self.email.as_deref())
            }
            None => Identity::v1(
                self.phone_key.clone(),
                &self.name,
                canonical_email(self.email.as_deref()).as_deref(),
                Some(self.identified_area.as_str()),
            ),
        }
    }
}

impl Validate for PendingResult {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.record_id.len() != 64 || !self.record_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ContractViolation::InvalidValue {
                field: "pending_result.record_id",
                reason: "must be 64 hex chars",
            });
        }
        validate_text("pending_result.name", &self.name, 1, NAME_MAX_CHARS)?;
        self.phone_key.validate()?;
        if let Some(email) = &self.email {
            validate_email("pending_result.email", email)?;
        }
        self.identified_area.validate()
    }
}
