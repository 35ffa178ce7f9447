#![forbid(unsafe_code)]

use std::sync::Arc;

use vocare_kernel_contracts::{PhoneKey, PhoneKeyResolver, ReasonCodeId};

pub mod reason_codes {
    use vocare_kernel_contracts::ReasonCodeId;

    pub const PHONE_NOT_A_POSSIBLE_NUMBER: ReasonCodeId = ReasonCodeId(0x5048_00F1);
    pub const PHONE_NOT_A_MOBILE_NUMBER: ReasonCodeId = ReasonCodeId(0x5048_00F2);
    pub const PHONE_UNPARSEABLE: ReasonCodeId = ReasonCodeId(0x5048_00F3);
}

const MAX_INPUT_DIGITS: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum PhoneRejection {
    #[error("phone number is not a possible number")]
    NotAPossibleNumber,
    #[error("phone number is not a mobile number for the region")]
    NotAMobileNumber,
    #[error("phone number could not be parsed")]
    Unparseable,
}

impl PhoneRejection {
    pub fn code(self) -> &'static str {
        match self {
            Self::NotAPossibleNumber => "NOT_A_POSSIBLE_NUMBER",
            Self::NotAMobileNumber => "NOT_A_MOBILE_NUMBER",
            Self::Unparseable => "UNPARSEABLE",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::NotAPossibleNumber => {
                "Número de telefone inválido: o telefone fornecido não é um número possível."
            }
            Self::NotAMobileNumber => {
                "Número de telefone inválido: o telefone não parece ser um número de celular válido."
            }
            Self::Unparseable => {
                "Número de telefone inválido: use apenas dígitos, espaços, '+', '-' e parênteses."
            }
        }
    }

    pub fn reason_code(self) -> ReasonCodeId {
        match self {
            Self::NotAPossibleNumber => reason_codes::PHONE_NOT_A_POSSIBLE_NUMBER,
            Self::NotAMobileNumber => reason_codes::PHONE_NOT_A_MOBILE_NUMBER,
            Self::Unparseable => reason_codes::PHONE_UNPARSEABLE,
        }
    }
}

/// Region-specific numbering rules. National numbers passed in are digits
/// only, without country code or trunk prefix.
pub trait NumberingPlan: Send + Sync {
    fn region(&self) -> &'static str;
    fn country_code(&self) -> &'static str;
    fn trunk_prefix(&self) -> Option<char>;
    fn is_possible_national(&self, national: &str) -> bool;
    fn is_mobile_national(&self, national: &str) -> bool;
}

/// Brazilian plan: two-digit DDD area code followed by an 8- or 9-digit
/// subscriber number. Mobiles are `9` + 8 digits, or legacy `7` + 7 digits.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrazilNumberingPlan;

impl BrazilNumberingPlan {
    fn is_area_code(ddd: &str) -> bool {
        let mut chars = ddd.chars();
        let (Some(first), Some(second), None) = (chars.next(), chars.next(), chars.next()) else {
            return false;
        };
        match first {
            '1' | '4' | '6' | '8' | '9' => matches!(second, '1'..='9'),
            '2' => matches!(second, '1' | '2' | '4' | '7' | '8'),
            '3' => matches!(second, '1'..='5' | '7' | '8'),
            '5' => matches!(second, '1' | '3' | '4' | '5'),
            '7' => matches!(second, '1' | '3' | '4' | '5' | '7' | '9'),
            _ => false,
        }
    }
}

impl NumberingPlan for BrazilNumberingPlan {
    fn region(&self) -> &'static str {
        "BR"
    }

    fn country_code(&self) -> &'static str {
        "55"
    }

    fn trunk_prefix(&self) -> Option<char> {
        Some('0')
    }

    fn is_possible_national(&self, national: &str) -> bool {
        // 8 and 9 digits are local-only forms without the area code.
        (8..=11).contains(&national.len())
    }

    fn is_mobile_national(&self, national: &str) -> bool {
        if national.len() < 2 || !national.is_ascii() {
            return false;
        }
        let (ddd, subscriber) = national.split_at(2);
        if !Self::is_area_code(ddd) {
            return false;
        }
        match subscriber.len() {
            9 => subscriber.starts_with('9'),
            8 => subscriber.starts_with('7'),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalPhone {
    pub key: PhoneKey,
    pub country_code: &'static str,
    pub national_number: String,
}

impl CanonicalPhone {
    pub fn e164(&self) -> String {
        format!("+{}", self.key.as_str())
    }
}

#[derive(Clone)]
pub struct PhoneNormalizer {
    plan: Arc<dyn NumberingPlan>,
}

impl std::fmt::Debug for PhoneNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoneNormalizer")
            .field("region", &self.plan.region())
            .finish()
    }
}

impl Default for PhoneNormalizer {
    fn default() -> Self {
        Self::new(Arc::new(BrazilNumberingPlan))
    }
}

impl PhoneNormalizer {
    pub fn new(plan: Arc<dyn NumberingPlan>) -> Self {
        Self { plan }
    }

    /// Plans bundled with the crate, by ISO region code.
    pub fn for_region(region: &str) -> Option<Self> {
        match region.trim().to_ascii_uppercase().as_str() {
            "BR" => Some(Self::default()),
            _ => None,
        }
    }

    pub fn region(&self) -> &'static str {
        self.plan.region()
    }

    pub fn normalize(&self, raw: &str) -> Result<CanonicalPhone, PhoneRejection> {
        let (international, digits) = scan(raw)?;
        let country_code = self.plan.country_code();

        let national = if international {
            if digits.starts_with('0') {
                return Err(PhoneRejection::Unparseable);
            }
            match digits.strip_prefix(country_code) {
                Some(rest) => rest.to_string(),
                None => return Err(PhoneRejection::NotAMobileNumber),
            }
        } else {
            let without_trunk = match self.plan.trunk_prefix() {
                Some(trunk) => digits.strip_prefix(trunk).unwrap_or(&digits).to_string(),
                None => digits,
            };
            match without_trunk.strip_prefix(country_code) {
                Some(rest)
                    if !self.plan.is_possible_national(&without_trunk)
                        && self.plan.is_possible_national(rest) =>
                {
                    rest.to_string()
                }
                _ => without_trunk,
            }
        };

        if !self.plan.is_possible_national(&national) {
            return Err(PhoneRejection::NotAPossibleNumber);
        }
        if !self.plan.is_mobile_national(&national) {
            return Err(PhoneRejection::NotAMobileNumber);
        }

        let key = PhoneKey::new(format!("{country_code}{national}"))
            .map_err(|_| PhoneRejection::NotAPossibleNumber)?;
        Ok(CanonicalPhone {
            key,
            country_code,
            national_number: national,
        })
    }
}

impl PhoneKeyResolver for PhoneNormalizer {
    fn phone_key(&self, raw: &str) -> Option<PhoneKey> {
        self.normalize(raw).ok().map(|phone| phone.key)
    }
}

/// Splits raw input into (has leading '+', digits). Only separators people
/// actually type are tolerated.
fn scan(raw: &str) -> Result<(bool, String), PhoneRejection> {
    let trimmed = raw.trim();
    let (international, body) = match trimmed.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let mut digits = String::with_capacity(body.len());
    for c in body.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '\t' | '-' | '.' | '(' | ')' | '/' => {}
            _ => return Err(PhoneRejection::Unparseable),
        }
    }
    if digits.len() < 2 {
        return Err(PhoneRejection::Unparseable);
    }
    if digits.len() > MAX_INPUT_DIGITS {
        return Err(PhoneRejection::NotAPossibleNumber);
    }
    Ok((international, digits))
}
