#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use vocare_engines::phone::PhoneNormalizer;
use vocare_engines::token::{TokenInvalid, TokenService};
use vocare_kernel_contracts::identity::{canonical_email, emails_match, names_match};
use vocare_kernel_contracts::{
    ContractViolation, IdentifiedArea, PendingResult, PhoneKey, PhoneKeyResolver, ReasonCodeId,
    UnixTimeMs,
};

pub mod reason_codes {
    use vocare_kernel_contracts::ReasonCodeId;

    pub const RECONCILE_PHONE_MISMATCH: ReasonCodeId = ReasonCodeId(0x5245_00F1);
    pub const RECONCILE_EMAIL_MISMATCH: ReasonCodeId = ReasonCodeId(0x5245_00F2);
    pub const RECONCILE_NAME_MISMATCH: ReasonCodeId = ReasonCodeId(0x5245_00F3);
    pub const RECONCILE_INVALID_SUBMISSION: ReasonCodeId = ReasonCodeId(0x5245_00F4);
}

/// A survey result as posted by the client, before any check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionInput {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub identified_area: IdentifiedArea,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileRejection {
    #[error("{0}")]
    Token(TokenInvalid),
    #[error("submitted phone does not match the session")]
    PhoneMismatch,
    #[error("submitted email does not match the session")]
    EmailMismatch,
    #[error("submitted name does not match the session")]
    NameMismatch,
    #[error("submission is invalid: {0}")]
    Invalid(ContractViolation),
}

impl ReconcileRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Token(reason) => reason.code(),
            Self::PhoneMismatch => "PHONE_MISMATCH",
            Self::EmailMismatch => "EMAIL_MISMATCH",
            Self::NameMismatch => "NAME_MISMATCH",
            Self::Invalid(_) => "INVALID_SUBMISSION",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Token(TokenInvalid::Expired) => "Sessão expirada. Faça login novamente.",
            Self::Token(_) => "Sessão inválida. Faça login novamente.",
            Self::PhoneMismatch => "O telefone enviado não corresponde ao usuário logado.",
            Self::EmailMismatch => "O email enviado não corresponde ao usuário logado.",
            Self::NameMismatch => "O nome enviado não corresponde ao usuário logado.",
            Self::Invalid(_) => "Dados do resultado inválidos.",
        }
    }

    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            Self::Token(reason) => reason.reason_code(),
            Self::PhoneMismatch => reason_codes::RECONCILE_PHONE_MISMATCH,
            Self::EmailMismatch => reason_codes::RECONCILE_EMAIL_MISMATCH,
            Self::NameMismatch => reason_codes::RECONCILE_NAME_MISMATCH,
            Self::Invalid(_) => reason_codes::RECONCILE_INVALID_SUBMISSION,
        }
    }
}

/// Cross-checks a submission against the session it was posted with.
///
/// Checks run in a fixed order and the first failure wins: token, phone,
/// email, name. Nothing is written here; the caller persists the result.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionReconciler<'a> {
    tokens: &'a TokenService,
    phones: &'a PhoneNormalizer,
}

impl<'a> SubmissionReconciler<'a> {
    pub fn new(tokens: &'a TokenService, phones: &'a PhoneNormalizer) -> Self {
        Self { tokens, phones }
    }

    pub fn reconcile(
        &self,
        token: &str,
        submission: &SubmissionInput,
        now: UnixTimeMs,
    ) -> Result<PendingResult, ReconcileRejection> {
        let claims = self
            .tokens
            .verify(token, now)
            .map_err(ReconcileRejection::Token)?;

        let session_key = self.phones.phone_key(claims.subject.as_str());
        let submitted_key = self.phones.phone_key(&submission.phone);
        let phone_key = match (session_key, submitted_key) {
            (Some(a), Some(b)) if a == b => a,
            _ => return Err(ReconcileRejection::PhoneMismatch),
        };

        if !emails_match(claims.email.as_deref(), submission.email.as_deref()) {
            return Err(ReconcileRejection::EmailMismatch);
        }
        if !names_match(&claims.name, &submission.name) {
            return Err(ReconcileRejection::NameMismatch);
        }

        PendingResult::v1(
            record_id(&phone_key, &submission.identified_area, now),
            &submission.name,
            phone_key,
            canonical_email(submission.email.as_deref()),
            submission.identified_area.clone(),
            now,
        )
        .map_err(ReconcileRejection::Invalid)
    }
}

/// Stable id for a captured result so downstream collectors can de-duplicate.
pub fn record_id(phone_key: &PhoneKey, area: &IdentifiedArea, captured_at: UnixTimeMs) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phone_key.as_str().as_bytes());
    hasher.update([0x1f_u8]);
    hasher.update(area.as_str().as_bytes());
    hasher.update([0x1f_u8]);
    hasher.update(captured_at.0.to_be_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use vocare_engines::token::{SigningSecret, TokenConfig};
    use vocare_kernel_contracts::ClaimsInput;

    use super::*;

    const NOW: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

    fn tokens() -> TokenService {
        TokenService::new(
            TokenConfig::mvp_v1(),
            &SigningSecret::new(vec![5u8; 32]).unwrap(),
        )
    }

    fn token_for(svc: &TokenService, email: Option<&str>) -> String {
        let claims = ClaimsInput::v1(PhoneKey::new("5511912345678").unwrap(), "Ana", email)
            .unwrap();
        svc.issue(&claims, NOW).unwrap().token
    }

    fn submission(phone: &str, name: &str, email: Option<&str>) -> SubmissionInput {
        SubmissionInput {
            name: name.to_string(),
            phone: phone.to_string(),
            email: email.map(str::to_string),
            identified_area: IdentifiedArea::new("musical").unwrap(),
        }
    }

    #[test]
    fn at_reconcile_01_matching_submission_is_accepted() {
        let svc = tokens();
        let phones = PhoneNormalizer::default();
        let token = token_for(&svc, Some("ana@mail.com"));
        let accepted = SubmissionReconciler::new(&svc, &phones)
            .reconcile(
                &token,
                &submission("(11) 91234-5678", " ANA ", Some("Ana@Mail.com ")),
                NOW,
            )
            .unwrap();
        assert_eq!(accepted.phone_key.as_str(), "5511912345678");
        assert_eq!(accepted.name, "ANA");
        assert_eq!(accepted.email.as_deref(), Some("ana@mail.com"));
        assert_eq!(accepted.identified_area.as_str(), "MUSICAL");
        assert_eq!(accepted.captured_at, NOW);
        assert_eq!(
            accepted.record_id,
            record_id(&accepted.phone_key, &accepted.identified_area, NOW)
        );
    }

    #[test]
    fn at_reconcile_02_phone_mismatch_is_rejected() {
        let svc = tokens();
        let phones = PhoneNormalizer::default();
        let token = token_for(&svc, None);
        let reconciler = SubmissionReconciler::new(&svc, &phones);
        assert_eq!(
            reconciler.reconcile(&token, &submission("5511999999999", "Ana", None), NOW),
            Err(ReconcileRejection::PhoneMismatch)
        );
        assert_eq!(
            reconciler.reconcile(&token, &submission("not a phone", "Ana", None), NOW),
            Err(ReconcileRejection::PhoneMismatch)
        );
    }

    #[test]
    fn at_reconcile_03_first_failure_wins() {
        let svc = tokens();
        let phones = PhoneNormalizer::default();
        let token = token_for(&svc, Some("ana@mail.com"));
        let reconciler = SubmissionReconciler::new(&svc, &phones);

        // Email is checked before name.
        assert_eq!(
            reconciler.reconcile(
                &token,
                &submission("5511912345678", "Bruno", Some("bruno@mail.com")),
                NOW
            ),
            Err(ReconcileRejection::EmailMismatch)
        );
        assert_eq!(
            reconciler.reconcile(
                &token,
                &submission("5511912345678", "Bruno", Some("ana@mail.com")),
                NOW
            ),
            Err(ReconcileRejection::NameMismatch)
        );
        assert_eq!(
            reconciler.reconcile(&token, &submission("5511912345678", "Ana", None), NOW),
            Err(ReconcileRejection::EmailMismatch)
        );
    }

    #[test]
    fn at_reconcile_04_token_failures_propagate() {
        let svc = tokens();
        let phones = PhoneNormalizer::default();
        let token = token_for(&svc, None);
        let reconciler = SubmissionReconciler::new(&svc, &phones);
        let later = UnixTimeMs(NOW.0 + 3_600_000);
        let rejection = reconciler
            .reconcile(&token, &submission("5511912345678", "Ana", None), later)
            .unwrap_err();
        assert_eq!(rejection, ReconcileRejection::Token(TokenInvalid::Expired));
        assert_eq!(rejection.code(), "TOKEN_EXPIRED");
        assert_eq!(
            reconciler.reconcile("garbage", &submission("5511912345678", "Ana", None), NOW),
            Err(ReconcileRejection::Token(TokenInvalid::Malformed))
        );
    }

    #[test]
    fn at_reconcile_05_blank_email_equals_absent_email() {
        let svc = tokens();
        let phones = PhoneNormalizer::default();
        let token = token_for(&svc, None);
        let accepted = SubmissionReconciler::new(&svc, &phones)
            .reconcile(&token, &submission("5511912345678", "Ana", Some("  ")), NOW)
            .unwrap();
        assert_eq!(accepted.email, None);
    }

    #[test]
    fn at_reconcile_06_record_id_is_stable_hex() {
        let key = PhoneKey::new("5511912345678").unwrap();
        let area = IdentifiedArea::new("MUSICAL").unwrap();
        let a = record_id(&key, &area, NOW);
        assert_eq!(a.len(), 64);
        assert_eq!(a, record_id(&key, &area, NOW));
        assert_ne!(a, record_id(&key, &area, UnixTimeMs(NOW.0 + 1)));
    }
}
