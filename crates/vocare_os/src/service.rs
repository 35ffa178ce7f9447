#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vocare_engines::identity::{IdentityConflict, IdentityMatcher, IdentityResolution};
use vocare_engines::phone::{PhoneNormalizer, PhoneRejection};
use vocare_engines::token::{
    SignedToken, SigningSecret, TokenInvalid, TokenIssueError, TokenService,
};
use vocare_kernel_contracts::{
    ClaimsInput, ContractViolation, Identity, PendingResult, PhoneKey, PhoneKeyResolver,
    RosterLookup, RosterUnavailable, UnixTimeMs,
};
use vocare_storage::repo::{upsert_identity, ResultStore, StoreError};
use vocare_storage::roster_cache::{RosterCache, RosterLoadReport, RosterStatus};

use crate::config::{ConfigError, CreationPolicy, PersistenceMode, ServiceConfig};
use crate::pending::PendingResultsBuffer;
use crate::reconcile::{ReconcileRejection, SubmissionInput, SubmissionReconciler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInput {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    NewIdentity,
    Returning,
}

impl LoginStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewIdentity => "new_identity",
            Self::Returning => "returning",
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::NewIdentity => "Login realizado com sucesso. Bem-vindo!",
            Self::Returning => "Login realizado com sucesso. Bem-vindo de volta!",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub status: LoginStatus,
    pub token: SignedToken,
    pub course: Option<String>,
    pub phone_key: PhoneKey,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoginError {
    #[error("invalid phone: {0}")]
    InvalidPhone(PhoneRejection),
    #[error("invalid login input: {0}")]
    InvalidInput(ContractViolation),
    #[error("identity conflict: {0}")]
    Conflict(IdentityConflict),
    #[error("{0}")]
    RosterUnavailable(RosterUnavailable),
    #[error("{0}")]
    Store(StoreError),
    #[error("{0}")]
    TokenIssue(TokenIssueError),
}

impl LoginError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPhone(rejection) => rejection.code(),
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Conflict(conflict) => conflict.code(),
            Self::RosterUnavailable(_) => "ROSTER_UNAVAILABLE",
            Self::Store(e) => e.code(),
            Self::TokenIssue(_) => "INTERNAL",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InvalidPhone(rejection) => rejection.user_message(),
            Self::InvalidInput(_) => "Dados de login inválidos. Verifique nome e email.",
            Self::Conflict(conflict) => conflict.user_message(),
            Self::RosterUnavailable(_) | Self::Store(_) => {
                "Serviço temporariamente indisponível. Tente novamente em instantes."
            }
            Self::TokenIssue(_) => "Erro interno ao gerar a sessão.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub stored_record: PendingResult,
    pub persistence: PersistenceMode,
}

impl SubmitOutcome {
    pub fn user_message(&self) -> &'static str {
        match self.persistence {
            PersistenceMode::Direct => "Resultado salvo com sucesso.",
            PersistenceMode::Buffered => "Resultado recebido com sucesso.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    #[error("submission rejected: {0}")]
    Rejected(ReconcileRejection),
    #[error("identity conflict: {0}")]
    Conflict(IdentityConflict),
    #[error("no roster record for {0}")]
    NotFound(PhoneKey),
    #[error("{0}")]
    RosterUnavailable(RosterUnavailable),
    #[error("{0}")]
    Store(StoreError),
    #[error("internal inconsistency: {0}")]
    Internal(String),
}

impl From<StoreError> for SubmitError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl SubmitError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected(rejection) => rejection.code(),
            Self::Conflict(conflict) => conflict.code(),
            Self::NotFound(_) => "IDENTITY_NOT_FOUND",
            Self::RosterUnavailable(_) => "ROSTER_UNAVAILABLE",
            Self::Store(e) => e.code(),
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Rejected(rejection) => rejection.user_message(),
            Self::Conflict(conflict) => conflict.user_message(),
            Self::NotFound(_) => "Usuário não encontrado. Faça login novamente.",
            Self::RosterUnavailable(_) | Self::Store(_) => {
                "Serviço temporariamente indisponível. Tente novamente em instantes."
            }
            Self::Internal(_) => "Erro interno ao salvar o resultado.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOutcome {
    pub count: usize,
    pub records: Vec<PendingResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCheck {
    pub phone_key: PhoneKey,
    pub may_proceed: bool,
    pub course: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessError {
    #[error("{0}")]
    Token(TokenInvalid),
    #[error("{0}")]
    RosterUnavailable(RosterUnavailable),
}

impl AccessError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Token(reason) => reason.code(),
            Self::RosterUnavailable(_) => "ROSTER_UNAVAILABLE",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Token(TokenInvalid::Expired) => "Sessão expirada. Faça login novamente.",
            Self::Token(_) => "Sessão inválida. Faça login novamente.",
            Self::RosterUnavailable(_) => {
                "Serviço temporariamente indisponível. Tente novamente em instantes."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushPassMetrics {
    pub drained: usize,
    pub written: usize,
    pub requeued: usize,
    /// Set aside after a permanent store error; never retried.
    pub failed: usize,
}

/// A buffered result the store refused for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedResult {
    pub result: PendingResult,
    pub code: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub roster: RosterStatus,
    pub pending: usize,
    pub failed: usize,
    pub persistence: PersistenceMode,
    pub creation: CreationPolicy,
}

/// How the service was keyed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOrigin {
    Configured,
    Ephemeral,
}

/// Owns every piece of shared state: the roster snapshot, the pending buffer
/// and the store handle. Share it behind an `Arc`.
///
/// No lock is held while the store is called.
pub struct IdentityService {
    persistence: PersistenceMode,
    creation: CreationPolicy,
    phones: Arc<PhoneNormalizer>,
    matcher: IdentityMatcher,
    tokens: TokenService,
    roster: RosterCache,
    pending: PendingResultsBuffer,
    failed: Mutex<Vec<FailedResult>>,
    /// Collected results not yet seen in a fetched roster.
    handed_off: Mutex<Vec<PendingResult>>,
    /// Serializes roster reloads with flush passes.
    passes: Mutex<()>,
    store: Arc<dyn ResultStore>,
}

impl std::fmt::Debug for IdentityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityService")
            .field("persistence", &self.persistence)
            .field("creation", &self.creation)
            .field("roster", &self.roster)
            .field("pending", &self.pending.len())
            .field("failed", &self.failed.lock().len())
            .finish_non_exhaustive()
    }
}

impl IdentityService {
    pub fn new(
        persistence: PersistenceMode,
        creation: CreationPolicy,
        phones: PhoneNormalizer,
        tokens: TokenService,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let phones = Arc::new(phones);
        let resolver: Arc<dyn PhoneKeyResolver> = phones.clone();
        Self {
            persistence,
            creation,
            phones,
            matcher: IdentityMatcher::new(),
            tokens,
            roster: RosterCache::new(resolver),
            pending: PendingResultsBuffer::new(),
            failed: Mutex::new(Vec::new()),
            handed_off: Mutex::new(Vec::new()),
            passes: Mutex::new(()),
            store,
        }
    }

    pub fn from_config(
        config: &ServiceConfig,
        store: Arc<dyn ResultStore>,
    ) -> Result<(Self, SecretOrigin), ConfigError> {
        let (secret, origin) = match &config.token_secret {
            Some(secret) => (secret.clone(), SecretOrigin::Configured),
            None => {
                warn!("no token secret configured; using an ephemeral one, sessions will not survive a restart");
                (SigningSecret::generate(), SecretOrigin::Ephemeral)
            }
        };
        let service = Self::new(
            config.persistence,
            config.creation,
            config.phone_normalizer()?,
            TokenService::new(config.token, &secret),
            store,
        );
        Ok((service, origin))
    }

    pub fn roster(&self) -> &RosterCache {
        &self.roster
    }

    pub fn pending(&self) -> &PendingResultsBuffer {
        &self.pending
    }

    pub fn login(&self, input: &LoginInput, now: UnixTimeMs) -> Result<LoginOutcome, LoginError> {
        let phone = self
            .phones
            .normalize(&input.phone)
            .map_err(LoginError::InvalidPhone)?;
        let claims = ClaimsInput::v1(phone.key.clone(), &input.name, input.email.as_deref())
            .map_err(LoginError::InvalidInput)?;

        let resolution = self
            .matcher
            .resolve(&claims.subject, &claims.name, claims.email.as_deref(), &self.roster)
            .map_err(LoginError::RosterUnavailable)?;

        let (status, course) = match resolution {
            IdentityResolution::Conflict(conflict) => {
                info!(phone_key = %claims.subject, code = conflict.code(), "login conflict");
                return Err(LoginError::Conflict(conflict));
            }
            IdentityResolution::ReturningIdentity(identity) => {
                (LoginStatus::Returning, identity.course_result)
            }
            IdentityResolution::NewIdentity => {
                if self.creation == CreationPolicy::OnLogin {
                    let identity = Identity::v1(
                        claims.subject.clone(),
                        &claims.name,
                        claims.email.as_deref(),
                        None,
                    )
                    .map_err(LoginError::InvalidInput)?;
                    self.store.insert(&identity).map_err(LoginError::Store)?;
                    self.cache_after_write(identity);
                }
                (LoginStatus::NewIdentity, None)
            }
        };

        let token = self
            .tokens
            .issue(&claims, now)
            .map_err(LoginError::TokenIssue)?;
        info!(phone_key = %claims.subject, status = status.as_str(), "login accepted");
        Ok(LoginOutcome {
            status,
            token,
            course,
            phone_key: claims.subject,
        })
    }

    pub fn submit(
        &self,
        token: &str,
        input: &SubmissionInput,
        now: UnixTimeMs,
    ) -> Result<SubmitOutcome, SubmitError> {
        let result = SubmissionReconciler::new(&self.tokens, &self.phones)
            .reconcile(token, input, now)
            .map_err(SubmitError::Rejected)?;

        if let Some(email) = result.email.as_deref() {
            let owner = self
                .roster
                .find_by_email(email)
                .map_err(SubmitError::RosterUnavailable)?;
            if owner.is_some_and(|o| o.phone_key != result.phone_key) {
                return Err(SubmitError::Conflict(IdentityConflict::EmailAlreadyBound));
            }
        }

        let identity = match self.persistence {
            PersistenceMode::Direct => self.write_through(&result)?,
            PersistenceMode::Buffered => {
                let cached = self
                    .roster
                    .find_by_phone(&result.phone_key)
                    .map_err(SubmitError::RosterUnavailable)?;
                let identity = result
                    .applied_to(cached.as_ref())
                    .map_err(|e| SubmitError::Internal(e.to_string()))?;
                let queued = self.pending.enqueue(result.clone());
                debug!(phone_key = %result.phone_key, queued, "result buffered");
                identity
            }
        };
        self.cache_after_write(identity);

        info!(
            phone_key = %result.phone_key,
            area = result.identified_area.as_str(),
            mode = self.persistence.as_str(),
            "result accepted"
        );
        Ok(SubmitOutcome {
            stored_record: result,
            persistence: self.persistence,
        })
    }

    /// Drains the pending buffer. A second call with nothing enqueued in
    /// between returns an empty batch.
    pub fn collect_pending(&self) -> CollectOutcome {
        // Held across the drain so a concurrent reload finds every record in
        // one of the two lists.
        let mut handed_off = self.handed_off.lock();
        let records = self.pending.drain_all();
        if !records.is_empty() {
            info!(count = records.len(), "pending results collected");
            handed_off.extend(records.iter().cloned());
        }
        drop(handed_off);
        CollectOutcome {
            count: records.len(),
            records,
        }
    }

    /// An identity may take the survey while it has no recorded result.
    pub fn access_check(&self, token: &str, now: UnixTimeMs) -> Result<AccessCheck, AccessError> {
        let claims = self.tokens.verify(token, now).map_err(AccessError::Token)?;
        let course = self
            .roster
            .find_by_phone(&claims.subject)
            .map_err(AccessError::RosterUnavailable)?
            .and_then(|identity| identity.course_result);
        Ok(AccessCheck {
            phone_key: claims.subject,
            may_proceed: course.is_none(),
            course,
        })
    }

    /// Refetches the roster. Results accepted but not yet in the store stay
    /// visible on top of the fresh rows.
    pub fn reload_roster(&self, now: UnixTimeMs) -> Result<RosterLoadReport, StoreError> {
        let _pass = self.passes.lock();
        self.roster.load(self.store.as_ref(), now, |fetched| {
            self.unwritten_results(fetched)
        })
    }

    /// Everything accepted that `fetched` may not reflect yet. Handed-off
    /// results are dropped once their row shows a course.
    fn unwritten_results(&self, fetched: &HashMap<PhoneKey, Identity>) -> Vec<PendingResult> {
        let mut handed_off = self.handed_off.lock();
        handed_off.retain(|r| {
            !fetched
                .get(&r.phone_key)
                .is_some_and(Identity::has_course_result)
        });
        let mut results = handed_off.clone();
        results.extend(self.failed.lock().iter().map(|f| f.result.clone()));
        results.extend(self.pending.snapshot());
        results
    }

    /// Results the store refused permanently, oldest first.
    pub fn failed_results(&self) -> Vec<FailedResult> {
        self.failed.lock().clone()
    }

    /// Writes every buffered result to the store.
    ///
    /// An unavailable store stops the pass and the unwritten results go back
    /// to the front of the buffer. Any other store error is permanent: the
    /// result moves to the failed list and is not retried.
    pub fn flush_pending_pass(&self) -> FlushPassMetrics {
        let _pass = self.passes.lock();
        let batch = self.pending.drain_all();
        let mut metrics = FlushPassMetrics {
            drained: batch.len(),
            ..FlushPassMetrics::default()
        };
        let mut requeue = Vec::new();
        let mut remaining = batch.into_iter();
        for result in remaining.by_ref() {
            match self.persist(&result) {
                Ok(identity) => {
                    metrics.written += 1;
                    self.cache_after_write(identity);
                }
                Err(e @ StoreError::Unavailable(_)) => {
                    warn!(phone_key = %result.phone_key, error = %e, "store unavailable; flush pass stopped");
                    requeue.push(result);
                    break;
                }
                Err(e) => {
                    error!(phone_key = %result.phone_key, error = %e, "store refused result; set aside");
                    metrics.failed += 1;
                    self.failed.lock().push(FailedResult {
                        code: e.code(),
                        reason: e.to_string(),
                        result,
                    });
                }
            }
        }
        requeue.extend(remaining);
        metrics.requeued = requeue.len();
        self.pending.requeue_front(requeue);
        if metrics.drained > 0 {
            info!(
                drained = metrics.drained,
                written = metrics.written,
                requeued = metrics.requeued,
                failed = metrics.failed,
                "flush pass complete"
            );
        }
        metrics
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            roster: self.roster.status(),
            pending: self.pending.len(),
            failed: self.failed.lock().len(),
            persistence: self.persistence,
            creation: self.creation,
        }
    }

    fn write_through(&self, result: &PendingResult) -> Result<Identity, SubmitError> {
        let key = &result.phone_key;
        upsert_identity(self.store.as_ref(), key, |row| {
            let existing = match row {
                Some(row) => Some(row.to_identity(self.phones.as_ref()).map_err(|e| {
                    error!(phone_key = %key, error = %e, "stored row for key is unusable");
                    SubmitError::Internal(format!("stored row for {key}: {e}"))
                })?),
                None if self.creation == CreationPolicy::OnLogin => {
                    return Err(SubmitError::NotFound(key.clone()));
                }
                None => None,
            };
            result
                .applied_to(existing.as_ref())
                .map_err(|e| SubmitError::Internal(e.to_string()))
        })
    }

    fn persist(&self, result: &PendingResult) -> Result<Identity, StoreError> {
        upsert_identity(self.store.as_ref(), &result.phone_key, |row| {
            let existing = row
                .map(|row| row.to_identity(self.phones.as_ref()))
                .transpose()
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            result
                .applied_to(existing.as_ref())
                .map_err(|e| StoreError::Malformed(e.to_string()))
        })
    }

    fn cache_after_write(&self, identity: Identity) {
        let phone_key = identity.phone_key.clone();
        if let Err(e) = self.roster.upsert(identity) {
            warn!(phone_key = %phone_key, error = %e, "cache not updated after write");
        }
    }
}
