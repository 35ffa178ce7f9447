#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{error, warn};
use vocare_engines::identity::IdentityConflict;
use vocare_kernel_contracts::submission::top_scoring_area;
use vocare_kernel_contracts::{IdentifiedArea, PendingResult, PhoneKeyResolver, UnixTimeMs};
use vocare_os::config::{ConfigError, ServiceConfig};
use vocare_os::reconcile::{ReconcileRejection, SubmissionInput};
use vocare_os::service::{
    AccessError, FlushPassMetrics, IdentityService, LoginError, LoginInput, SecretOrigin,
    SubmitError,
};
use vocare_storage::json_file::JsonFileResultStore;
use vocare_storage::repo::ResultStore;
use vocare_storage::roster_cache::RosterStateKind;

pub const SERVICE_NAME: &str = "vocare_adapter_http";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoginRequest {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoginResponse {
    pub status: String,
    pub outcome: String,
    pub message: String,
    pub token: String,
    pub expires_at: String,
    pub course: Option<String>,
    pub phone_key: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmitResultRequest {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "identifiedArea")]
    pub identified_area: Option<String>,
    #[serde(default)]
    pub scores: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoredRecord {
    pub record_id: String,
    pub name: String,
    pub phone_key: String,
    pub email: Option<String>,
    pub identified_area: String,
    pub captured_at: String,
}

impl From<&PendingResult> for StoredRecord {
    fn from(result: &PendingResult) -> Self {
        Self {
            record_id: result.record_id.clone(),
            name: result.name.clone(),
            phone_key: result.phone_key.as_str().to_string(),
            email: result.email.clone(),
            identified_area: result.identified_area.as_str().to_string(),
            captured_at: rfc3339_ms(result.captured_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitResultResponse {
    pub status: String,
    pub message: String,
    pub stored_record: StoredRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CollectResponse {
    pub status: String,
    pub count: usize,
    pub records: Vec<StoredRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessResponse {
    pub status: String,
    pub may_proceed: bool,
    pub course: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub roster_state: String,
    pub identity_count: usize,
    pub roster_loaded_at: Option<String>,
    pub reason: Option<String>,
    pub pending: usize,
    pub failed: usize,
    pub persistence: String,
    pub creation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceBanner {
    pub service: String,
    pub version: String,
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Login(#[from] LoginError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("missing bearer token")]
    MissingBearer,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdapterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Login(e) => match e {
                LoginError::InvalidPhone(_) | LoginError::InvalidInput(_) => {
                    StatusCode::BAD_REQUEST
                }
                LoginError::Conflict(IdentityConflict::EmailAlreadyBound) => StatusCode::CONFLICT,
                LoginError::Conflict(_) => StatusCode::UNAUTHORIZED,
                LoginError::RosterUnavailable(_) | LoginError::Store(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                LoginError::TokenIssue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Submit(e) => match e {
                SubmitError::Rejected(ReconcileRejection::Invalid(_)) => StatusCode::BAD_REQUEST,
                SubmitError::Rejected(_) => StatusCode::UNAUTHORIZED,
                SubmitError::Conflict(_) => StatusCode::CONFLICT,
                SubmitError::NotFound(_) => StatusCode::NOT_FOUND,
                SubmitError::RosterUnavailable(_) | SubmitError::Store(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                SubmitError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Access(e) => match e {
                AccessError::Token(_) => StatusCode::UNAUTHORIZED,
                AccessError::RosterUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::MissingBearer => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Login(e) => e.code(),
            Self::Submit(e) => e.code(),
            Self::Access(e) => e.code(),
            Self::MissingBearer => "MISSING_TOKEN",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Login(e) => e.user_message().to_string(),
            Self::Submit(e) => e.user_message().to_string(),
            Self::Access(e) => e.user_message().to_string(),
            Self::MissingBearer => "Token de acesso ausente. Faça login novamente.".to_string(),
            Self::InvalidRequest(reason) => format!("Requisição inválida: {reason}"),
            Self::Internal(_) => "Erro interno do servidor.".to_string(),
        }
    }
}

impl From<JsonRejection> for AdapterError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            status: "error".to_string(),
            code: self.code().to_string(),
            message: self.user_message(),
        };
        (status, Json(body)).into_response()
    }
}

/// Thin HTTP-facing wrapper around the shared [`IdentityService`].
///
/// Every method is synchronous and may call the store; async handlers run
/// them on the blocking pool.
#[derive(Debug, Clone)]
pub struct AdapterRuntime {
    service: Arc<IdentityService>,
}

impl AdapterRuntime {
    pub fn new(service: Arc<IdentityService>) -> Self {
        Self { service }
    }

    /// Builds the service over the JSON row store named by `config`.
    pub fn from_config(config: &ServiceConfig) -> Result<(Self, SecretOrigin), ConfigError> {
        let resolver: Arc<dyn PhoneKeyResolver> = Arc::new(config.phone_normalizer()?);
        let store: Arc<dyn ResultStore> =
            Arc::new(JsonFileResultStore::open(config.store_path.clone(), resolver));
        let (service, origin) = IdentityService::from_config(config, store)?;
        Ok((Self::new(Arc::new(service)), origin))
    }

    pub fn service(&self) -> &IdentityService {
        &self.service
    }

    pub fn login(
        &self,
        request: &LoginRequest,
        now: UnixTimeMs,
    ) -> Result<LoginResponse, AdapterError> {
        let input = LoginInput {
            name: request.name.clone(),
            phone: request.phone.clone(),
            email: request.email.clone(),
        };
        let outcome = self.service.login(&input, now)?;
        Ok(LoginResponse {
            status: "success".to_string(),
            outcome: outcome.status.as_str().to_string(),
            message: outcome.status.user_message().to_string(),
            token: outcome.token.token,
            expires_at: rfc3339_ms(outcome.token.expires_at),
            course: outcome.course,
            phone_key: outcome.phone_key.as_str().to_string(),
        })
    }

    pub fn submit_result(
        &self,
        bearer: &str,
        request: &SubmitResultRequest,
        now: UnixTimeMs,
    ) -> Result<SubmitResultResponse, AdapterError> {
        let input = SubmissionInput {
            name: request.name.clone(),
            phone: request.phone.clone(),
            email: request.email.clone(),
            identified_area: resolve_area(request)?,
        };
        let outcome = self.service.submit(bearer, &input, now)?;
        Ok(SubmitResultResponse {
            status: "success".to_string(),
            message: outcome.user_message().to_string(),
            stored_record: StoredRecord::from(&outcome.stored_record),
        })
    }

    pub fn collect_pending(&self) -> CollectResponse {
        let outcome = self.service.collect_pending();
        CollectResponse {
            status: "success".to_string(),
            count: outcome.count,
            records: outcome.records.iter().map(StoredRecord::from).collect(),
        }
    }

    pub fn access(&self, bearer: &str, now: UnixTimeMs) -> Result<AccessResponse, AdapterError> {
        let check = self.service.access_check(bearer, now)?;
        let message = if check.may_proceed {
            "Acesso liberado ao teste.".to_string()
        } else {
            "Teste já realizado.".to_string()
        };
        Ok(AccessResponse {
            status: "success".to_string(),
            may_proceed: check.may_proceed,
            course: check.course,
            message,
        })
    }

    /// `Err` carries the same report when the roster is not ready.
    pub fn health_report(&self) -> Result<AdapterHealthResponse, AdapterHealthResponse> {
        let status = self.service.status();
        let ready = status.roster.state == RosterStateKind::Ready;
        let response = AdapterHealthResponse {
            status: if ready { "ok" } else { "degraded" }.to_string(),
            roster_state: status.roster.state.as_str().to_string(),
            identity_count: status.roster.identity_count,
            roster_loaded_at: status.roster.loaded_at.map(rfc3339_ms),
            reason: status.roster.reason,
            pending: status.pending,
            failed: status.failed,
            persistence: status.persistence.as_str().to_string(),
            creation: status.creation.as_str().to_string(),
        };
        if ready {
            Ok(response)
        } else {
            Err(response)
        }
    }

    pub fn run_roster_reload_pass(&self, now: UnixTimeMs) -> bool {
        match self.service.reload_roster(now) {
            Ok(report) => {
                if report.skipped_rows > 0 || report.duplicate_phones > 0 {
                    warn!(
                        skipped = report.skipped_rows,
                        duplicates = report.duplicate_phones,
                        unbound_emails = report.unbound_emails,
                        "roster reload dropped rows"
                    );
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "roster reload pass failed");
                false
            }
        }
    }

    pub fn run_flush_worker_pass(&self) -> FlushPassMetrics {
        self.service.flush_pending_pass()
    }
}

const ROUTES: [&str; 7] = [
    "GET /",
    "GET /healthz",
    "POST /v1/login",
    "POST /v1/results",
    "GET /v1/results/collect",
    "POST /v1/results/collect",
    "GET /v1/access",
];

pub fn router(runtime: AdapterRuntime) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/healthz", get(healthz))
        .route("/v1/login", post(login))
        .route("/v1/results", post(submit_result))
        .route("/v1/results/collect", get(collect).post(collect))
        .route("/v1/access", get(access))
        .with_state(runtime)
}

async fn banner() -> Json<ServiceBanner> {
    Json(ServiceBanner {
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        routes: ROUTES.iter().map(|r| r.to_string()).collect(),
    })
}

async fn healthz(
    State(runtime): State<AdapterRuntime>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    match runtime.health_report() {
        Ok(report) => (StatusCode::OK, Json(report)),
        Err(report) => (StatusCode::SERVICE_UNAVAILABLE, Json(report)),
    }
}

async fn login(
    State(runtime): State<AdapterRuntime>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AdapterError> {
    let Json(request) = payload?;
    let response = run_blocking(move || runtime.login(&request, now_unix_ms())).await??;
    Ok(Json(response))
}

async fn submit_result(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
    payload: Result<Json<SubmitResultRequest>, JsonRejection>,
) -> Result<Json<SubmitResultResponse>, AdapterError> {
    let bearer = bearer_token(&headers)?;
    let Json(request) = payload?;
    let response =
        run_blocking(move || runtime.submit_result(&bearer, &request, now_unix_ms())).await??;
    Ok(Json(response))
}

async fn collect(State(runtime): State<AdapterRuntime>) -> Json<CollectResponse> {
    Json(runtime.collect_pending())
}

async fn access(
    State(runtime): State<AdapterRuntime>,
    headers: HeaderMap,
) -> Result<Json<AccessResponse>, AdapterError> {
    let bearer = bearer_token(&headers)?;
    Ok(Json(runtime.access(&bearer, now_unix_ms())?))
}

async fn run_blocking<T, F>(f: F) -> Result<T, AdapterError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AdapterError::Internal(format!("blocking task failed: {e}")))
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AdapterError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AdapterError::MissingBearer)?;
    let (scheme, token) = value
        .trim()
        .split_once(' ')
        .ok_or(AdapterError::MissingBearer)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AdapterError::MissingBearer);
    }
    Ok(token.to_string())
}

fn resolve_area(request: &SubmitResultRequest) -> Result<IdentifiedArea, AdapterError> {
    if let Some(label) = request
        .identified_area
        .as_deref()
        .filter(|l| !l.trim().is_empty())
    {
        return IdentifiedArea::new(label)
            .map_err(|e| AdapterError::InvalidRequest(e.to_string()));
    }
    request
        .scores
        .as_ref()
        .and_then(top_scoring_area)
        .map(IdentifiedArea::from)
        .ok_or_else(|| {
            AdapterError::InvalidRequest("identified_area or scores is required".to_string())
        })
}

pub fn now_unix_ms() -> UnixTimeMs {
    UnixTimeMs(u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0))
}

fn rfc3339_ms(at: UnixTimeMs) -> String {
    i64::try_from(at.0)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}
