#![forbid(unsafe_code)]

use std::sync::Arc;

use vocare_engines::identity::IdentityConflict;
use vocare_engines::phone::PhoneNormalizer;
use vocare_engines::token::{SigningSecret, TokenConfig, TokenInvalid, TokenService};
use vocare_kernel_contracts::{IdentifiedArea, PhoneKeyResolver, UnixTimeMs};
use vocare_os::config::{CreationPolicy, PersistenceMode, ServiceConfig};
use vocare_os::reconcile::{ReconcileRejection, SubmissionInput};
use vocare_os::service::{
    IdentityService, LoginError, LoginInput, LoginStatus, SecretOrigin, SubmitError,
};
use vocare_storage::json_file::JsonFileResultStore;
use vocare_storage::memory::InMemoryResultStore;
use vocare_storage::repo::{
    ResultStore, RosterRow, COL_COURSE, COL_EMAIL, COL_NAME, COL_PHONE,
};

const T0: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

fn resolver() -> Arc<dyn PhoneKeyResolver> {
    Arc::new(PhoneNormalizer::default())
}

fn service_over(store: Arc<dyn ResultStore>, persistence: PersistenceMode) -> IdentityService {
    let svc = IdentityService::new(
        persistence,
        CreationPolicy::OnSubmission,
        PhoneNormalizer::default(),
        TokenService::new(
            TokenConfig::mvp_v1(),
            &SigningSecret::new(b"integration-test-secret-0123456789".to_vec()).unwrap(),
        ),
        store,
    );
    svc.reload_roster(T0).unwrap();
    svc
}

fn login(name: &str, phone: &str, email: Option<&str>) -> LoginInput {
    LoginInput {
        name: name.to_string(),
        phone: phone.to_string(),
        email: email.map(str::to_string),
    }
}

fn submission(name: &str, phone: &str, email: Option<&str>) -> SubmissionInput {
    SubmissionInput {
        name: name.to_string(),
        phone: phone.to_string(),
        email: email.map(str::to_string),
        identified_area: IdentifiedArea::new("Linguistica").unwrap(),
    }
}

fn ana_without_email() -> RosterRow {
    RosterRow::new()
        .with(COL_PHONE, "5511912345678")
        .with(COL_NAME, "Ana")
        .with(COL_EMAIL, "")
        .with(COL_COURSE, "")
}

#[test]
fn at_flow_01_new_phone_gets_token_and_no_course() {
    let store = Arc::new(InMemoryResultStore::new(resolver()));
    let svc = service_over(store, PersistenceMode::Buffered);
    let out = svc
        .login(&login("Ana", "+55 11 91234-5678", None), T0)
        .unwrap();
    assert_eq!(out.status, LoginStatus::NewIdentity);
    assert_eq!(out.course, None);
    assert_eq!(out.phone_key.as_str(), "5511912345678");
    assert!(!out.token.token.is_empty());
}

#[test]
fn at_flow_02_roster_name_match_ignores_case() {
    let store = Arc::new(InMemoryResultStore::with_rows(
        resolver(),
        vec![ana_without_email()],
    ));
    let svc = service_over(store, PersistenceMode::Buffered);

    let ok = svc.login(&login("ana", "5511912345678", None), T0).unwrap();
    assert_eq!(ok.status, LoginStatus::Returning);

    let err = svc.login(&login("Bruno", "5511912345678", None), T0).unwrap_err();
    assert_eq!(err, LoginError::Conflict(IdentityConflict::NameMismatch));
}

#[test]
fn at_flow_03_phone_mismatch_writes_nothing() {
    let store = Arc::new(InMemoryResultStore::with_rows(
        resolver(),
        vec![ana_without_email()],
    ));
    let svc = service_over(store.clone(), PersistenceMode::Direct);
    let token = svc
        .login(&login("Ana", "5511912345678", None), T0)
        .unwrap()
        .token
        .token;

    let err = svc
        .submit(&token, &submission("Ana", "5511999999999", None), T0)
        .unwrap_err();
    assert_eq!(err, SubmitError::Rejected(ReconcileRejection::PhoneMismatch));
    assert_eq!(store.write_count(), 0);
    assert!(svc.pending().is_empty());
}

#[test]
fn at_flow_04_new_email_bound_elsewhere_is_a_conflict() {
    let bruno = RosterRow::new()
        .with(COL_PHONE, "5521998765432")
        .with(COL_NAME, "Bruno")
        .with(COL_EMAIL, "bruno@mail.com");
    let store = Arc::new(InMemoryResultStore::with_rows(resolver(), vec![bruno]));
    let svc = service_over(store, PersistenceMode::Buffered);

    let err = svc
        .login(&login("Carla", "5531987654321", Some("Bruno@Mail.com")), T0)
        .unwrap_err();
    assert_eq!(
        err,
        LoginError::Conflict(IdentityConflict::EmailAlreadyBound)
    );
}

#[test]
fn at_flow_05_token_expires_at_ttl_and_not_before() {
    let store = Arc::new(InMemoryResultStore::new(resolver()));
    let svc = service_over(store, PersistenceMode::Buffered);
    let signed = svc
        .login(&login("Ana", "5511912345678", None), T0)
        .unwrap()
        .token;

    let before = UnixTimeMs(signed.expires_at.0 - 1);
    assert!(svc.access_check(&signed.token, before).is_ok());
    let err = svc
        .submit(&signed.token, &submission("Ana", "5511912345678", None), signed.expires_at)
        .unwrap_err();
    assert_eq!(
        err,
        SubmitError::Rejected(ReconcileRejection::Token(TokenInvalid::Expired))
    );
}

#[test]
fn at_flow_06_direct_mode_over_json_file_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roster.json");
    let store: Arc<dyn ResultStore> = Arc::new(JsonFileResultStore::open(&path, resolver()));

    let svc = service_over(store.clone(), PersistenceMode::Direct);
    let token = svc
        .login(&login("Ana", "11 91234-5678", Some("ana@mail.com")), T0)
        .unwrap()
        .token
        .token;
    svc.submit(
        &token,
        &submission("Ana", "11 91234-5678", Some("ana@mail.com")),
        T0,
    )
    .unwrap();

    // A fresh process over the same file sees the recorded course.
    let restarted = service_over(store, PersistenceMode::Direct);
    let again = restarted
        .login(&login("ANA", "(11) 91234-5678", Some("ana@mail.com")), T0)
        .unwrap();
    assert_eq!(again.status, LoginStatus::Returning);
    assert_eq!(again.course.as_deref(), Some("LINGUISTICA"));
}

#[test]
fn at_flow_07_buffered_flush_and_collect_split_the_queue() {
    let store = Arc::new(InMemoryResultStore::with_rows(
        resolver(),
        vec![ana_without_email()],
    ));
    let svc = service_over(store.clone(), PersistenceMode::Buffered);
    let token = svc
        .login(&login("Ana", "5511912345678", None), T0)
        .unwrap()
        .token
        .token;
    svc.submit(&token, &submission("Ana", "5511912345678", None), T0)
        .unwrap();

    let metrics = svc.flush_pending_pass();
    assert_eq!(metrics.written, 1);
    assert_eq!(store.write_count(), 1);
    assert_eq!(svc.collect_pending().count, 0);

    svc.submit(&token, &submission("Ana", "5511912345678", None), UnixTimeMs(T0.0 + 1))
        .unwrap();
    let collected = svc.collect_pending();
    assert_eq!(collected.count, 1);
    assert_eq!(svc.flush_pending_pass().drained, 0);
}

#[test]
fn at_flow_08_from_config_without_secret_is_ephemeral() {
    let mut config = ServiceConfig::mvp_v1();
    config.token_secret = None;
    let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new(resolver()));
    let (svc, origin) = IdentityService::from_config(&config, store).unwrap();
    assert_eq!(origin, SecretOrigin::Ephemeral);
    assert_eq!(svc.status().persistence, PersistenceMode::Buffered);
    assert_eq!(svc.status().creation, CreationPolicy::OnSubmission);
}
