#![forbid(unsafe_code)]

use std::sync::Arc;

use vocare_engines::phone::PhoneNormalizer;
use vocare_kernel_contracts::{
    Identity, IdentityFields, PhoneKey, PhoneKeyResolver, RosterLookup, UnixTimeMs,
};
use vocare_storage::memory::InMemoryResultStore;
use vocare_storage::repo::{
    upsert_identity, ResultStore, RosterRow, StoreError, COL_COURSE, COL_EMAIL, COL_NAME,
    COL_PHONE,
};
use vocare_storage::roster_cache::{RosterCache, RosterStateKind};

fn resolver() -> Arc<dyn PhoneKeyResolver> {
    Arc::new(PhoneNormalizer::default())
}

fn key(digits: &str) -> PhoneKey {
    PhoneKey::new(digits).unwrap()
}

fn seeded_store() -> InMemoryResultStore {
    InMemoryResultStore::with_rows(
        resolver(),
        vec![
            RosterRow::new()
                .with(COL_NAME, "Ana")
                .with(COL_PHONE, "(11) 91234-5678")
                .with(COL_EMAIL, "")
                .with(COL_COURSE, ""),
            RosterRow::new()
                .with("nome", "Bruno")
                .with("telefone", "+55 21 99876-5432")
                .with("email", "BRUNO@mail.com")
                .with("curso_realizado", "linguistica"),
            // Landline: never a valid identity key.
            RosterRow::new()
                .with(COL_NAME, "Escritório")
                .with(COL_PHONE, "(11) 3456-7890"),
        ],
    )
}

#[test]
fn at_roster_db_01_raw_sheet_phones_resolve_to_canonical_keys() {
    let store = seeded_store();
    let cache = RosterCache::new(resolver());
    let report = cache.load(&store, UnixTimeMs(1_000), |_| Vec::new()).unwrap();
    assert_eq!(report.identities, 2);
    assert_eq!(report.skipped_rows, 1);

    let ana = cache.find_by_phone(&key("5511912345678")).unwrap().unwrap();
    assert_eq!(ana.email, None);
    assert!(!ana.has_course_result());

    let bruno = cache.find_by_email("bruno@mail.com").unwrap().unwrap();
    assert_eq!(bruno.phone_key, key("5521998765432"));
    assert_eq!(bruno.course_result.as_deref(), Some("LINGUISTICA"));
}

#[test]
fn at_roster_db_02_store_lookup_uses_canonical_key() {
    let store = seeded_store();
    let row = store.find_by_key(&key("5511912345678")).unwrap().unwrap();
    assert_eq!(row.get(COL_NAME), Some("Ana"));
    assert_eq!(store.find_by_key(&key("5511900000000")).unwrap(), None);
}

#[test]
fn at_roster_db_03_upsert_updates_existing_and_inserts_new() {
    let store = seeded_store();

    let ana = Identity::v1(key("5511912345678"), "Ana", Some("ana@mail.com"), Some("MUSICAL"))
        .unwrap();
    let written = upsert_identity(&store, &ana.phone_key, |row| {
        let row = row.expect("seeded row");
        assert_eq!(row.get(COL_NAME), Some("Ana"));
        Ok::<_, StoreError>(ana.clone())
    })
    .unwrap();
    assert_eq!(written, ana);
    let row = store.find_by_key(&ana.phone_key).unwrap().unwrap();
    assert_eq!(row.get(COL_EMAIL), Some("ana@mail.com"));
    assert_eq!(row.get(COL_COURSE), Some("MUSICAL"));
    assert_eq!(row.get(COL_PHONE), Some("(11) 91234-5678"));

    let carla = Identity::v1(key("5531987654321"), "Carla", None, Some("ESPACIAL")).unwrap();
    upsert_identity(&store, &carla.phone_key, |row| {
        assert!(row.is_none());
        Ok::<_, StoreError>(carla.clone())
    })
    .unwrap();
    assert_eq!(store.rows().len(), 4);
    assert_eq!(store.write_count(), 2);

    let cache = RosterCache::new(resolver());
    cache.load(&store, UnixTimeMs(2_000), |_| Vec::new()).unwrap();
    assert_eq!(cache.find_by_phone(&carla.phone_key).unwrap(), Some(carla));
    assert_eq!(cache.find_by_phone(&ana.phone_key).unwrap(), Some(ana));
}

#[test]
fn at_roster_db_06_failed_merge_writes_nothing() {
    let store = seeded_store();
    let err = upsert_identity(&store, &key("5511912345678"), |_| {
        Err(StoreError::Malformed("unusable row".to_string()))
    })
    .unwrap_err();
    assert_eq!(err.code(), "STORE_MALFORMED");
    assert_eq!(store.write_count(), 0);

    store.set_offline(true);
    let err = upsert_identity(&store, &key("5511912345678"), |_| -> Result<Identity, StoreError> {
        panic!("merge must not run when the store is down")
    })
    .unwrap_err();
    assert_eq!(err.code(), "STORE_UNAVAILABLE");
}

#[test]
fn at_roster_db_04_write_contract_rejects_duplicates_and_missing_rows() {
    let store = seeded_store();
    let ana = Identity::v1(key("5511912345678"), "Ana", None, None).unwrap();
    assert!(matches!(store.insert(&ana), Err(StoreError::Rejected(_))));

    let fields = IdentityFields {
        name: "Nobody".to_string(),
        email: None,
        course_result: None,
    };
    assert!(matches!(
        store.update(&key("5511900000000"), &fields),
        Err(StoreError::Rejected(_))
    ));
    assert_eq!(store.write_count(), 0);
}

#[test]
fn at_roster_db_05_offline_store_makes_cache_unavailable() {
    let store = seeded_store();
    store.set_offline(true);
    let cache = RosterCache::new(resolver());
    let err = cache.load(&store, UnixTimeMs(1), |_| Vec::new()).unwrap_err();
    assert_eq!(err.code(), "STORE_UNAVAILABLE");
    assert_eq!(cache.status().state, RosterStateKind::Unavailable);
    assert!(cache.find_by_phone(&key("5511912345678")).is_err());

    store.set_offline(false);
    cache.load(&store, UnixTimeMs(2), |_| Vec::new()).unwrap();
    assert_eq!(cache.status().state, RosterStateKind::Ready);
}
