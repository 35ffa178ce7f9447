#![forbid(unsafe_code)]

use std::fs;
use std::sync::Arc;

use vocare_engines::phone::PhoneNormalizer;
use vocare_kernel_contracts::{
    Identity, IdentityFields, PhoneKey, PhoneKeyResolver, RosterLookup, UnixTimeMs,
};
use vocare_storage::json_file::JsonFileResultStore;
use vocare_storage::repo::{upsert_identity, ResultStore, StoreError, COL_COURSE, COL_NAME};
use vocare_storage::roster_cache::RosterCache;

fn resolver() -> Arc<dyn PhoneKeyResolver> {
    Arc::new(PhoneNormalizer::default())
}

fn key(digits: &str) -> PhoneKey {
    PhoneKey::new(digits).unwrap()
}

#[test]
fn at_json_store_01_missing_file_is_empty_roster() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileResultStore::open(dir.path().join("roster.json"), resolver());
    assert!(store.fetch_roster().unwrap().is_empty());
    assert_eq!(store.find_by_key(&key("5511912345678")).unwrap(), None);
}

#[test]
fn at_json_store_02_writes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("roster.json");
    let ana = Identity::v1(key("5511912345678"), "Ana", None, None).unwrap();
    {
        let store = JsonFileResultStore::open(&path, resolver());
        store.insert(&ana).unwrap();
        store
            .update(
                &ana.phone_key,
                &IdentityFields {
                    name: "Ana".to_string(),
                    email: Some("ana@mail.com".to_string()),
                    course_result: Some("NATURALISTA".to_string()),
                },
            )
            .unwrap();
    }
    assert!(!path.with_extension("json.tmp").exists());

    let reopened = JsonFileResultStore::open(&path, resolver());
    let row = reopened.find_by_key(&ana.phone_key).unwrap().unwrap();
    assert_eq!(row.get(COL_NAME), Some("Ana"));
    assert_eq!(row.get(COL_COURSE), Some("NATURALISTA"));

    let cache = RosterCache::new(resolver());
    cache.load(&reopened, UnixTimeMs(5), |_| Vec::new()).unwrap();
    let cached = cache.find_by_email("ana@mail.com").unwrap().unwrap();
    assert_eq!(cached.phone_key, ana.phone_key);
}

#[test]
fn at_json_store_03_hand_edited_rows_with_raw_phones_are_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roster.json");
    fs::write(
        &path,
        r#"{"schema_version":1,"rows":[{"Nome":"Bruno","Telefone":"021 99876-5432","Email":"","Curso_Realizado":""}]}"#,
    )
    .unwrap();
    let store = JsonFileResultStore::open(&path, resolver());

    let bruno = Identity::v1(key("5521998765432"), "Bruno", None, Some("MUSICAL")).unwrap();
    upsert_identity(&store, &bruno.phone_key, |row| {
        assert!(row.is_some());
        Ok::<_, StoreError>(bruno.clone())
    })
    .unwrap();

    let rows = store.fetch_roster().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get(COL_COURSE), Some("MUSICAL"));
}

#[test]
fn at_json_store_04_corrupt_or_foreign_schema_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roster.json");

    fs::write(&path, b"{not json").unwrap();
    let store = JsonFileResultStore::open(&path, resolver());
    assert!(matches!(store.fetch_roster(), Err(StoreError::Malformed(_))));

    fs::write(&path, br#"{"schema_version":99,"rows":[]}"#).unwrap();
    assert!(matches!(store.fetch_roster(), Err(StoreError::Malformed(_))));

    let cache = RosterCache::new(resolver());
    assert!(cache.load(&store, UnixTimeMs(1), |_| Vec::new()).is_err());
    assert!(cache.find_by_phone(&key("5511912345678")).is_err());
}
