#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use vocare_kernel_contracts::{
    ContractViolation, Identity, IdentityFields, PhoneKey, PhoneKeyResolver,
};

pub const COL_PHONE: &str = "TELEFONE";
pub const COL_NAME: &str = "NOME";
pub const COL_EMAIL: &str = "EMAIL";
pub const COL_COURSE: &str = "CURSO_REALIZADO";

pub const ROSTER_COLUMNS: [&str; 4] = [COL_NAME, COL_PHONE, COL_EMAIL, COL_COURSE];

/// One row as the external store hands it over: column name to cell text.
///
/// Column lookups ignore ASCII case. Nothing past `RosterCache` sees this type;
/// it is turned into an `Identity` with [`RosterRow::to_identity`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RosterRow {
    cells: BTreeMap<String, String>,
}

impl RosterRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: &str) -> Self {
        self.set(column, value);
        self
    }

    pub fn from_identity(identity: &Identity) -> Self {
        let mut row = Self::new();
        row.set(COL_PHONE, identity.phone_key.as_str());
        row.apply(&IdentityFields::from(identity));
        row
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(column))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the cell under any existing spelling of `column`.
    pub fn set(&mut self, column: &str, value: &str) {
        self.cells
            .retain(|k, _| !k.trim().eq_ignore_ascii_case(column));
        self.cells.insert(column.to_string(), value.to_string());
    }

    pub fn apply(&mut self, fields: &IdentityFields) {
        self.set(COL_NAME, &fields.name);
        self.set(COL_EMAIL, fields.email.as_deref().unwrap_or(""));
        self.set(COL_COURSE, fields.course_result.as_deref().unwrap_or(""));
    }

    pub fn phone_key(&self, resolver: &dyn PhoneKeyResolver) -> Option<PhoneKey> {
        self.get(COL_PHONE).and_then(|raw| resolver.phone_key(raw))
    }

    pub fn to_identity(&self, resolver: &dyn PhoneKeyResolver) -> Result<Identity, RowRejection> {
        let raw_phone = self
            .get(COL_PHONE)
            .filter(|p| !p.trim().is_empty())
            .ok_or(RowRejection::MissingPhone)?;
        let key = resolver
            .phone_key(raw_phone)
            .ok_or(RowRejection::UnresolvablePhone)?;
        let name = self.get(COL_NAME).unwrap_or("");
        Identity::v1(key, name, self.get(COL_EMAIL), self.get(COL_COURSE))
            .map_err(RowRejection::Invalid)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RowRejection {
    #[error("row has no phone cell")]
    MissingPhone,
    #[error("row phone is not an acceptable number")]
    UnresolvablePhone,
    #[error("row fails validation: {0}")]
    Invalid(ContractViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store rejected write: {0}")]
    Rejected(String),
    #[error("store data malformed: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "STORE_UNAVAILABLE",
            Self::Rejected(_) => "STORE_REJECTED",
            Self::Malformed(_) => "STORE_MALFORMED",
        }
    }
}

/// Durable row store behind the roster. Slow, possibly remote, never retried
/// by the caller. Implementations take `&self` and guard their own state.
pub trait ResultStore: Send + Sync {
    fn fetch_roster(&self) -> Result<Vec<RosterRow>, StoreError>;
    fn find_by_key(&self, key: &PhoneKey) -> Result<Option<RosterRow>, StoreError>;
    fn insert(&self, identity: &Identity) -> Result<(), StoreError>;
    fn update(&self, key: &PhoneKey, fields: &IdentityFields) -> Result<(), StoreError>;
}

/// Reads the row stored for `key`, lets `merge` build the identity to keep,
/// then updates that row or inserts a new one.
///
/// Nothing is written when `merge` fails.
pub fn upsert_identity<E>(
    store: &dyn ResultStore,
    key: &PhoneKey,
    merge: impl FnOnce(Option<RosterRow>) -> Result<Identity, E>,
) -> Result<Identity, E>
where
    E: From<StoreError>,
{
    let existing = store.find_by_key(key)?;
    let had_row = existing.is_some();
    let identity = merge(existing)?;
    if had_row {
        store.update(key, &IdentityFields::from(&identity))?;
    } else {
        store.insert(&identity)?;
    }
    Ok(identity)
}
