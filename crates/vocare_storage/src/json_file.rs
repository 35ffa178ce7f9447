#![forbid(unsafe_code)]

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use vocare_kernel_contracts::identity::IDENTITY_CONTRACT_VERSION;
use vocare_kernel_contracts::{Identity, IdentityFields, PhoneKey, PhoneKeyResolver};

use crate::repo::{ResultStore, RosterRow, StoreError};

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct RosterFile {
    schema_version: u32,
    rows: Vec<RosterRow>,
}

/// Roster rows kept in one JSON document on disk.
///
/// A missing file reads as an empty roster and is created on the first write.
/// Every write rewrites the whole file through a temp file and rename.
pub struct JsonFileResultStore {
    path: PathBuf,
    resolver: Arc<dyn PhoneKeyResolver>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for JsonFileResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonFileResultStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JsonFileResultStore {
    pub fn open(path: impl Into<PathBuf>, resolver: Arc<dyn PhoneKeyResolver>) -> Self {
        Self {
            path: path.into(),
            resolver,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<RosterFile, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(RosterFile {
                    schema_version: IDENTITY_CONTRACT_VERSION.0,
                    rows: Vec::new(),
                })
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let file: RosterFile = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Malformed(format!("{}: {e}", self.path.display())))?;
        if file.schema_version != IDENTITY_CONTRACT_VERSION.0 {
            return Err(StoreError::Malformed(format!(
                "{}: unsupported schema_version {}",
                self.path.display(),
                file.schema_version
            )));
        }
        Ok(file)
    }

    fn write_file(&self, file: &RosterFile) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(file)
            .map_err(|e| StoreError::Malformed(format!("encode roster: {e}")))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        atomic_write(&self.path, &data)
            .map_err(|e| StoreError::Unavailable(format!("write {}: {e}", self.path.display())))
    }

    fn position(&self, rows: &[RosterRow], key: &PhoneKey) -> Option<usize> {
        rows.iter()
            .position(|row| row.phone_key(self.resolver.as_ref()).as_ref() == Some(key))
    }
}

impl ResultStore for JsonFileResultStore {
    fn fetch_roster(&self) -> Result<Vec<RosterRow>, StoreError> {
        Ok(self.read_file()?.rows)
    }

    fn find_by_key(&self, key: &PhoneKey) -> Result<Option<RosterRow>, StoreError> {
        let file = self.read_file()?;
        Ok(self.position(&file.rows, key).map(|i| file.rows[i].clone()))
    }

    fn insert(&self, identity: &Identity) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut file = self.read_file()?;
        if self.position(&file.rows, &identity.phone_key).is_some() {
            return Err(StoreError::Rejected(format!(
                "row for {} already exists",
                identity.phone_key
            )));
        }
        file.rows.push(RosterRow::from_identity(identity));
        self.write_file(&file)
    }

    fn update(&self, key: &PhoneKey, fields: &IdentityFields) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut file = self.read_file()?;
        let Some(i) = self.position(&file.rows, key) else {
            return Err(StoreError::Rejected(format!("no row for {key}")));
        };
        file.rows[i].apply(fields);
        self.write_file(&file)
    }
}

/// `$XDG_DATA_HOME/vocare/roster.json`, falling back to `~/.local/share`.
pub fn default_store_path() -> PathBuf {
    if let Ok(xdg_data_home) = env::var("XDG_DATA_HOME") {
        if !xdg_data_home.trim().is_empty() {
            return PathBuf::from(xdg_data_home).join("vocare").join("roster.json");
        }
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("vocare")
            .join("roster.json");
    }
    PathBuf::from(".vocare").join("roster.json")
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)
}
