use std::{
    collections::HashMap,
    fmt,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{Mutex, RwLock},
    time::timeout,
};
use tracing::debug;

pub(crate) const DEFAULT_ROLE: &str = "user";

/// Token material for one user, keyed by email.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CredentialRecord {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub role: String,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("email", &self.email)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_expiry", &self.token_expiry)
            .field("role", &self.role)
            .finish()
    }
}

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("credential store {operation} timed out")]
    Timeout { operation: &'static str },

    #[error("credential store io error: {0}")]
    Io(#[from] io::Error),

    #[error("credential store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Key-value persistence for credential records. Upserts on distinct keys must
/// not interfere with each other.
#[async_trait]
pub(crate) trait CredentialStore: Send + Sync {
    async fn get(&self, email: &str) -> Result<Option<CredentialRecord>, StoreError>;

    async fn upsert(&self, record: &CredentialRecord) -> Result<(), StoreError>;
}

/// Bounds every store call with a fixed timeout.
#[derive(Clone)]
pub(crate) struct Credentials {
    store: Arc<dyn CredentialStore>,
    timeout: Duration,
}

impl Credentials {
    pub(crate) fn new(store: Arc<dyn CredentialStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub(crate) async fn get(&self, email: &str) -> Result<Option<CredentialRecord>, StoreError> {
        timeout(self.timeout, self.store.get(email))
            .await
            .map_err(|_| StoreError::Timeout { operation: "get" })?
    }

    pub(crate) async fn upsert(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        timeout(self.timeout, self.store.upsert(record))
            .await
            .map_err(|_| StoreError::Timeout {
                operation: "upsert",
            })?
    }
}

#[derive(Default)]
pub(crate) struct MemoryCredentialStore {
    records: RwLock<HashMap<String, CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, email: &str) -> Result<Option<CredentialRecord>, StoreError> {
        Ok(self.records.read().await.get(email).cloned())
    }

    async fn upsert(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.email.clone(), record.clone());
        Ok(())
    }
}

/// JSON file holding every record as a map keyed by email.
///
/// Writes go to a sibling temp file that is renamed over the original, so a
/// crash mid-write leaves the previous contents intact.
pub(crate) struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<HashMap<String, CredentialRecord>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, email: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let mut records = self.load().await?;
        Ok(records.remove(email))
    }

    async fn upsert(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.load().await?;
        let inserted = records
            .insert(record.email.clone(), record.clone())
            .is_none();

        let bytes = serde_json::to_vec_pretty(&records)?;
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            email = %record.email,
            inserted,
            path = %self.path.display(),
            "credential record saved"
        );
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
