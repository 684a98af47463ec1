use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid credential path: {0}")]
    InvalidPath(String),
}

/// Seconds before expiry at which background refresh should kick in.
pub const PROACTIVE_REFRESH_BUFFER_SECS: i64 = 600;
/// Seconds before expiry at which the token stops being handed to callers.
pub const SAFETY_BUFFER_SECS: i64 = 300;

/// The persisted authentication state: token pair, expiry and the identity
/// fields stored alongside them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry of the access token.
    pub expires_at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub user_phone: Option<String>,
    pub user_role: Option<String>,
}

impl Credentials {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in_seconds: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: Utc::now() + Duration::seconds(expires_in_seconds),
            user_id: None,
            user_phone: None,
            user_role: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// True inside the proactive-refresh window: the token is still nominally
    /// valid but a silent background refresh should run before callers are
    /// blocked on an expired token.
    pub fn needs_proactive_refresh_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at - Duration::seconds(PROACTIVE_REFRESH_BUFFER_SECS)
    }

    /// True while the token can still be handed out for a request with enough
    /// margin (safety buffer) that it will not expire mid-flight.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::seconds(SAFETY_BUFFER_SECS)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn needs_proactive_refresh(&self) -> bool {
        self.needs_proactive_refresh_at(Utc::now())
    }

    pub fn is_usable(&self) -> bool {
        self.is_usable_at(Utc::now())
    }
}

/// Persistent credential storage seam.
///
/// The production mobile client backs this with the OS keystore; that
/// implementation is an external collaborator. The crate ships a file-backed
/// store for the CLI and an in-memory store for tests.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credentials>, CredentialError>;
    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError>;
    async fn clear(&self) -> Result<(), CredentialError>;
}

/// JSON file store under `~/.haulsync/credentials.json`.
///
/// Writes go through a temp file + rename so a reader never observes a
/// half-written record.
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    pub fn new() -> Result<Self, CredentialError> {
        let mut dir = dirs::home_dir()
            .ok_or_else(|| CredentialError::InvalidPath("no home directory".to_string()))?;
        dir.push(".haulsync");
        std::fs::create_dir_all(&dir)?;
        dir.push("credentials.json");
        Ok(Self::with_path(dir))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let credentials = serde_json::from_str(&data)?;
        Ok(Some(credentials))
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        let _guard = self.write_lock.lock().await;

        let data = serde_json::to_string_pretty(credentials)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp_path, &self.path).await?;

        tracing::debug!(path = %self.path.display(), "Credentials persisted");
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        let _guard = self.write_lock.lock().await;
        if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }
        tracing::info!("Credentials cleared");
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        *self.inner.lock().await = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        *self.inner.lock().await = None;
        Ok(())
    }
}
