//! Session persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::config::{SessionSettings, StoreKind};
use crate::error::{FleetError, Result};

/// Session store failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid session id '{0}'")]
    InvalidId(String),

    #[error("session store lock poisoned")]
    Poisoned,
}

/// Persisted state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Authenticated user, set by a successful login.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(ttl: Duration) -> Self {
        let mut record = Self {
            user: None,
            data: Map::new(),
            expires_at: Utc::now(),
        };
        record.touch(ttl);
        record
    }

    /// Push the expiry `ttl` into the future.
    pub fn touch(&mut self, ttl: Duration) {
        let now = Utc::now();
        let far = chrono::Duration::days(3650);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(far);
        self.expires_at = now.checked_add_signed(ttl).unwrap_or(now + far);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Backend that loads and saves sessions by id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns `None` for unknown or expired sessions.
    async fn load(&self, id: &str) -> std::result::Result<Option<SessionRecord>, SessionError>;

    async fn save(&self, id: &str, record: &SessionRecord) -> std::result::Result<(), SessionError>;

    async fn destroy(&self, id: &str) -> std::result::Result<(), SessionError>;

    /// Drop every expired session. Returns how many were removed.
    async fn purge_expired(&self) -> std::result::Result<usize, SessionError>;
}

/// How often a worker sweeps expired sessions out of its store.
pub const REAP_INTERVAL: Duration = Duration::from_secs(600);

/// Periodically purge expired sessions from `store`.
pub fn start_reaper(store: Arc<dyn SessionStore>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Purged expired sessions"),
                Err(e) => tracing::error!(error = %e, "Failed to purge expired sessions"),
            }
        }
    })
}

/// Sessions held in this process only.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, id: &str) -> std::result::Result<Option<SessionRecord>, SessionError> {
        let mut sessions = self.sessions.lock().map_err(|_| SessionError::Poisoned)?;
        match sessions.get(id) {
            Some(record) if record.is_expired(Utc::now()) => {
                sessions.remove(id);
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn save(&self, id: &str, record: &SessionRecord) -> std::result::Result<(), SessionError> {
        let mut sessions = self.sessions.lock().map_err(|_| SessionError::Poisoned)?;
        let now = Utc::now();
        sessions.retain(|_, r| !r.is_expired(now));
        sessions.insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn destroy(&self, id: &str) -> std::result::Result<(), SessionError> {
        let mut sessions = self.sessions.lock().map_err(|_| SessionError::Poisoned)?;
        sessions.remove(id);
        Ok(())
    }

    async fn purge_expired(&self) -> std::result::Result<usize, SessionError> {
        let mut sessions = self.sessions.lock().map_err(|_| SessionError::Poisoned)?;
        let before = sessions.len();
        let now = Utc::now();
        sessions.retain(|_, r| !r.is_expired(now));
        Ok(before - sessions.len())
    }
}

/// One JSON file per session, shared by every worker on the host.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// concurrent reader sees either the old record or the new one.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> std::result::Result<PathBuf, SessionError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SessionError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn load(&self, id: &str) -> std::result::Result<Option<SessionRecord>, SessionError> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: SessionRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable session file");
                return Ok(None);
            }
        };

        if record.is_expired(Utc::now()) {
            self.destroy(id).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn save(&self, id: &str, record: &SessionRecord) -> std::result::Result<(), SessionError> {
        let path = self.path_for(id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec(record)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn destroy(&self, id: &str) -> std::result::Result<(), SessionError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_expired(&self) -> std::result::Result<usize, SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            // Another worker may have removed or rewritten it meanwhile
            let Ok(bytes) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            let expired = serde_json::from_slice::<SessionRecord>(&bytes)
                .map(|record| record.is_expired(now))
                .unwrap_or(false);
            if expired && self.path_for(id).is_ok() {
                self.destroy(id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Build the store the session settings ask for.
pub fn build_store(settings: &SessionSettings) -> Result<Arc<dyn SessionStore>> {
    match settings.store {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::File => {
            let dir = settings.dir.clone().ok_or_else(|| {
                FleetError::Config("session.dir is required for the file session store".into())
            })?;
            std::fs::create_dir_all(&dir)?;
            Ok(Arc::new(FileStore::new(dir)))
        }
    }
}
