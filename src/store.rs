//! Definition stores
//!
//! A [`DefinitionStore`] persists tunnel definitions. `list()` always reads
//! the backing store; nothing here caches records, because every reload
//! decision must see the persisted set.

use crate::files;
use crate::remote::{CoordinationClient, RemoteError};
use crate::session::{Session, SessionCache};
use crate::tunnel::{TunnelDefinition, TunnelRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("tunnel file {}: {message}", path.display())]
    File { path: PathBuf, message: String },

    #[error("tunnel {0} not found")]
    NotFound(i64),
}

impl StoreError {
    fn file(path: &Path, message: impl std::fmt::Display) -> Self {
        StoreError::File {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// A record `bulk_import` did not create
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFailure {
    pub name: String,
    pub error: String,
}

/// Partial-success result of `bulk_import`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub created: Vec<String>,
    pub failed: Vec<ImportFailure>,
}

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Short name for logs
    fn kind(&self) -> &'static str;

    /// The persisted tunnel set, in store order
    async fn list(&self) -> Result<Vec<TunnelRecord>, StoreError>;

    async fn create(&self, definition: TunnelDefinition) -> Result<TunnelRecord, StoreError>;

    async fn update(&self, id: i64, definition: TunnelDefinition)
        -> Result<TunnelRecord, StoreError>;

    async fn delete(&self, id: i64) -> Result<(), StoreError>;

    /// Record whether a tunnel is being served
    async fn set_active(&self, _id: i64, _active: bool) -> Result<(), StoreError> {
        Ok(())
    }

    /// Create each definition independently.
    ///
    /// Invalid records and names that already exist (in the store or earlier
    /// in the batch) are reported in `failed`; the rest are still created.
    /// Only a lost session aborts the batch.
    async fn bulk_import(
        &self,
        definitions: Vec<TunnelDefinition>,
    ) -> Result<ImportReport, StoreError> {
        let mut seen: HashSet<String> = self
            .list()
            .await?
            .into_iter()
            .map(|record| record.definition.name)
            .collect();
        let mut report = ImportReport::default();

        for definition in definitions {
            let definition = definition.normalized();
            let name = definition.name.clone();

            if let Err(e) = definition.validate() {
                report.failed.push(ImportFailure {
                    name,
                    error: e.to_string(),
                });
                continue;
            }
            if seen.contains(&name) {
                report.failed.push(ImportFailure {
                    name,
                    error: "duplicate".to_string(),
                });
                continue;
            }

            match self.create(definition).await {
                Ok(_) => {
                    seen.insert(name.clone());
                    report.created.push(name);
                }
                Err(StoreError::Remote(e)) if e.is_auth_failure() => {
                    return Err(StoreError::Remote(e));
                }
                Err(e) => {
                    warn!(tunnel = %name, error = %e, "Import of tunnel failed");
                    report.failed.push(ImportFailure {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            created = report.created.len(),
            failed = report.failed.len(),
            store = self.kind(),
            "Bulk import finished"
        );
        Ok(report)
    }
}

/// Tunnels kept by the coordination service, accessed with the cached session
pub struct RemoteStore {
    client: Arc<CoordinationClient>,
    sessions: Arc<SessionCache>,
}

impl RemoteStore {
    pub fn new(client: Arc<CoordinationClient>, sessions: Arc<SessionCache>) -> Self {
        Self { client, sessions }
    }

    fn session(&self) -> Result<Session, StoreError> {
        self.sessions
            .current()
            .ok_or(StoreError::Remote(RemoteError::NotAuthenticated))
    }

    /// A 401 means the cached session is dead; forget it
    fn settle<T>(&self, result: Result<T, RemoteError>) -> Result<T, StoreError> {
        result.map_err(|e| {
            if matches!(e, RemoteError::SessionExpired) {
                info!("Access token expired, clearing credentials");
                self.sessions.clear();
            }
            StoreError::Remote(e)
        })
    }
}

#[async_trait]
impl DefinitionStore for RemoteStore {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn list(&self) -> Result<Vec<TunnelRecord>, StoreError> {
        let session = self.session()?;
        self.settle(self.client.list_tunnels(&session).await)
    }

    async fn create(&self, definition: TunnelDefinition) -> Result<TunnelRecord, StoreError> {
        let session = self.session()?;
        self.settle(self.client.create_tunnel(&session, &definition).await)
    }

    async fn update(
        &self,
        id: i64,
        definition: TunnelDefinition,
    ) -> Result<TunnelRecord, StoreError> {
        let session = self.session()?;
        match self.settle(self.client.update_tunnel(&session, id, &definition).await) {
            Err(StoreError::Remote(RemoteError::NotFound(id))) => Err(StoreError::NotFound(id)),
            other => other,
        }
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let session = self.session()?;
        match self.settle(self.client.delete_tunnel(&session, id).await) {
            Err(StoreError::Remote(RemoteError::NotFound(id))) => Err(StoreError::NotFound(id)),
            other => other,
        }
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let session = self.session()?;
        self.settle(self.client.set_active(&session, id, active).await)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelFile {
    #[serde(default)]
    tunnels: Vec<TunnelRecord>,
}

/// Tunnels kept in a local TOML file of `[[tunnels]]` tables
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<TunnelFile, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TunnelFile::default()),
            Err(e) => return Err(StoreError::file(&self.path, e)),
        };
        toml::from_str(&content).map_err(|e| StoreError::file(&self.path, e))
    }

    async fn write(&self, file: &TunnelFile) -> Result<(), StoreError> {
        let content = toml::to_string(file).map_err(|e| StoreError::file(&self.path, e))?;
        files::write_private_async(self.path.clone(), content.into_bytes())
            .await
            .map_err(|e| StoreError::file(&self.path, e))?;
        debug!(path = %self.path.display(), count = file.tunnels.len(), "Wrote tunnel file");
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for FileStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn list(&self) -> Result<Vec<TunnelRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.tunnels)
    }

    async fn create(&self, definition: TunnelDefinition) -> Result<TunnelRecord, StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;

        let id = file.tunnels.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let record = TunnelRecord::new(id, definition);
        file.tunnels.push(record.clone());
        self.write(&file).await?;
        Ok(record)
    }

    async fn update(
        &self,
        id: i64,
        definition: TunnelDefinition,
    ) -> Result<TunnelRecord, StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;

        let record = file
            .tunnels
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound(id))?;
        record.definition = definition;
        let updated = record.clone();
        self.write(&file).await?;
        Ok(updated)
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;

        let before = file.tunnels.len();
        file.tunnels.retain(|t| t.id != id);
        if file.tunnels.len() == before {
            return Err(StoreError::NotFound(id));
        }
        self.write(&file).await
    }

    async fn set_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;

        let record = file
            .tunnels
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound(id))?;
        record.is_active = Some(active);
        self.write(&file).await
    }
}
