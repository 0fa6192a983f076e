//! Credential/session cache
//!
//! Holds the single active identity. The cache is the source of truth at
//! runtime; the credentials file only mirrors it so a restarted service can
//! pick the session back up.

use crate::files;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Connection credentials of the logged-in user
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Base URL of the coordination service
    pub server_url: String,
    /// Bearer token for the coordination API
    #[serde(alias = "auth_token")]
    pub access_token: String,
    /// Secret handed to frpc
    pub tunnel_token: String,
    pub user_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logged_in_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server_url", &self.server_url)
            .field("user_email", &self.user_email)
            .field("logged_in_at", &self.logged_in_at)
            .finish_non_exhaustive()
    }
}

/// Process-wide cache of the active session
pub struct SessionCache {
    current: RwLock<Option<Session>>,
    file: Option<PathBuf>,
}

impl SessionCache {
    /// Cache mirrored to `file` (if given)
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(None),
            file,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Populate the cache from the credentials file
    pub fn load(&self) -> Option<Session> {
        let path = self.file.as_ref()?;
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read credentials");
                return None;
            }
        };

        match serde_json::from_str::<Session>(&content) {
            Ok(session) => {
                *self.current.write() = Some(session.clone());
                Some(session)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to parse credentials");
                None
            }
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.current.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.read().is_some()
    }

    /// Replace the active session; there is never more than one
    pub fn replace(&self, session: Session) {
        if let Some(path) = &self.file {
            match serde_json::to_vec_pretty(&session) {
                Ok(json) => {
                    if let Err(e) = files::write_private(path, &json) {
                        error!(path = %path.display(), error = %e, "Failed to save credentials");
                    }
                }
                Err(e) => error!(error = %e, "Failed to serialize credentials"),
            }
        }

        info!(email = %session.user_email, "Credentials saved");
        *self.current.write() = Some(session);
    }

    /// Drop the active session and its file
    pub fn clear(&self) {
        *self.current.write() = None;
        if let Some(path) = &self.file {
            if let Err(e) = files::remove_if_exists(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove credentials file");
            }
        }
        info!("Credentials cleared");
    }
}
