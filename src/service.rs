//! The control-plane context object
//!
//! [`TunnelService`] owns the session cache, the definition store and the
//! frpc controller, and serializes every render-write-reload sequence on one
//! async mutex. Mutations return only after the new tunnel set has been
//! handed to frpc, so a successful response always means "frpc has it".

use crate::config::{Config, ClientMode, StoreKind};
use crate::controller::{
    AdminApiController, ApplyOutcome, ClientController, ClientState, ClientStatus, ControlError,
    SubprocessController,
};
use crate::driver::SystemDriver;
use crate::error::ServiceError;
use crate::remote::{normalize_server_url, CoordinationClient, RemoteError};
use crate::render::{render, RenderOptions};
use crate::session::{Session, SessionCache};
use crate::store::{DefinitionStore, FileStore, ImportReport, RemoteStore};
use crate::tunnel::{TunnelDefinition, TunnelRecord, ValidationError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Result of a mutation together with what happened to frpc
#[derive(Debug, Clone, Serialize)]
pub struct Synced<T> {
    #[serde(flatten)]
    pub value: T,
    /// `None` when nothing changed and frpc was left alone
    pub applied: Option<ApplyOutcome>,
}

/// Session validity as reported to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub email: Option<String>,
    pub server_url: Option<String>,
}

impl AuthStatus {
    fn anonymous() -> Self {
        Self {
            authenticated: false,
            email: None,
            server_url: None,
        }
    }
}

pub struct TunnelService {
    store: Arc<dyn DefinitionStore>,
    sessions: Arc<SessionCache>,
    coordinator: Arc<CoordinationClient>,
    controller: Arc<dyn ClientController>,
    render_options: RenderOptions,
    default_server_url: Option<String>,
    // Guards render -> write -> reload and every lifecycle transition
    sync: Mutex<()>,
}

impl TunnelService {
    pub fn new(
        store: Arc<dyn DefinitionStore>,
        sessions: Arc<SessionCache>,
        coordinator: Arc<CoordinationClient>,
        controller: Arc<dyn ClientController>,
        render_options: RenderOptions,
        default_server_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sessions,
            coordinator,
            controller,
            render_options,
            default_server_url,
            sync: Mutex::new(()),
        })
    }

    /// Wire up the production collaborators described by `config`
    pub fn from_config(config: &Config) -> Arc<Self> {
        let sessions = Arc::new(SessionCache::new(config.credentials.path()));
        let coordinator = Arc::new(CoordinationClient::new(config.store.request_timeout()));

        let store: Arc<dyn DefinitionStore> = match config.store.kind {
            StoreKind::Remote => Arc::new(RemoteStore::new(coordinator.clone(), sessions.clone())),
            StoreKind::File => Arc::new(FileStore::new(&config.store.file)),
        };

        let client = &config.client;
        let controller: Arc<dyn ClientController> = match client.mode {
            ClientMode::Subprocess => Arc::new(SubprocessController::new(
                Arc::new(SystemDriver::new()),
                client.launch_spec(),
                client.config_path(),
                client.pid_file(),
                client.stop_policy(),
            )),
            ClientMode::Admin => Arc::new(AdminApiController::new(
                &client.admin_url,
                client.admin_user.clone(),
                client.admin_password.clone(),
                client.config_path(),
                client.admin_timeout(),
            )),
        };

        Self::new(
            store,
            sessions,
            coordinator,
            controller,
            client.render_options(),
            config
                .store
                .server_url
                .as_deref()
                .and_then(normalize_server_url),
        )
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    pub fn mode(&self) -> ClientMode {
        self.controller.mode()
    }

    /// Coordination URL configured for the service, if any
    pub fn default_server_url(&self) -> Option<&str> {
        self.default_server_url.as_deref()
    }

    /// Whether this instance has frpc up, as opposed to whether frpc reports
    /// live proxies
    async fn client_started(&self) -> bool {
        matches!(
            self.controller.status().await.state,
            ClientState::Running | ClientState::Reloading
        )
    }

    fn require_session(&self) -> Result<Session, ServiceError> {
        self.sessions
            .current()
            .ok_or_else(ServiceError::not_authenticated)
    }

    /// Re-read the tunnel set and make frpc run on it
    pub async fn apply_and_reload(&self) -> Result<ApplyOutcome, ServiceError> {
        let _guard = self.sync.lock().await;
        self.apply_locked().await
    }

    /// Must be called with `sync` held
    async fn apply_locked(&self) -> Result<ApplyOutcome, ServiceError> {
        let Some(session) = self.sessions.current() else {
            debug!("No session, deferring frpc config");
            return Ok(ApplyOutcome::Deferred);
        };

        let records = self.store.list().await?;
        let definitions: Vec<TunnelDefinition> =
            records.into_iter().map(|record| record.definition).collect();

        // Fail closed: a bad set never reaches the config file or frpc
        let config = render(&session, &definitions, &self.render_options).map_err(|e| {
            error!(tunnel = e.tunnel().unwrap_or("-"), error = %e, "Render failed, keeping current frpc config");
            e
        })?;

        let outcome = self.controller.apply(&config).await.map_err(|e| {
            error!(error = %e, proxies = config.len(), "Failed to apply frpc config");
            e
        })?;

        info!(?outcome, proxies = config.len(), "Applied tunnel set");
        Ok(outcome)
    }

    pub async fn status(&self) -> ClientStatus {
        self.controller.status().await
    }

    pub async fn start(&self) -> Result<ClientStatus, ServiceError> {
        let _guard = self.sync.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<ClientStatus, ServiceError> {
        let session = self.require_session()?;
        let records = self.store.list().await?;
        let definitions: Vec<TunnelDefinition> =
            records.iter().map(|record| record.definition.clone()).collect();

        let config = render(&session, &definitions, &self.render_options)?;
        let status = self.controller.start(&config).await?;

        self.mark_active(&records, true).await;
        Ok(status)
    }

    pub async fn stop(&self) -> Result<ClientStatus, ServiceError> {
        let _guard = self.sync.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<ClientStatus, ServiceError> {
        let status = self.controller.stop().await?;

        if self.sessions.is_authenticated() {
            match self.store.list().await {
                Ok(records) => self.mark_active(&records, false).await,
                Err(e) => warn!(error = %e, "Could not list tunnels to mark them inactive"),
            }
        }
        Ok(status)
    }

    /// Stop if running, then start
    pub async fn restart(&self) -> Result<ClientStatus, ServiceError> {
        let _guard = self.sync.lock().await;
        match self.controller.stop().await {
            Ok(_) | Err(ControlError::NotRunning) => {}
            Err(e) => return Err(e.into()),
        }
        self.start_locked().await
    }

    /// Start frpc if there is a session, at least one tunnel and no running
    /// client. Returns whether it was started.
    pub async fn ensure_running(&self) -> Result<bool, ServiceError> {
        let _guard = self.sync.lock().await;

        if !self.sessions.is_authenticated() {
            debug!("No session, not starting frpc");
            return Ok(false);
        }
        if self.client_started().await {
            return Ok(false);
        }
        if self.store.list().await?.is_empty() {
            debug!("No tunnels, not starting frpc");
            return Ok(false);
        }

        self.start_locked().await?;
        Ok(true)
    }

    /// Best effort: failures are logged per tunnel
    async fn mark_active(&self, records: &[TunnelRecord], active: bool) {
        for record in records {
            if let Err(e) = self.store.set_active(record.id, active).await {
                warn!(tunnel = %record.name(), active, error = %e, "Failed to update tunnel activity");
            }
        }
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>, ServiceError> {
        Ok(self.store.list().await?)
    }

    pub async fn create_tunnel(
        &self,
        definition: TunnelDefinition,
    ) -> Result<Synced<TunnelRecord>, ServiceError> {
        let definition = definition.normalized();
        definition.validate()?;

        let _guard = self.sync.lock().await;
        let existing = self.store.list().await?;
        if existing.iter().any(|r| r.definition.name == definition.name) {
            return Err(ValidationError::DuplicateName(definition.name).into());
        }

        let record = self.store.create(definition).await?;
        info!(tunnel = %record.name(), id = record.id, "Tunnel created");

        let applied = self.apply_locked().await?;
        Ok(Synced {
            value: record,
            applied: Some(applied),
        })
    }

    pub async fn update_tunnel(
        &self,
        id: i64,
        definition: TunnelDefinition,
    ) -> Result<Synced<TunnelRecord>, ServiceError> {
        let definition = definition.normalized();
        definition.validate()?;

        let _guard = self.sync.lock().await;
        let existing = self.store.list().await?;
        if existing
            .iter()
            .any(|r| r.id != id && r.definition.name == definition.name)
        {
            return Err(ValidationError::DuplicateName(definition.name).into());
        }

        let record = self.store.update(id, definition).await?;
        info!(tunnel = %record.name(), id, "Tunnel updated");

        let applied = self.apply_locked().await?;
        Ok(Synced {
            value: record,
            applied: Some(applied),
        })
    }

    pub async fn delete_tunnel(&self, id: i64) -> Result<Synced<()>, ServiceError> {
        let _guard = self.sync.lock().await;
        self.store.delete(id).await?;
        info!(id, "Tunnel deleted");

        let applied = self.apply_locked().await?;
        Ok(Synced {
            value: (),
            applied: Some(applied),
        })
    }

    pub async fn import_tunnels(
        &self,
        definitions: Vec<TunnelDefinition>,
    ) -> Result<Synced<ImportReport>, ServiceError> {
        let _guard = self.sync.lock().await;
        let report = self.store.bulk_import(definitions).await?;

        let applied = if report.created.is_empty() {
            None
        } else {
            Some(self.apply_locked().await?)
        };
        Ok(Synced {
            value: report,
            applied,
        })
    }

    /// Log in and bring frpc in line with the new identity.
    ///
    /// A running client is reloaded so it presents the new token; a stopped
    /// one is auto-started when tunnels exist. Neither step fails the login.
    pub async fn login(
        &self,
        server_url: Option<&str>,
        email: &str,
        password: &str,
    ) -> Result<Session, ServiceError> {
        let server_url = server_url
            .filter(|url| !url.trim().is_empty())
            .or(self.default_server_url.as_deref())
            .and_then(normalize_server_url)
            .ok_or_else(|| ServiceError::BadRequest("Server URL is required".to_string()))?;

        let session = self.coordinator.login(&server_url, email, password).await?;
        self.sessions.replace(session.clone());
        info!(email, server_url = %server_url, "Logged in");

        if self.client_started().await {
            if let Err(e) = self.apply_and_reload().await {
                warn!(error = %e, "Failed to reload frpc with new credentials");
            }
        } else {
            match self.ensure_running().await {
                Ok(true) => info!("Auto-started frpc after login"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Auto-start after login failed"),
            }
        }

        Ok(session)
    }

    /// Stop frpc and forget the session. The session is cleared even when
    /// stopping fails.
    pub async fn logout(&self) {
        {
            let _guard = self.sync.lock().await;
            if self.client_started().await {
                if let Err(e) = self.stop_locked().await {
                    error!(error = %e, "Failed to stop frpc on logout");
                }
            }
        }
        self.sessions.clear();
        info!("Logged out");
    }

    /// Check the cached token against the coordination service.
    ///
    /// A rejected token clears the session; an unreachable server does not.
    pub async fn auth_status(&self) -> AuthStatus {
        let Some(session) = self.sessions.current() else {
            return AuthStatus::anonymous();
        };

        match self.coordinator.list_tunnels(&session).await {
            Err(RemoteError::SessionExpired) => {
                info!("Access token expired, clearing credentials");
                self.sessions.clear();
                return AuthStatus::anonymous();
            }
            Err(e) => debug!(error = %e, "Could not validate token, assuming still valid"),
            Ok(_) => {}
        }

        AuthStatus {
            authenticated: true,
            email: Some(session.user_email),
            server_url: Some(session.server_url),
        }
    }
}
