//! frpc lifecycle control
//!
//! Two implementations share the [`ClientController`] contract:
//!
//! - [`SubprocessController`] owns frpc as a child process. It writes the
//!   config, launches frpc as a process-group leader, tracks it in a PID file
//!   and stops it with SIGTERM, escalating to SIGKILL after a bounded wait.
//!   Applying a new config restarts the process.
//! - [`AdminApiController`] talks to an frpc that runs elsewhere (a sidecar)
//!   through its admin HTTP API. Applying a new config rewrites the shared
//!   config file and asks frpc to hot-reload it; the admin API's proxy list is
//!   the ground truth reported by `status()`.
//!
//! ```text
//! STOPPED --start--> STARTING --alive--> RUNNING --stop--> STOPPING --> STOPPED
//!                                        RUNNING --apply--> RELOADING --> RUNNING   (admin API)
//!                                        RUNNING --apply--> STOPPING -> STARTING -> RUNNING
//! ```
//!
//! Neither controller holds its internal lock across an `.await`; callers that
//! need render-write-reload to be atomic serialize on their own mutex.

use crate::config::ClientMode;
use crate::driver::{wait_for_exit, LaunchSpec, ProcessDriver, Signal, WaitPolicy};
use crate::files;
use crate::render::{self, RenderedConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How long a SIGKILLed client gets to disappear
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of the frpc client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Admin API flavor only
    Reloading,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientState::Stopped => "stopped",
            ClientState::Starting => "starting",
            ClientState::Running => "running",
            ClientState::Stopping => "stopping",
            ClientState::Reloading => "reloading",
        };
        f.write_str(name)
    }
}

/// One proxy as seen by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub mode: ClientMode,
    pub state: ClientState,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub proxies: Vec<ProxyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What `apply` did with a new config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOutcome {
    /// The child process was restarted on the new config
    Restarted,
    /// The admin API hot-reloaded the new config
    Reloaded,
    /// The client is not running; the config was only written
    Written,
    /// Nothing to apply yet (no session)
    Deferred,
}

/// Lifecycle failures
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("frpc is already running (pid {0:?})")]
    AlreadyRunning(Option<u32>),

    #[error("not running")]
    NotRunning,

    #[error("frpc is {0}, try again once it settles")]
    Busy(ClientState),

    #[error("frpc binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("failed to start frpc: {0}")]
    Start(String),

    #[error("failed to stop frpc: {0}")]
    Stop(String),

    #[error("frpc reload failed: {0}")]
    Reload(String),

    #[error("failed to write {}: {source}", path.display())]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("frpc admin API error: {0}")]
    Admin(String),
}

/// Contract shared by both ways of driving frpc
#[async_trait]
pub trait ClientController: Send + Sync {
    fn mode(&self) -> ClientMode;

    /// Report the client's state. Never fails; a stale PID file is cleaned up.
    async fn status(&self) -> ClientStatus;

    /// Write `config` and bring the client up
    async fn start(&self, config: &RenderedConfig) -> Result<ClientStatus, ControlError>;

    async fn stop(&self) -> Result<ClientStatus, ControlError>;

    /// Make the client run on `config`
    async fn apply(&self, config: &RenderedConfig) -> Result<ApplyOutcome, ControlError>;
}

async fn write_config(path: &Path, config: &RenderedConfig) -> Result<(), ControlError> {
    files::write_private_async(path.to_path_buf(), config.text().into_bytes())
        .await
        .map_err(|source| ControlError::WriteConfig {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), proxies = config.len(), "Wrote frpc config");
    Ok(())
}

struct ProcessSlot {
    state: ClientState,
    pid: Option<u32>,
}

/// Runs frpc as a managed child process
pub struct SubprocessController {
    driver: Arc<dyn ProcessDriver>,
    launch: LaunchSpec,
    config_path: PathBuf,
    pid_file: PathBuf,
    stop_policy: WaitPolicy,
    slot: Mutex<ProcessSlot>,
}

impl SubprocessController {
    pub fn new(
        driver: Arc<dyn ProcessDriver>,
        launch: LaunchSpec,
        config_path: PathBuf,
        pid_file: PathBuf,
        stop_policy: WaitPolicy,
    ) -> Self {
        Self {
            driver,
            launch,
            config_path,
            pid_file,
            stop_policy,
            slot: Mutex::new(ProcessSlot {
                state: ClientState::Stopped,
                pid: None,
            }),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn state(&self) -> ClientState {
        self.slot.lock().state
    }

    /// Find the live client, if any, and reconcile the slot with it.
    ///
    /// A PID file naming a dead process (or holding garbage) is removed.
    fn probe(&self, slot: &mut ProcessSlot) -> Option<u32> {
        let recorded = match files::read_pid(&self.pid_file) {
            Ok(pid) => pid,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(path = %self.pid_file.display(), error = %e, "Removing invalid PID file");
                self.remove_pid_file();
                None
            }
            Err(e) => {
                warn!(path = %self.pid_file.display(), error = %e, "Failed to read PID file");
                slot.pid
            }
        };

        match recorded {
            Some(pid) if self.driver.is_alive(pid) => {
                if slot.state == ClientState::Stopped {
                    info!(pid, "Adopting running frpc");
                    slot.state = ClientState::Running;
                }
                slot.pid = Some(pid);
                Some(pid)
            }
            Some(pid) => {
                info!(pid, path = %self.pid_file.display(), "Removing stale PID file");
                self.remove_pid_file();
                self.mark_gone(slot);
                None
            }
            None => {
                self.mark_gone(slot);
                None
            }
        }
    }

    fn mark_gone(&self, slot: &mut ProcessSlot) {
        slot.pid = None;
        // A stop in progress finishes its own transition
        if slot.state == ClientState::Running {
            warn!("frpc is no longer running");
            slot.state = ClientState::Stopped;
        }
    }

    fn remove_pid_file(&self) {
        if let Err(e) = files::remove_if_exists(&self.pid_file) {
            warn!(path = %self.pid_file.display(), error = %e, "Failed to remove PID file");
        }
    }

    /// STOPPED -> STARTING. Returns the resolved binary.
    ///
    /// Only the PID file is read under the slot lock; config and PID writes
    /// happen after it is released, with the STARTING state fencing off other
    /// lifecycle calls.
    fn claim_launch(&self) -> Result<PathBuf, ControlError> {
        let mut slot = self.slot.lock();
        if matches!(slot.state, ClientState::Starting | ClientState::Stopping) {
            return Err(ControlError::Busy(slot.state));
        }
        if let Some(pid) = self.probe(&mut slot) {
            return Err(ControlError::AlreadyRunning(Some(pid)));
        }

        // Never retried: a missing binary is a configuration problem
        let program = self
            .driver
            .resolve(&self.launch.program)
            .ok_or_else(|| ControlError::BinaryNotFound(self.launch.program.clone()))?;

        slot.state = ClientState::Starting;
        Ok(program)
    }

    /// STARTING -> RUNNING, or back to STOPPED on failure
    fn finish_launch(&self, result: Result<u32, ControlError>, proxies: usize) -> Result<u32, ControlError> {
        let mut slot = self.slot.lock();
        match result {
            Ok(pid) => {
                slot.state = ClientState::Running;
                slot.pid = Some(pid);
                info!(pid, proxies, "frpc started");
                Ok(pid)
            }
            Err(e) => {
                slot.state = ClientState::Stopped;
                slot.pid = None;
                error!(error = %e, "frpc failed to start");
                Err(e)
            }
        }
    }

    /// Write `config` and launch frpc on it
    async fn launch(&self, config: &RenderedConfig) -> Result<u32, ControlError> {
        let program = self.claim_launch()?;
        let result = match write_config(&self.config_path, config).await {
            Ok(()) => self.spawn_client(program).await,
            Err(e) => Err(e),
        };
        self.finish_launch(result, config.len())
    }

    /// Launch frpc on the config already on disk
    async fn relaunch(&self, proxies: usize) -> Result<u32, ControlError> {
        let program = self.claim_launch()?;
        let result = self.spawn_client(program).await;
        self.finish_launch(result, proxies)
    }

    async fn spawn_client(&self, program: PathBuf) -> Result<u32, ControlError> {
        let spec = LaunchSpec {
            program,
            ..self.launch.clone()
        };
        let pid = self.driver.spawn(&spec).map_err(|e| {
            ControlError::Start(format!("could not launch {}: {}", spec.program.display(), e))
        })?;

        let pid_line = format!("{}\n", pid).into_bytes();
        if let Err(e) = files::write_private_async(self.pid_file.clone(), pid_line).await {
            // An untracked frpc would outlive us with no way to stop it
            if let Err(kill_err) = self.driver.signal_group(pid, Signal::Kill) {
                warn!(pid, error = %kill_err, "Failed to kill untracked frpc");
            }
            return Err(ControlError::Start(format!(
                "could not write PID file {}: {}",
                self.pid_file.display(),
                e
            )));
        }

        if !self.driver.is_alive(pid) {
            self.remove_pid_file();
            return Err(ControlError::Start(format!(
                "frpc (pid {}) exited right after launch",
                pid
            )));
        }

        Ok(pid)
    }

    /// SIGTERM the group, wait, then SIGKILL
    async fn terminate(&self, pid: u32) -> Result<(), ControlError> {
        if let Err(e) = self.send(pid, Signal::Terminate) {
            if !self.driver.is_alive(pid) {
                return Ok(());
            }
            return Err(ControlError::Stop(format!("could not signal pid {}: {}", pid, e)));
        }

        if wait_for_exit(self.driver.as_ref(), pid, self.stop_policy).await {
            return Ok(());
        }

        warn!(
            pid,
            timeout_ms = self.stop_policy.timeout.as_millis() as u64,
            "frpc ignored SIGTERM, sending SIGKILL"
        );
        if let Err(e) = self.send(pid, Signal::Kill) {
            warn!(pid, error = %e, "Failed to SIGKILL frpc");
        }

        let grace = WaitPolicy {
            timeout: KILL_GRACE,
            poll_interval: self.stop_policy.poll_interval,
        };
        if wait_for_exit(self.driver.as_ref(), pid, grace).await {
            Ok(())
        } else {
            Err(ControlError::Stop(format!("pid {} survived SIGKILL", pid)))
        }
    }

    /// Signal the process group, falling back to the process itself
    fn send(&self, pid: u32, signal: Signal) -> io::Result<()> {
        match self.driver.signal_group(pid, signal) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(pid, error = %e, ?signal, "Group signal failed, signalling process");
                self.driver.signal(pid, signal)
            }
        }
    }

    async fn configured_proxies(&self) -> Result<Vec<ProxyStatus>, io::Error> {
        let text = tokio::fs::read_to_string(&self.config_path).await?;
        let proxies = render::read_proxies(&text)
            .into_iter()
            .map(|section| {
                let local_addr = match (section.get("local_ip"), section.get("local_port")) {
                    (Some(ip), Some(port)) => Some(format!("{}:{}", ip, port)),
                    _ => None,
                };
                ProxyStatus {
                    proxy_type: section.get("type").unwrap_or_default().to_string(),
                    status: "configured".to_string(),
                    error: None,
                    local_addr,
                    remote_addr: section.get("remote_port").map(|port| format!(":{}", port)),
                    name: section.name,
                }
            })
            .collect();
        Ok(proxies)
    }
}

#[async_trait]
impl ClientController for SubprocessController {
    fn mode(&self) -> ClientMode {
        ClientMode::Subprocess
    }

    async fn status(&self) -> ClientStatus {
        let (state, pid) = {
            let mut slot = self.slot.lock();
            let pid = self.probe(&mut slot);
            (slot.state, pid)
        };

        let (proxies, error) = match pid {
            Some(_) => match self.configured_proxies().await {
                Ok(proxies) => (proxies, None),
                Err(e) => (
                    Vec::new(),
                    Some(format!("cannot read {}: {}", self.config_path.display(), e)),
                ),
            },
            None => (Vec::new(), None),
        };

        ClientStatus {
            mode: ClientMode::Subprocess,
            state,
            running: pid.is_some(),
            pid,
            proxies,
            error,
        }
    }

    async fn start(&self, config: &RenderedConfig) -> Result<ClientStatus, ControlError> {
        self.launch(config).await?;
        Ok(self.status().await)
    }

    async fn stop(&self) -> Result<ClientStatus, ControlError> {
        let pid = {
            let mut slot = self.slot.lock();
            if matches!(slot.state, ClientState::Starting | ClientState::Stopping) {
                return Err(ControlError::Busy(slot.state));
            }
            let pid = self.probe(&mut slot).ok_or(ControlError::NotRunning)?;
            slot.state = ClientState::Stopping;
            pid
        };

        info!(pid, "Stopping frpc");
        let result = self.terminate(pid).await;

        {
            let mut slot = self.slot.lock();
            match result {
                Ok(()) => {
                    self.remove_pid_file();
                    slot.state = ClientState::Stopped;
                    slot.pid = None;
                    info!(pid, "frpc stopped");
                }
                Err(e) => {
                    slot.state = ClientState::Running;
                    error!(pid, error = %e, "frpc did not stop");
                    return Err(e);
                }
            }
        }

        Ok(self.status().await)
    }

    async fn apply(&self, config: &RenderedConfig) -> Result<ApplyOutcome, ControlError> {
        let running = {
            let mut slot = self.slot.lock();
            if matches!(slot.state, ClientState::Starting | ClientState::Stopping) {
                return Err(ControlError::Busy(slot.state));
            }
            self.probe(&mut slot)
        };

        // Written before the old process goes down: if this fails, frpc keeps
        // running on the previous config
        write_config(&self.config_path, config).await?;

        let Some(pid) = running else {
            return Ok(ApplyOutcome::Written);
        };

        info!(pid, proxies = config.len(), "Restarting frpc on new config");
        match self.stop().await {
            Ok(_) | Err(ControlError::NotRunning) => {}
            Err(e) => return Err(e),
        }

        self.relaunch(config.len()).await?;
        Ok(ApplyOutcome::Restarted)
    }
}

/// Entry of frpc's `GET /api/status` response
#[derive(Debug, Deserialize)]
struct AdminProxy {
    name: String,
    #[serde(rename = "type", default)]
    proxy_type: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    err: String,
    #[serde(default)]
    local_addr: String,
    #[serde(default)]
    remote_addr: String,
}

impl From<AdminProxy> for ProxyStatus {
    fn from(p: AdminProxy) -> Self {
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        ProxyStatus {
            name: p.name,
            proxy_type: p.proxy_type,
            status: p.status,
            error: non_empty(p.err),
            local_addr: non_empty(p.local_addr),
            remote_addr: non_empty(p.remote_addr),
        }
    }
}

struct AdminSlot {
    state: ClientState,
    applied: Option<RenderedConfig>,
}

/// Drives an externally managed frpc through its admin API
pub struct AdminApiController {
    http: Client,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    config_path: PathBuf,
    slot: Mutex<AdminSlot>,
}

impl AdminApiController {
    pub fn new(
        base_url: &str,
        user: Option<String>,
        password: Option<String>,
        config_path: PathBuf,
        timeout: Duration,
    ) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
            password,
            config_path,
            slot: Mutex::new(AdminSlot {
                state: ClientState::Stopped,
                applied: None,
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        self.slot.lock().state
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(format!("{}{}", self.base_url, path));
        match &self.user {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    /// Proxies frpc actually runs, flattened across types
    pub async fn fetch_proxies(&self) -> Result<Vec<ProxyStatus>, ControlError> {
        let response = self
            .get("/api/status")
            .send()
            .await
            .map_err(|e| ControlError::Admin(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ControlError::Admin(format!("GET /api/status returned {}", status)));
        }

        let by_type: BTreeMap<String, Vec<AdminProxy>> = response
            .json()
            .await
            .map_err(|e| ControlError::Admin(format!("invalid status response: {}", e)))?;

        Ok(by_type
            .into_values()
            .flatten()
            .map(ProxyStatus::from)
            .collect())
    }

    /// Ask frpc to re-read its config, retrying once on transport failure
    pub async fn reload(&self) -> Result<(), ControlError> {
        let mut retried = false;
        loop {
            match self.get("/api/reload").send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("frpc accepted reload");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let body: String = body.chars().take(200).collect();
                    return Err(ControlError::Reload(format!("{}: {}", status, body.trim())));
                }
                Err(e) if !retried && (e.is_connect() || e.is_timeout()) => {
                    warn!(error = %e, "frpc reload failed, retrying once");
                    retried = true;
                }
                Err(e) => return Err(ControlError::Reload(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl ClientController for AdminApiController {
    fn mode(&self) -> ClientMode {
        ClientMode::Admin
    }

    async fn status(&self) -> ClientStatus {
        let state = self.state();
        let (reachable, proxies, error) = match self.fetch_proxies().await {
            Ok(proxies) => (true, proxies, None),
            Err(e) => (false, Vec::new(), Some(e.to_string())),
        };

        ClientStatus {
            mode: ClientMode::Admin,
            state,
            // What frpc reports, independent of what this instance last asked for
            running: reachable && proxies.iter().any(|p| p.status == "running"),
            pid: None,
            proxies,
            error,
        }
    }

    async fn start(&self, config: &RenderedConfig) -> Result<ClientStatus, ControlError> {
        {
            let mut slot = self.slot.lock();
            match slot.state {
                ClientState::Stopped => {}
                ClientState::Running => return Err(ControlError::AlreadyRunning(None)),
                other => return Err(ControlError::Busy(other)),
            }
            slot.state = ClientState::Starting;
        }

        if let Err(e) = write_config(&self.config_path, config).await {
            self.slot.lock().state = ClientState::Stopped;
            return Err(e);
        }

        let result = self.reload().await;
        {
            let mut slot = self.slot.lock();
            match result {
                Ok(()) => {
                    slot.state = ClientState::Running;
                    slot.applied = Some(config.clone());
                    info!(proxies = config.len(), "frpc proxies enabled via admin API");
                }
                Err(e) => {
                    slot.state = ClientState::Stopped;
                    return Err(ControlError::Start(e.to_string()));
                }
            }
        }

        Ok(self.status().await)
    }

    /// Disconnect every proxy by reloading a config without any
    async fn stop(&self) -> Result<ClientStatus, ControlError> {
        let drained = {
            let mut slot = self.slot.lock();
            match slot.state {
                ClientState::Running => {}
                ClientState::Stopped => return Err(ControlError::NotRunning),
                other => return Err(ControlError::Busy(other)),
            }
            let drained = slot
                .applied
                .as_ref()
                .map(RenderedConfig::drained)
                .ok_or_else(|| ControlError::Stop("no applied config to drain".to_string()))?;
            slot.state = ClientState::Stopping;
            drained
        };

        if let Err(e) = write_config(&self.config_path, &drained).await {
            self.slot.lock().state = ClientState::Running;
            return Err(e);
        }

        let result = self.reload().await;
        {
            let mut slot = self.slot.lock();
            match result {
                Ok(()) => {
                    slot.state = ClientState::Stopped;
                    slot.applied = Some(drained);
                    info!("frpc proxies disabled via admin API");
                }
                Err(e) => {
                    slot.state = ClientState::Running;
                    return Err(ControlError::Stop(e.to_string()));
                }
            }
        }

        Ok(self.status().await)
    }

    async fn apply(&self, config: &RenderedConfig) -> Result<ApplyOutcome, ControlError> {
        let state = {
            let mut slot = self.slot.lock();
            let state = slot.state;
            if state == ClientState::Running {
                slot.state = ClientState::Reloading;
            }
            state
        };
        match state {
            ClientState::Stopped => {
                write_config(&self.config_path, config).await?;
                return Ok(ApplyOutcome::Written);
            }
            ClientState::Running => {}
            other => return Err(ControlError::Busy(other)),
        }

        if let Err(e) = write_config(&self.config_path, config).await {
            self.slot.lock().state = ClientState::Running;
            return Err(e);
        }
        self.slot.lock().applied = Some(config.clone());

        // The written config stays in place even if frpc rejects it; status()
        // shows what frpc actually runs.
        let result = self.reload().await;
        self.slot.lock().state = ClientState::Running;
        result?;

        info!(proxies = config.len(), "frpc hot-reloaded");
        Ok(ApplyOutcome::Reloaded)
    }
}
