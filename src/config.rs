use crate::driver::{LaunchSpec, WaitPolicy};
use crate::render::{AdminBinding, RenderOptions};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in `client.args` replaced by the config path
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Service configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP control surface
    #[serde(default)]
    pub server: ServerConfig,

    /// The frpc client this service drives
    #[serde(default)]
    pub client: ClientConfig,

    /// Where tunnel definitions live
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port of the HTTP control surface (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bearer token required on /api/* routes, if set
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            auth_token: None,
        }
    }
}

/// How the frpc client is driven
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// Spawn and signal frpc as a child process (default)
    #[default]
    Subprocess,
    /// frpc runs elsewhere; hot-reload it through its admin API
    Admin,
}

impl std::fmt::Display for ClientMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientMode::Subprocess => f.write_str("subprocess"),
            ClientMode::Admin => f.write_str("admin"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default)]
    pub mode: ClientMode,

    /// frpc binary (default: /usr/local/bin/frpc)
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Arguments; `{config}` is replaced by `config_path`
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Canonical frpc config path (default: /etc/frp/frpc.ini)
    #[serde(default = "default_config_path")]
    pub config_path: String,

    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Child stdout/stderr are appended here
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Control port of the tunnel server (default: 7000)
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Maximum wait for the client to exit after SIGTERM
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_stop_poll_interval")]
    pub stop_poll_interval_ms: u64,

    /// frpc admin API base URL (admin mode)
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    pub admin_user: Option<String>,

    pub admin_password: Option<String>,

    #[serde(default = "default_admin_timeout")]
    pub admin_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mode: ClientMode::default(),
            binary: default_binary(),
            args: default_args(),
            config_path: default_config_path(),
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            server_port: default_server_port(),
            stop_timeout_ms: default_stop_timeout(),
            stop_poll_interval_ms: default_stop_poll_interval(),
            admin_url: default_admin_url(),
            admin_user: None,
            admin_password: None,
            admin_timeout_secs: default_admin_timeout(),
        }
    }
}

impl ClientConfig {
    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(&self.config_path)
    }

    pub fn pid_file(&self) -> PathBuf {
        PathBuf::from(&self.pid_file)
    }

    /// Command line for the client with the config path filled in
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from(&self.binary),
            args: self
                .args
                .iter()
                .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &self.config_path))
                .collect(),
            log_file: (!self.log_file.is_empty()).then(|| PathBuf::from(&self.log_file)),
        }
    }

    /// SIGTERM grace window
    pub fn stop_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(self.stop_timeout_ms),
            poll_interval: Duration::from_millis(self.stop_poll_interval_ms),
        }
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_secs)
    }

    /// Static parts of the rendered `[common]` section
    pub fn render_options(&self) -> RenderOptions {
        let admin = match self.mode {
            ClientMode::Subprocess => None,
            ClientMode::Admin => Url::parse(&self.admin_url).ok().and_then(|url| {
                Some(AdminBinding {
                    addr: url.host_str()?.to_string(),
                    port: url.port_or_known_default()?,
                    user: self.admin_user.clone(),
                    password: self.admin_password.clone(),
                })
            }),
        };

        RenderOptions {
            server_port: self.server_port,
            admin,
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.binary.trim().is_empty() {
            errors.push("client.binary must not be empty".to_string());
        }
        if self.config_path.trim().is_empty() {
            errors.push("client.config_path must not be empty".to_string());
        }
        if self.pid_file.trim().is_empty() {
            errors.push("client.pid_file must not be empty".to_string());
        }
        if self.server_port == 0 {
            errors.push("client.server_port must be greater than 0".to_string());
        }
        if self.stop_timeout_ms == 0 {
            errors.push("client.stop_timeout_ms must be greater than 0".to_string());
        }
        if self.stop_poll_interval_ms == 0 {
            errors.push("client.stop_poll_interval_ms must be greater than 0".to_string());
        }
        if self.stop_poll_interval_ms > self.stop_timeout_ms {
            errors.push("client.stop_poll_interval_ms must not exceed stop_timeout_ms".to_string());
        }
        if self.mode == ClientMode::Admin {
            match Url::parse(&self.admin_url) {
                Ok(url) if url.host_str().is_some() => {}
                _ => errors.push(format!(
                    "client.admin_url '{}' is not a valid URL",
                    self.admin_url
                )),
            }
            if self.admin_timeout_secs == 0 {
                errors.push("client.admin_timeout_secs must be greater than 0".to_string());
            }
        }
        if self.admin_password.is_some() && self.admin_user.is_none() {
            errors.push("client.admin_password requires client.admin_user".to_string());
        }
    }
}

/// Backing store for tunnel definitions
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Coordination service over HTTP (default)
    #[default]
    Remote,
    /// Local TOML file
    File,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,

    /// Tunnel file for the `file` store (default: tunnels.toml)
    #[serde(default = "default_store_file")]
    pub file: String,

    /// Coordination service URL used when a login omits one
    pub server_url: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            file: default_store_file(),
            server_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    /// Mirror the session to a file (default: true)
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Credentials file (default: <config dir>/tunnelctl/credentials.json)
    pub file: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            persist: true,
            file: None,
        }
    }
}

impl CredentialsConfig {
    /// Resolved credentials file, `None` when persistence is off
    pub fn path(&self) -> Option<PathBuf> {
        if !self.persist {
            return None;
        }
        match &self.file {
            Some(file) => Some(PathBuf::from(file)),
            None => Some(
                dirs_next::config_dir()
                    .map(|dir| dir.join("tunnelctl").join("credentials.json"))
                    .unwrap_or_else(|| PathBuf::from("credentials.json")),
            ),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_binary() -> String {
    "/usr/local/bin/frpc".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-c".to_string(), CONFIG_PLACEHOLDER.to_string()]
}

fn default_config_path() -> String {
    "/etc/frp/frpc.ini".to_string()
}

fn default_pid_file() -> String {
    "/tmp/frpc.pid".to_string()
}

fn default_log_file() -> String {
    "/tmp/frpc.log".to_string()
}

fn default_server_port() -> u16 {
    7000
}

fn default_stop_timeout() -> u64 {
    5000 // 5 seconds of SIGTERM grace
}

fn default_stop_poll_interval() -> u64 {
    100
}

fn default_admin_url() -> String {
    "http://127.0.0.1:7400".to_string()
}

fn default_admin_timeout() -> u64 {
    5
}

fn default_store_file() -> String {
    "tunnels.toml".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if matches!(&self.server.auth_token, Some(token) if token.trim().is_empty()) {
            errors.push("server.auth_token must not be empty when set".to_string());
        }

        self.client.validate(&mut errors);

        if self.store.request_timeout_secs == 0 {
            errors.push("store.request_timeout_secs must be greater than 0".to_string());
        }
        if self.store.kind == StoreKind::File && self.store.file.trim().is_empty() {
            errors.push("store.file must not be empty for the file store".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "0.0.0.0"
auth_token = "s3cret"

[client]
mode = "admin"
binary = "/opt/frp/frpc"
config_path = "/srv/frp/frpc.ini"
admin_url = "http://127.0.0.1:7500"
admin_user = "admin"
admin_password = "pw"

[store]
kind = "file"
file = "/srv/tunnels.toml"
server_url = "http://tunnel.example.com:8000"

[credentials]
persist = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.client.mode, ClientMode::Admin);
        assert_eq!(config.client.binary, "/opt/frp/frpc");
        assert_eq!(config.store.kind, StoreKind::File);
        assert_eq!(config.credentials.path(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.client.mode, ClientMode::Subprocess);
        assert_eq!(config.client.binary, "/usr/local/bin/frpc");
        assert_eq!(config.client.config_path, "/etc/frp/frpc.ini");
        assert_eq!(config.client.pid_file, "/tmp/frpc.pid");
        assert_eq!(config.client.server_port, 7000);
        assert_eq!(config.store.kind, StoreKind::Remote);
        assert!(config.credentials.persist);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_launch_spec_substitutes_config_path() {
        let client = ClientConfig {
            config_path: "/tmp/x/frpc.ini".to_string(),
            ..ClientConfig::default()
        };
        let spec = client.launch_spec();

        assert_eq!(spec.program, PathBuf::from("/usr/local/bin/frpc"));
        assert_eq!(spec.args, vec!["-c", "/tmp/x/frpc.ini"]);
        assert_eq!(spec.log_file, Some(PathBuf::from("/tmp/frpc.log")));
    }

    #[test]
    fn test_empty_log_file_discards_output() {
        let client = ClientConfig {
            log_file: String::new(),
            ..ClientConfig::default()
        };
        assert_eq!(client.launch_spec().log_file, None);
    }

    #[test]
    fn test_stop_policy() {
        let policy = ClientConfig::default().stop_policy();
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_render_options_by_mode() {
        let mut client = ClientConfig::default();
        assert_eq!(client.render_options().admin, None);

        client.mode = ClientMode::Admin;
        client.admin_user = Some("admin".to_string());
        let admin = client.render_options().admin.unwrap();
        assert_eq!(admin.addr, "127.0.0.1");
        assert_eq!(admin.port, 7400);
        assert_eq!(admin.user.as_deref(), Some("admin"));
    }

    #[test]
    fn test_credentials_path() {
        let creds = CredentialsConfig {
            persist: true,
            file: Some("/var/lib/tunnelctl/creds.json".to_string()),
        };
        assert_eq!(
            creds.path(),
            Some(PathBuf::from("/var/lib/tunnelctl/creds.json"))
        );

        let default = CredentialsConfig::default().path().unwrap();
        assert!(default.ends_with("credentials.json"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
port = 0

[client]
binary = ""
stop_timeout_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("server.port"));
        assert!(err.contains("client.binary"));
        assert!(err.contains("client.stop_timeout_ms"));
    }

    #[test]
    fn test_validate_admin_url() {
        let toml = r#"
[client]
mode = "admin"
admin_url = "not a url"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result: Result<Config, _> = toml::from_str("[client]\nmode = \"docker\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnelctl.toml");
        std::fs::write(&path, "[server]\nport = 3100\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 3100);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
