//! Tunnel definitions and their data-entry validation
//!
//! A [`TunnelDefinition`] is the authoritative description of one exposed
//! service. [`TunnelRecord`] wraps a definition with the identifier and the
//! observed fields reported by the coordination service.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted tunnel name
pub const MAX_NAME_LEN: usize = 50;

/// Longest accepted subdomain label
pub const MAX_SUBDOMAIN_LEN: usize = 63;

/// Section name frpc reserves for the connection settings
pub const RESERVED_SECTION: &str = "common";

/// Protocol of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Http,
    Https,
    Tcp,
    Udp,
    Ssh,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Ssh => "ssh",
        }
    }

    /// HTTP-style tunnels are routed by subdomain, the rest by remote port
    pub fn uses_subdomain(&self) -> bool {
        matches!(self, Self::Http | Self::Https)
    }

    /// Proxy type written into the frpc config.
    ///
    /// frpc has no dedicated ssh proxy, an ssh tunnel is a tcp proxy in front
    /// of the local sshd.
    pub fn proxy_type(&self) -> &'static str {
        match self {
            Self::Ssh => "tcp",
            other => other.as_str(),
        }
    }
}

impl std::fmt::Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Problems found in user-supplied tunnel fields
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid tunnel name '{0}': use 1-50 letters, digits, '-', '_' or '.'")]
    InvalidName(String),

    #[error("tunnel name '{0}' is reserved")]
    ReservedName(String),

    #[error("tunnel '{name}': subdomain is required for {kind} tunnels")]
    MissingSubdomain { name: String, kind: TunnelType },

    #[error("tunnel '{name}': remote port is required for {kind} tunnels")]
    MissingRemotePort { name: String, kind: TunnelType },

    #[error("tunnel '{name}': subdomain is not allowed for {kind} tunnels")]
    UnexpectedSubdomain { name: String, kind: TunnelType },

    #[error("tunnel '{name}': remote port is not allowed for {kind} tunnels")]
    UnexpectedRemotePort { name: String, kind: TunnelType },

    #[error("tunnel '{name}': ssh user is only allowed for ssh tunnels")]
    UnexpectedSshUser { name: String },

    #[error("tunnel '{name}': invalid subdomain '{value}'")]
    InvalidSubdomain { name: String, value: String },

    #[error("tunnel '{name}': invalid local host '{value}'")]
    InvalidLocalHost { name: String, value: String },

    #[error("tunnel '{name}': invalid ssh user '{value}'")]
    InvalidSshUser { name: String, value: String },

    #[error("tunnel '{name}': {field} {value} is outside 1-65535")]
    PortOutOfRange {
        name: String,
        field: &'static str,
        value: u32,
    },

    #[error("tunnel name '{0}' already exists")]
    DuplicateName(String),
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

/// One exposed service mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDefinition {
    /// Unique name, also the frpc section key
    pub name: String,

    #[serde(rename = "type")]
    pub kind: TunnelType,

    /// Host the local service is reachable on from the frpc process
    #[serde(default = "default_local_host")]
    pub local_host: String,

    pub local_port: u32,

    /// Required for http/https
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,

    /// Required for tcp/udp/ssh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
}

impl TunnelDefinition {
    /// Create an http tunnel bound to `127.0.0.1:local_port`
    pub fn http(name: &str, local_port: u32, subdomain: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: TunnelType::Http,
            local_host: default_local_host(),
            local_port,
            subdomain: Some(subdomain.to_string()),
            remote_port: None,
            ssh_user: None,
        }
    }

    /// Create a tcp tunnel bound to `127.0.0.1:local_port`
    pub fn tcp(name: &str, local_port: u32, remote_port: u32) -> Self {
        Self {
            name: name.to_string(),
            kind: TunnelType::Tcp,
            local_host: default_local_host(),
            local_port,
            subdomain: None,
            remote_port: Some(remote_port),
            ssh_user: None,
        }
    }

    /// Treat blank optional fields as absent, the way form submissions send them
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.local_host = self.local_host.trim().to_string();
        if self.local_host.is_empty() {
            self.local_host = default_local_host();
        }
        self.subdomain = self
            .subdomain
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.ssh_user = self
            .ssh_user
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self
    }

    /// Check every field against the rules of its tunnel type
    pub fn validate(&self) -> Result<(), ValidationError> {
        let name = &self.name;

        if !is_valid_name(name) {
            return Err(ValidationError::InvalidName(name.clone()));
        }
        if name.eq_ignore_ascii_case(RESERVED_SECTION) {
            return Err(ValidationError::ReservedName(name.clone()));
        }

        check_port(name, "local port", self.local_port)?;

        if !is_valid_host(&self.local_host) {
            return Err(ValidationError::InvalidLocalHost {
                name: name.clone(),
                value: self.local_host.clone(),
            });
        }

        if self.kind.uses_subdomain() {
            let subdomain =
                self.subdomain
                    .as_deref()
                    .ok_or_else(|| ValidationError::MissingSubdomain {
                        name: name.clone(),
                        kind: self.kind,
                    })?;
            if !is_valid_subdomain(subdomain) {
                return Err(ValidationError::InvalidSubdomain {
                    name: name.clone(),
                    value: subdomain.to_string(),
                });
            }
            if self.remote_port.is_some() {
                return Err(ValidationError::UnexpectedRemotePort {
                    name: name.clone(),
                    kind: self.kind,
                });
            }
        } else {
            let remote_port =
                self.remote_port
                    .ok_or_else(|| ValidationError::MissingRemotePort {
                        name: name.clone(),
                        kind: self.kind,
                    })?;
            check_port(name, "remote port", remote_port)?;
            if self.subdomain.is_some() {
                return Err(ValidationError::UnexpectedSubdomain {
                    name: name.clone(),
                    kind: self.kind,
                });
            }
        }

        match (&self.ssh_user, self.kind) {
            (Some(user), TunnelType::Ssh) if !is_valid_ssh_user(user) => {
                Err(ValidationError::InvalidSshUser {
                    name: name.clone(),
                    value: user.clone(),
                })
            }
            (Some(_), kind) if kind != TunnelType::Ssh => {
                Err(ValidationError::UnexpectedSshUser { name: name.clone() })
            }
            _ => Ok(()),
        }
    }
}

/// A persisted tunnel as reported by the definition store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub id: i64,

    #[serde(flatten)]
    pub definition: TunnelDefinition,

    // Observed fields, never written back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

impl TunnelRecord {
    pub fn new(id: i64, definition: TunnelDefinition) -> Self {
        Self {
            id,
            definition,
            is_active: None,
            last_connected: None,
            public_url: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

fn check_port(name: &str, field: &'static str, value: u32) -> Result<(), ValidationError> {
    if (1..=65535).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::PortOutOfRange {
            name: name.to_string(),
            field,
            value,
        })
    }
}

/// Names become INI section headers: `[name]`
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// A single DNS label: lowercase letters, digits and inner hyphens
pub(crate) fn is_valid_subdomain(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_SUBDOMAIN_LEN
        && !value.starts_with('-')
        && !value.ends_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Hostname, IPv4 or IPv6 literal
pub(crate) fn is_valid_host(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
}

pub(crate) fn is_valid_ssh_user(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 32
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
