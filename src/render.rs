//! frpc INI config rendering
//!
//! [`render`] is a pure function of the session, the tunnel list and the
//! static options. It checks every value it is about to emit and refuses to
//! produce text rather than sanitizing, so nothing user-supplied can open a
//! new section or inject a key.

use crate::session::Session;
use crate::tunnel::{self, TunnelDefinition, RESERVED_SECTION};
use reqwest::Url;
use std::collections::HashSet;
use thiserror::Error;

/// Rendering-time inconsistencies in an otherwise accepted tunnel set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("duplicate tunnel name '{0}'")]
    DuplicateName(String),

    #[error("tunnel '{name}' is missing {field}")]
    MissingField { name: String, field: &'static str },

    #[error("tunnel '{name}' has an illegal {field}: {value:?}")]
    IllegalValue {
        name: String,
        field: &'static str,
        value: String,
    },

    #[error("tunnel '{name}': {field} {value} is outside 1-65535")]
    PortOutOfRange {
        name: String,
        field: &'static str,
        value: u32,
    },

    #[error("cannot derive a server address from '{0}'")]
    InvalidServerUrl(String),

    #[error("{0} contains characters that cannot appear in the config")]
    IllegalSetting(&'static str),
}

impl RenderError {
    /// Name of the offending tunnel, if the error is about one
    pub fn tunnel(&self) -> Option<&str> {
        match self {
            Self::DuplicateName(name)
            | Self::MissingField { name, .. }
            | Self::IllegalValue { name, .. }
            | Self::PortOutOfRange { name, .. } => Some(name),
            Self::InvalidServerUrl(_) | Self::IllegalSetting(_) => None,
        }
    }
}

/// frpc admin listener written into `[common]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminBinding {
    pub addr: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Settings that do not come from the session or the tunnels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Control port of the tunnel server
    pub server_port: u16,
    pub admin: Option<AdminBinding>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            server_port: 7000,
            admin: None,
        }
    }
}

/// One rendered `[name]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySection {
    pub name: String,
    pub proxy_type: &'static str,
    body: String,
}

/// A complete frpc config, split into sections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    common: String,
    proxies: Vec<ProxySection>,
}

impl RenderedConfig {
    /// Full file content
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(
            self.common.len() + self.proxies.iter().map(|p| p.body.len()).sum::<usize>(),
        );
        out.push_str(&self.common);
        for proxy in &self.proxies {
            out.push_str(&proxy.body);
        }
        out
    }

    pub fn proxies(&self) -> &[ProxySection] {
        &self.proxies
    }

    pub fn proxy_names(&self) -> Vec<&str> {
        self.proxies.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Same connection settings with every proxy removed
    pub fn drained(&self) -> Self {
        Self {
            common: self.common.clone(),
            proxies: Vec::new(),
        }
    }
}

/// Render `tunnels` into frpc's INI syntax, in the given order
pub fn render(
    session: &Session,
    tunnels: &[TunnelDefinition],
    options: &RenderOptions,
) -> Result<RenderedConfig, RenderError> {
    let common = render_common(session, options)?;

    let mut seen = HashSet::with_capacity(tunnels.len());
    let mut proxies = Vec::with_capacity(tunnels.len());
    for def in tunnels {
        if !seen.insert(def.name.as_str()) {
            return Err(RenderError::DuplicateName(def.name.clone()));
        }
        proxies.push(render_proxy(def)?);
    }

    Ok(RenderedConfig { common, proxies })
}

fn render_common(session: &Session, options: &RenderOptions) -> Result<String, RenderError> {
    let server_addr = server_host(&session.server_url)?;
    check_setting("tunnel_token", &session.tunnel_token)?;

    let mut out = format!(
        "[{}]\nserver_addr = {}\nserver_port = {}\ntoken = {}\n",
        RESERVED_SECTION, server_addr, options.server_port, session.tunnel_token
    );

    if let Some(admin) = &options.admin {
        check_setting("admin_addr", &admin.addr)?;
        out.push_str(&format!("admin_addr = {}\nadmin_port = {}\n", admin.addr, admin.port));
        if let Some(user) = &admin.user {
            check_setting("admin_user", user)?;
            out.push_str(&format!("admin_user = {}\n", user));
        }
        if let Some(password) = &admin.password {
            check_setting("admin_password", password)?;
            out.push_str(&format!("admin_pwd = {}\n", password));
        }
    }

    out.push('\n');
    Ok(out)
}

fn render_proxy(def: &TunnelDefinition) -> Result<ProxySection, RenderError> {
    let name = &def.name;
    if !tunnel::is_valid_name(name) || name.eq_ignore_ascii_case(RESERVED_SECTION) {
        return Err(illegal(name, "name", name));
    }
    if !tunnel::is_valid_host(&def.local_host) {
        return Err(illegal(name, "local_host", &def.local_host));
    }
    check_port(name, "local_port", def.local_port)?;

    let proxy_type = def.kind.proxy_type();
    let mut body = format!(
        "[{}]\ntype = {}\nlocal_ip = {}\nlocal_port = {}\n",
        name, proxy_type, def.local_host, def.local_port
    );

    if def.kind.uses_subdomain() {
        let subdomain = def.subdomain.as_deref().ok_or_else(|| RenderError::MissingField {
            name: name.clone(),
            field: "subdomain",
        })?;
        if !tunnel::is_valid_subdomain(subdomain) {
            return Err(illegal(name, "subdomain", subdomain));
        }
        body.push_str(&format!("subdomain = {}\n", subdomain));
    } else {
        let remote_port = def.remote_port.ok_or_else(|| RenderError::MissingField {
            name: name.clone(),
            field: "remote_port",
        })?;
        check_port(name, "remote_port", remote_port)?;
        body.push_str(&format!("remote_port = {}\n", remote_port));
    }

    body.push('\n');
    Ok(ProxySection {
        name: name.clone(),
        proxy_type,
        body,
    })
}

/// Host part of the coordination URL; frpc connects to the same host on
/// its own control port.
pub fn server_host(server_url: &str) -> Result<String, RenderError> {
    let trimmed = server_url.trim();
    let parsed = if trimmed.contains("://") {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("http://{}", trimmed))
    };

    let host = parsed
        .ok()
        .and_then(|url| url.host_str().map(|h| h.trim_matches(&['[', ']'][..]).to_string()))
        .filter(|h| tunnel::is_valid_host(h))
        .ok_or_else(|| RenderError::InvalidServerUrl(server_url.to_string()))?;

    Ok(host)
}

fn check_setting(field: &'static str, value: &str) -> Result<(), RenderError> {
    if value.chars().any(|c| c.is_control()) {
        Err(RenderError::IllegalSetting(field))
    } else {
        Ok(())
    }
}

fn check_port(name: &str, field: &'static str, value: u32) -> Result<(), RenderError> {
    if (1..=65535).contains(&value) {
        Ok(())
    } else {
        Err(RenderError::PortOutOfRange {
            name: name.to_string(),
            field,
            value,
        })
    }
}

fn illegal(name: &str, field: &'static str, value: &str) -> RenderError {
    RenderError::IllegalValue {
        name: name.to_string(),
        field,
        value: value.to_string(),
    }
}

/// A parsed `[name]` section with its `key = value` entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Read the sections of an INI document in file order.
///
/// Comments (`#`, `;`) and blank lines are skipped, as are entries that
/// appear before the first section header.
pub fn read_sections(text: &str) -> Vec<IniSection> {
    let mut sections: Vec<IniSection> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push(IniSection {
                name: name.trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }

        if let (Some(section), Some((key, value))) = (sections.last_mut(), line.split_once('=')) {
            section
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    sections
}

/// Sections other than `[common]`, i.e. the configured proxies
pub fn read_proxies(text: &str) -> Vec<IniSection> {
    read_sections(text)
        .into_iter()
        .filter(|s| s.name != RESERVED_SECTION)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelType;

    fn session() -> Session {
        Session {
            server_url: "https://tunnel.example.com:8000".to_string(),
            access_token: "access".to_string(),
            tunnel_token: "frp-secret".to_string(),
            user_email: "dev@example.com".to_string(),
            logged_in_at: None,
        }
    }

    #[test]
    fn test_render_common_section() {
        let config = render(&session(), &[], &RenderOptions::default()).unwrap();
        let text = config.text();

        assert!(text.starts_with("[common]\n"));
        assert!(text.contains("server_addr = tunnel.example.com\n"));
        assert!(text.contains("server_port = 7000\n"));
        assert!(text.contains("token = frp-secret\n"));
        assert!(config.is_empty());
    }

    #[test]
    fn test_render_http_and_tcp() {
        let tunnels = vec![
            TunnelDefinition::http("api", 8080, "api"),
            TunnelDefinition::tcp("db", 5432, 15432),
        ];
        let config = render(&session(), &tunnels, &RenderOptions::default()).unwrap();
        let text = config.text();

        assert!(text.contains(
            "[api]\ntype = http\nlocal_ip = 127.0.0.1\nlocal_port = 8080\nsubdomain = api\n"
        ));
        assert!(text.contains("[db]\ntype = tcp\nlocal_ip = 127.0.0.1\nlocal_port = 5432\nremote_port = 15432\n"));
        assert_eq!(config.proxy_names(), vec!["api", "db"]);
    }

    #[test]
    fn test_round_trip_cardinality() {
        let mut tunnels: Vec<TunnelDefinition> = (0..12)
            .map(|i| TunnelDefinition::http(&format!("web-{}", i), 3000 + i, &format!("web{}", i)))
            .collect();
        let mut ssh = TunnelDefinition::tcp("shell", 22, 2222);
        ssh.kind = TunnelType::Ssh;
        tunnels.push(ssh);
        let mut udp = TunnelDefinition::tcp("dns", 53, 5353);
        udp.kind = TunnelType::Udp;
        tunnels.push(udp);

        let config = render(&session(), &tunnels, &RenderOptions::default()).unwrap();
        let proxies = read_proxies(&config.text());

        assert_eq!(proxies.len(), tunnels.len());
        assert_eq!(read_sections(&config.text()).len(), tunnels.len() + 1);
        for (section, def) in proxies.iter().zip(&tunnels) {
            assert_eq!(section.name, def.name);
            assert_eq!(section.get("local_port"), Some(def.local_port.to_string().as_str()));
        }
    }

    #[test]
    fn test_duplicate_name_fails() {
        let tunnels = vec![
            TunnelDefinition::http("api", 8080, "api"),
            TunnelDefinition::tcp("api", 5432, 15432),
        ];
        assert_eq!(
            render(&session(), &tunnels, &RenderOptions::default()),
            Err(RenderError::DuplicateName("api".to_string()))
        );
    }

    #[test]
    fn test_missing_required_field() {
        let mut def = TunnelDefinition::tcp("db", 5432, 1);
        def.remote_port = None;

        let err = render(&session(), &[def], &RenderOptions::default()).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingField {
                name: "db".to_string(),
                field: "remote_port",
            }
        );
        assert_eq!(err.tunnel(), Some("db"));
    }

    #[test]
    fn test_injection_is_rejected_not_sanitized() {
        let def = TunnelDefinition::http("api]\n[evil", 8080, "api");
        assert!(matches!(
            render(&session(), &[def], &RenderOptions::default()),
            Err(RenderError::IllegalValue { field: "name", .. })
        ));

        let def = TunnelDefinition::http("api", 8080, "api\ntoken = stolen");
        assert!(matches!(
            render(&session(), &[def], &RenderOptions::default()),
            Err(RenderError::IllegalValue { field: "subdomain", .. })
        ));

        let mut bad_session = session();
        bad_session.tunnel_token = "x\n[evil]".to_string();
        assert_eq!(
            render(&bad_session, &[], &RenderOptions::default()),
            Err(RenderError::IllegalSetting("tunnel_token"))
        );
    }

    #[test]
    fn test_reserved_section_name() {
        let def = TunnelDefinition::http("common", 8080, "api");
        assert!(render(&session(), &[def], &RenderOptions::default()).is_err());
    }

    #[test]
    fn test_port_range_checked() {
        let def = TunnelDefinition::tcp("db", 0, 15432);
        assert!(matches!(
            render(&session(), &[def], &RenderOptions::default()),
            Err(RenderError::PortOutOfRange { field: "local_port", value: 0, .. })
        ));
    }

    #[test]
    fn test_ssh_is_rendered_as_tcp() {
        let mut def = TunnelDefinition::tcp("shell", 22, 2222);
        def.kind = TunnelType::Ssh;
        def.ssh_user = Some("deploy".to_string());

        let config = render(&session(), &[def], &RenderOptions::default()).unwrap();
        let proxies = read_proxies(&config.text());
        assert_eq!(proxies[0].get("type"), Some("tcp"));
        assert_eq!(proxies[0].get("ssh_user"), None);
    }

    #[test]
    fn test_server_host() {
        assert_eq!(server_host("https://tunnel.example.com:8000").unwrap(), "tunnel.example.com");
        assert_eq!(server_host("tunnel.example.com").unwrap(), "tunnel.example.com");
        assert_eq!(server_host("10.0.0.5:8000").unwrap(), "10.0.0.5");
        assert_eq!(server_host("http://[::1]:8000/").unwrap(), "::1");
        assert!(server_host("").is_err());
        assert!(server_host("http://").is_err());
    }

    #[test]
    fn test_admin_binding_in_common() {
        let options = RenderOptions {
            server_port: 7001,
            admin: Some(AdminBinding {
                addr: "127.0.0.1".to_string(),
                port: 7400,
                user: Some("admin".to_string()),
                password: Some("pw".to_string()),
            }),
        };
        let config = render(&session(), &[], &options).unwrap();
        let sections = read_sections(&config.text());

        assert_eq!(sections.len(), 1);
        let common = &sections[0];
        assert_eq!(common.get("server_port"), Some("7001"));
        assert_eq!(common.get("admin_addr"), Some("127.0.0.1"));
        assert_eq!(common.get("admin_port"), Some("7400"));
        assert_eq!(common.get("admin_user"), Some("admin"));
        assert_eq!(common.get("admin_pwd"), Some("pw"));
    }

    #[test]
    fn test_drained_keeps_common_only() {
        let tunnels = vec![TunnelDefinition::http("api", 8080, "api")];
        let config = render(&session(), &tunnels, &RenderOptions::default()).unwrap();
        let drained = config.drained();

        assert!(drained.is_empty());
        assert!(drained.text().contains("token = frp-secret"));
        assert!(!drained.text().contains("[api]"));
    }

    #[test]
    fn test_read_sections_skips_comments() {
        let text = "stray = 1\n# comment\n[common]\n; note\nserver_addr = x\n\n[web]\ntype=http\n";
        let sections = read_sections(text);

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].entries.len(), 1);
        assert_eq!(sections[1].get("type"), Some("http"));
    }
}
