//! Client for the remote coordination service
//!
//! The coordination service is the durable store of tunnel definitions and
//! issues both the bearer token for its own API and the token frpc presents
//! to the tunnel server.

use crate::session::Session;
use crate::tunnel::{TunnelDefinition, TunnelRecord};
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failures talking to the coordination service
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("session expired - please login again")]
    SessionExpired,

    #[error("tunnel {0} not found")]
    NotFound(i64),

    /// Non-2xx answer, with the server's own detail message
    #[error("{detail}")]
    Status { status: u16, detail: String },

    #[error("server connection error: {0}")]
    Network(String),

    #[error("server connection timeout")]
    Timeout,

    #[error("invalid response from server: {0}")]
    Decode(String),
}

impl RemoteError {
    /// The cached session is no longer usable
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::NotAuthenticated | Self::SessionExpired)
    }

    /// The server could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// Trim trailing slashes and default to `http://` when no scheme is given
pub fn normalize_server_url(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() {
        return None;
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(url.to_string())
    } else {
        Some(format!("http://{}", url))
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    user: LoginUser,
}

#[derive(Deserialize, Default)]
struct LoginUser {
    token: Option<String>,
    tunnel_token: Option<String>,
}

#[derive(Deserialize)]
struct TunnelList {
    #[serde(default)]
    tunnels: Vec<TunnelRecord>,
}

/// Single-tunnel responses come bare or wrapped in `{"tunnel": ...}`
#[derive(Deserialize)]
#[serde(untagged)]
enum TunnelEnvelope {
    Wrapped { tunnel: TunnelRecord },
    Bare(TunnelRecord),
}

impl TunnelEnvelope {
    fn into_record(self) -> TunnelRecord {
        match self {
            TunnelEnvelope::Wrapped { tunnel } => tunnel,
            TunnelEnvelope::Bare(record) => record,
        }
    }
}

/// HTTP client for the coordination API
#[derive(Clone)]
pub struct CoordinationClient {
    http: Client,
}

impl CoordinationClient {
    pub fn new(timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http }
    }

    /// Exchange email and password for a session
    pub async fn login(
        &self,
        server_url: &str,
        email: &str,
        password: &str,
    ) -> Result<Session, RemoteError> {
        let response = self
            .http
            .post(format!("{}/api/auth/login", server_url))
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;
        let response = check(response, RemoteError::InvalidCredentials).await?;

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        let tunnel_token = body
            .user
            .token
            .filter(|t| !t.is_empty())
            .or(body.user.tunnel_token)
            .unwrap_or_default();

        Ok(Session {
            server_url: server_url.to_string(),
            access_token: body.access_token,
            tunnel_token,
            user_email: email.to_string(),
            logged_in_at: Some(Utc::now()),
        })
    }

    pub async fn list_tunnels(&self, session: &Session) -> Result<Vec<TunnelRecord>, RemoteError> {
        let response = self
            .http
            .get(tunnels_url(session))
            .bearer_auth(&session.access_token)
            .send()
            .await?;
        let response = check(response, RemoteError::SessionExpired).await?;

        let list: TunnelList = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        debug!(count = list.tunnels.len(), "Fetched tunnels");
        Ok(list.tunnels)
    }

    pub async fn create_tunnel(
        &self,
        session: &Session,
        definition: &TunnelDefinition,
    ) -> Result<TunnelRecord, RemoteError> {
        let response = self
            .http
            .post(tunnels_url(session))
            .bearer_auth(&session.access_token)
            .json(definition)
            .send()
            .await?;
        let response = check(response, RemoteError::SessionExpired).await?;

        let envelope: TunnelEnvelope = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(envelope.into_record())
    }

    pub async fn update_tunnel(
        &self,
        session: &Session,
        id: i64,
        definition: &TunnelDefinition,
    ) -> Result<TunnelRecord, RemoteError> {
        let response = self
            .http
            .put(format!("{}/{}", tunnels_url(session), id))
            .bearer_auth(&session.access_token)
            .json(definition)
            .send()
            .await?;
        let response = check(response, RemoteError::SessionExpired)
            .await
            .map_err(|e| not_found_as(e, id))?;

        // Some servers answer an update with a bare acknowledgement
        let text = response.text().await?;
        match serde_json::from_str::<TunnelEnvelope>(&text) {
            Ok(envelope) => Ok(envelope.into_record()),
            Err(_) => Ok(TunnelRecord::new(id, definition.clone())),
        }
    }

    pub async fn delete_tunnel(&self, session: &Session, id: i64) -> Result<(), RemoteError> {
        let response = self
            .http
            .delete(format!("{}/{}", tunnels_url(session), id))
            .bearer_auth(&session.access_token)
            .send()
            .await?;
        check(response, RemoteError::SessionExpired)
            .await
            .map_err(|e| not_found_as(e, id))?;
        Ok(())
    }

    /// Report whether the tunnel is currently served
    pub async fn set_active(
        &self,
        session: &Session,
        id: i64,
        is_active: bool,
    ) -> Result<(), RemoteError> {
        let response = self
            .http
            .put(format!("{}/{}/status", tunnels_url(session), id))
            .bearer_auth(&session.access_token)
            .json(&serde_json::json!({ "is_active": is_active }))
            .send()
            .await?;
        check(response, RemoteError::SessionExpired)
            .await
            .map_err(|e| not_found_as(e, id))?;
        Ok(())
    }
}

fn tunnels_url(session: &Session) -> String {
    format!("{}/api/tunnels", session.server_url.trim_end_matches('/'))
}

fn not_found_as(err: RemoteError, id: i64) -> RemoteError {
    match err {
        RemoteError::Status { status: 404, .. } => RemoteError::NotFound(id),
        other => other,
    }
}

/// Pass 2xx responses through, turn the rest into errors
async fn check(response: Response, unauthorized: RemoteError) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(unauthorized);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        detail: error_detail(status, &body),
    })
}

/// The server's `detail` field, or a truncated dump of whatever it sent
fn error_detail(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => match map.get("detail") {
            Some(Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => format!("Server returned {}", status.as_u16()),
        },
        _ => {
            let excerpt: String = body.chars().take(200).collect();
            format!("Server returned {}: {}", status.as_u16(), excerpt)
        }
    }
}
