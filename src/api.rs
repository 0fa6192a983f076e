//! HTTP control surface
//!
//! JSON over HTTP/1.1 and HTTP/2 on a single listener. Every `/api/*` route
//! except `/api/auth/status` and `/api/config` requires the bearer token when
//! one is configured.

use crate::error::{json_error_response, ErrorCode, ServiceError};
use crate::service::TunnelService;
use crate::store::ImportFailure;
use crate::tunnel::TunnelDefinition;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const X_REQUEST_ID: &str = "x-request-id";

/// Request bodies larger than this are rejected with 413
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    server_url: Option<String>,
    email: String,
    password: String,
}

/// Accepts a bare array or `{"tunnels": [...]}`
///
/// Records are kept as raw JSON so one malformed entry fails on its own
/// instead of rejecting the batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportRequest {
    Bare(Vec<serde_json::Value>),
    Wrapped { tunnels: Vec<serde_json::Value> },
}

impl ImportRequest {
    /// Split into records that parse and per-record failures for the rest
    fn into_definitions(self) -> (Vec<TunnelDefinition>, Vec<ImportFailure>) {
        let records = match self {
            ImportRequest::Bare(tunnels) | ImportRequest::Wrapped { tunnels } => tunnels,
        };

        let mut definitions = Vec::with_capacity(records.len());
        let mut failed = Vec::new();
        for record in records {
            let name = record
                .get("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string();
            match serde_json::from_value::<TunnelDefinition>(record) {
                Ok(definition) => definitions.push(definition),
                Err(e) => failed.push(ImportFailure {
                    name,
                    error: e.to_string(),
                }),
            }
        }
        (definitions, failed)
    }
}

pub struct ApiServer {
    bind_addr: SocketAddr,
    service: Arc<TunnelService>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Option<Arc<String>>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        service: Arc<TunnelService>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            bind_addr,
            service,
            shutdown_rx,
            auth_token: auth_token.filter(|t| !t.is_empty()).map(Arc::new),
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_token.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, auth = self.auth_enabled(), "Control API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let service = Arc::clone(&self.service);
                            let auth_token = self.auth_token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, service, auth_token).await {
                                    debug!(addr = %peer, error = %e, "Control API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    service: Arc<TunnelService>,
    auth_token: Option<Arc<String>>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let handler = service_fn(move |req| {
        let service = Arc::clone(&service);
        let token = auth_token.clone();
        async move { handle_request(req, service, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, handler)
        .await
        .map_err(|e| anyhow::anyhow!("Control API connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

fn requires_auth(path: &str) -> bool {
    path.starts_with("/api/") && path != "/api/auth/status" && path != "/api/config"
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Full<Bytes>>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(json_error_response(
                ErrorCode::PayloadTooLarge,
                format!("request body exceeds {} bytes", MAX_BODY_BYTES),
            ));
        }
        Err(e) => {
            return Err(json_error_response(
                ErrorCode::BadRequest,
                format!("failed to read request body: {}", e),
            ));
        }
    };

    serde_json::from_slice(&body).map_err(|e| {
        json_error_response(ErrorCode::BadRequest, format!("invalid JSON body: {}", e))
    })
}

/// Unwrap a parsed body or return its error response
macro_rules! body_or_return {
    ($req:expr) => {
        match read_json($req).await {
            Ok(body) => body,
            Err(response) => return response,
        }
    };
}

async fn handle_request(
    req: Request<Incoming>,
    service: Arc<TunnelService>,
    auth_token: Option<Arc<String>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(%method, %path, %request_id, "Control API request");

    let mut response = match &auth_token {
        Some(token) if requires_auth(&path) && !check_auth(&req, token) => {
            warn!(%path, %request_id, "Unauthorized control API request");
            json_error_response(ErrorCode::Unauthorized, "unauthorized")
        }
        _ => route(req, &method, &path, &service).await,
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn route(
    req: Request<Incoming>,
    method: &Method,
    path: &str,
    service: &TunnelService,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        (&Method::GET, "/api/config") => {
            let server_url = service.default_server_url();
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "server_url": server_url,
                    "server_configured": server_url.is_some(),
                }),
            )
        }

        (&Method::POST, "/api/login") => {
            let body: LoginRequest = body_or_return!(req);
            match service
                .login(body.server_url.as_deref(), &body.email, &body.password)
                .await
            {
                Ok(session) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "success": true,
                        "email": session.user_email,
                        "server_url": session.server_url,
                    }),
                ),
                Err(e) => e.to_response(),
            }
        }

        (&Method::POST, "/api/logout") => {
            service.logout().await;
            json_response(StatusCode::OK, &serde_json::json!({ "success": true }))
        }

        (&Method::GET, "/api/auth/status") => {
            json_response(StatusCode::OK, &service.auth_status().await)
        }

        (&Method::GET, "/api/status") => json_response(StatusCode::OK, &service.status().await),

        (&Method::POST, "/api/start") => respond(StatusCode::OK, service.start().await),
        (&Method::POST, "/api/stop") => respond(StatusCode::OK, service.stop().await),
        (&Method::POST, "/api/restart") => respond(StatusCode::OK, service.restart().await),

        (&Method::POST, "/api/reload") => respond(
            StatusCode::OK,
            service
                .apply_and_reload()
                .await
                .map(|outcome| serde_json::json!({ "applied": outcome })),
        ),

        (&Method::GET, "/api/tunnels") => respond(
            StatusCode::OK,
            service
                .list_tunnels()
                .await
                .map(|tunnels| serde_json::json!({ "tunnels": tunnels })),
        ),

        (&Method::POST, "/api/tunnels") => {
            let definition: TunnelDefinition = body_or_return!(req);
            respond(StatusCode::CREATED, service.create_tunnel(definition).await)
        }

        (&Method::POST, "/api/tunnels/import") => {
            let body: ImportRequest = body_or_return!(req);
            let (definitions, malformed) = body.into_definitions();
            if !malformed.is_empty() {
                debug!(count = malformed.len(), "Skipping malformed import records");
            }
            let result = service.import_tunnels(definitions).await.map(|mut synced| {
                synced.value.failed.extend(malformed);
                synced
            });
            respond(StatusCode::OK, result)
        }

        (method, path) if path.starts_with("/api/tunnels/") => {
            let Some(id) = parse_tunnel_id(path) else {
                return json_error_response(ErrorCode::NotFound, "not found");
            };
            match *method {
                Method::PUT => {
                    let definition: TunnelDefinition = body_or_return!(req);
                    respond(StatusCode::OK, service.update_tunnel(id, definition).await)
                }
                Method::DELETE => respond(
                    StatusCode::OK,
                    service.delete_tunnel(id).await.map(|synced| {
                        serde_json::json!({ "deleted": id, "applied": synced.applied })
                    }),
                ),
                _ => json_error_response(ErrorCode::BadRequest, "method not allowed"),
            }
        }

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    }
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, ServiceError>) -> Response<Full<Bytes>> {
    match result {
        Ok(body) => json_response(status, &body),
        Err(e) => {
            debug!(code = e.code().as_header_value(), error = %e, "Control API request failed");
            e.to_response()
        }
    }
}

fn parse_tunnel_id(path: &str) -> Option<i64> {
    let rest = path.strip_prefix("/api/tunnels/")?;
    rest.trim_end_matches('/').parse().ok()
}
