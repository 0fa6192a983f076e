//! Service errors and their JSON error responses

use crate::controller::ControlError;
use crate::remote::RemoteError;
use crate::render::RenderError;
use crate::store::StoreError;
use crate::tunnel::ValidationError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Name of the header carrying the error code
pub const ERROR_HEADER: &str = "x-tunnelctl-error";

/// Stable error codes of the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed request body or parameter
    BadRequest,
    /// Missing or wrong API token
    Unauthorized,
    /// Unknown route
    NotFound,
    /// Request body over the size limit
    PayloadTooLarge,
    /// Tunnel fields failed validation
    InvalidTunnel,
    /// Tunnel name already in use
    DuplicateTunnel,
    /// Tunnel set could not be rendered
    RenderFailed,
    /// No session is cached
    NotAuthenticated,
    /// Login rejected by the coordination service
    InvalidCredentials,
    /// Coordination service rejected the cached token
    SessionExpired,
    TunnelNotFound,
    AlreadyRunning,
    NotRunning,
    /// A stop or reload is still in progress
    ClientBusy,
    BinaryNotFound,
    StartFailed,
    StopFailed,
    ConfigWriteFailed,
    ReloadFailed,
    AdminApiError,
    /// Coordination service answered with an error
    RemoteError,
    ServerUnreachable,
    ServerTimeout,
    StoreError,
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::InvalidTunnel => StatusCode::BAD_REQUEST,
            ErrorCode::DuplicateTunnel => StatusCode::BAD_REQUEST,
            ErrorCode::RenderFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::NotAuthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ErrorCode::SessionExpired => StatusCode::UNAUTHORIZED,
            ErrorCode::TunnelNotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyRunning => StatusCode::CONFLICT,
            ErrorCode::NotRunning => StatusCode::CONFLICT,
            ErrorCode::ClientBusy => StatusCode::CONFLICT,
            ErrorCode::BinaryNotFound => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StartFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StopFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ConfigWriteFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ReloadFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::AdminApiError => StatusCode::BAD_GATEWAY,
            ErrorCode::RemoteError => StatusCode::BAD_GATEWAY,
            ErrorCode::ServerUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ServerTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Tunnelctl-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::InvalidTunnel => "INVALID_TUNNEL",
            ErrorCode::DuplicateTunnel => "DUPLICATE_TUNNEL",
            ErrorCode::RenderFailed => "RENDER_FAILED",
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::TunnelNotFound => "TUNNEL_NOT_FOUND",
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::NotRunning => "NOT_RUNNING",
            ErrorCode::ClientBusy => "CLIENT_BUSY",
            ErrorCode::BinaryNotFound => "BINARY_NOT_FOUND",
            ErrorCode::StartFailed => "START_FAILED",
            ErrorCode::StopFailed => "STOP_FAILED",
            ErrorCode::ConfigWriteFailed => "CONFIG_WRITE_FAILED",
            ErrorCode::ReloadFailed => "RELOAD_FAILED",
            ErrorCode::AdminApiError => "ADMIN_API_ERROR",
            ErrorCode::RemoteError => "REMOTE_ERROR",
            ErrorCode::ServerUnreachable => "SERVER_UNREACHABLE",
            ErrorCode::ServerTimeout => "SERVER_TIMEOUT",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Everything a service operation can fail with
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),
}

impl From<RemoteError> for ServiceError {
    fn from(e: RemoteError) -> Self {
        ServiceError::Store(StoreError::Remote(e))
    }
}

impl ServiceError {
    pub fn not_authenticated() -> Self {
        RemoteError::NotAuthenticated.into()
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Validation(ValidationError::DuplicateName(_)) => {
                ErrorCode::DuplicateTunnel
            }
            ServiceError::Validation(_) => ErrorCode::InvalidTunnel,
            ServiceError::Render(_) => ErrorCode::RenderFailed,
            ServiceError::BadRequest(_) => ErrorCode::BadRequest,
            ServiceError::Control(e) => match e {
                ControlError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
                ControlError::NotRunning => ErrorCode::NotRunning,
                ControlError::Busy(_) => ErrorCode::ClientBusy,
                ControlError::BinaryNotFound(_) => ErrorCode::BinaryNotFound,
                ControlError::Start(_) => ErrorCode::StartFailed,
                ControlError::Stop(_) => ErrorCode::StopFailed,
                ControlError::WriteConfig { .. } => ErrorCode::ConfigWriteFailed,
                ControlError::Reload(_) => ErrorCode::ReloadFailed,
                ControlError::Admin(_) => ErrorCode::AdminApiError,
            },
            ServiceError::Store(e) => match e {
                StoreError::NotFound(_) => ErrorCode::TunnelNotFound,
                StoreError::File { .. } => ErrorCode::StoreError,
                StoreError::Remote(remote) => match remote {
                    RemoteError::NotAuthenticated => ErrorCode::NotAuthenticated,
                    RemoteError::InvalidCredentials => ErrorCode::InvalidCredentials,
                    RemoteError::SessionExpired => ErrorCode::SessionExpired,
                    RemoteError::NotFound(_) => ErrorCode::TunnelNotFound,
                    RemoteError::Status { .. } | RemoteError::Decode(_) => ErrorCode::RemoteError,
                    RemoteError::Network(_) => ErrorCode::ServerUnreachable,
                    RemoteError::Timeout => ErrorCode::ServerTimeout,
                },
            },
        }
    }

    /// HTTP status; client errors from the coordination service pass through
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Store(StoreError::Remote(RemoteError::Status { status, .. }))
                if (400..500).contains(status) =>
            {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            other => other.code().status_code(),
        }
    }

    pub fn to_response(&self) -> Response<Full<Bytes>> {
        error_response(self.status(), self.code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// JSON error response with the code's default status
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    error_response(code.status_code(), code, message)
}

/// JSON error response with X-Tunnelctl-Error header
pub fn error_response(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let mut error = ErrorResponse::new(code, message);
    error.status = status.as_u16();

    let mut response = Response::new(Full::new(Bytes::from(error.to_json())));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ERROR_HEADER, HeaderValue::from_static(code.as_header_value()));
    response
}
