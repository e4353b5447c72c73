// API error responses
// The NMOS error body and the WWW-Authenticate challenges

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::{AuthorizationErrorKind, NmosError};

/// An error rendered as the NMOS `{code, error, debug}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub debug: Option<String>,
    /// `Location` header for 409 downgrade conflicts
    pub location: Option<String>,
    /// `WWW-Authenticate` challenge for 401/403
    pub challenge: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        ApiError {
            status,
            error: error.into(),
            debug: None,
            location: None,
            challenge: None,
        }
    }

    pub fn not_found() -> Self {
        ApiError::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn bad_request(debug: impl Into<String>) -> Self {
        ApiError {
            debug: Some(debug.into()),
            ..ApiError::new(StatusCode::BAD_REQUEST, "bad request")
        }
    }

    pub fn locked(debug: impl Into<String>) -> Self {
        ApiError {
            debug: Some(debug.into()),
            ..ApiError::new(StatusCode::LOCKED, "resource locked by a pending activation")
        }
    }

    pub fn internal(debug: impl Into<String>) -> Self {
        ApiError {
            debug: Some(debug.into()),
            ..ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }

    /// 409 pointing at the resource's canonical, higher-version location.
    pub fn downgrade_conflict(location: impl Into<String>) -> Self {
        ApiError {
            location: Some(location.into()),
            ..ApiError::new(
                StatusCode::CONFLICT,
                "resource requires a higher API version",
            )
        }
    }

    /// 401/403 with a bearer challenge, per the validation outcome.
    pub fn unauthorized(kind: AuthorizationErrorKind, realm: &str) -> Self {
        let (status, error_attribute) = match kind {
            AuthorizationErrorKind::WithoutAuthentication => (StatusCode::UNAUTHORIZED, None),
            AuthorizationErrorKind::InsufficientScope => {
                (StatusCode::FORBIDDEN, Some("insufficient_scope"))
            }
            AuthorizationErrorKind::NoMatchingKeys | AuthorizationErrorKind::Failed => {
                (StatusCode::UNAUTHORIZED, Some("invalid_token"))
            }
        };
        let mut challenge = format!("Bearer realm=\"{}\"", realm);
        if let Some(error_attribute) = error_attribute {
            challenge.push_str(&format!(", error=\"{}\"", error_attribute));
        }
        ApiError {
            challenge: Some(challenge),
            ..ApiError::new(status, format!("authorization failed: {}", kind))
        }
    }
}

impl From<NmosError> for ApiError {
    fn from(err: NmosError) -> Self {
        match err {
            NmosError::ResourceNotFound { .. } => ApiError::not_found(),
            NmosError::Validation(debug) => ApiError::bad_request(debug),
            NmosError::LockedConflict(debug) => ApiError::locked(debug),
            NmosError::DowngradeConflict { location } => ApiError::downgrade_conflict(location),
            NmosError::Authorization { kind, message } => {
                let mut error = ApiError::unauthorized(kind, "nmos");
                error.debug = Some(message);
                error
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.status.as_u16(),
            "error": self.error,
            "debug": self.debug,
        });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(location) = self.location {
            if let Ok(value) = HeaderValue::from_str(&location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
        }
        if let Some(challenge) = self.challenge {
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
