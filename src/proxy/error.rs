// Errors the gateway itself originates, as opposed to upstream responses
// that are forwarded verbatim. The wire shape is always {"error": "<message>"}
// with the matching HTTP status.

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;

#[derive(Debug)]
pub enum GatewayError {
    /// Malformed request (missing auth header, undecodable body).
    BadRequest(String),
    /// Token could not be resolved to an actor.
    Unauthorized(String),
    /// Actor resolved but entitlement is disabled.
    AccessDenied(String),
    /// The upstream provider call failed before any byte was forwarded.
    /// Not retried: clients are expected to retry, the gateway does not
    /// hide upstream unavailability.
    Upstream(String),
    /// Internal failure building the request or response.
    Internal(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AccessDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            GatewayError::BadRequest(msg)
            | GatewayError::Unauthorized(msg)
            | GatewayError::AccessDenied(msg)
            | GatewayError::Upstream(msg)
            | GatewayError::Internal(msg) => msg,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let message = self.message();

        if status.is_server_error() {
            tracing::error!("gateway error: {} - {}", status, message);
        } else {
            tracing::debug!("gateway error: {} - {}", status, message);
        }

        let body = json!({ "error": message }).to_string();
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
