// Authentication middleware - turns the Authorization header into an `Actor`
// request extension, or rejects the request before it reaches a handler.
//
// Failure modes map to distinct statuses: a missing or malformed header is
// the caller's formatting problem (400), an unresolvable token is an
// authentication failure (401), and a resolved actor whose entitlement is
// switched off is an authorization failure (403). The 401 and 403 paths also
// emit usage events so denied traffic shows up in accounting.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::actor::Sources;
use crate::events::{Event, EventDispatcher, EventName};
use crate::proxy::error::GatewayError;

use std::sync::Arc;

#[derive(Clone)]
pub struct AuthState {
    pub sources: Arc<Sources>,
    pub events: EventDispatcher,
}

/// Extract the bearer token, if the Authorization header is well-formed.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Resolve the caller and attach the actor to the request, or short-circuit
/// with an error response.
pub async fn require_actor(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        return GatewayError::BadRequest(
            "missing or malformed Authorization header, expected 'Bearer <token>'".to_string(),
        )
        .into_response();
    };

    let actor = match state.sources.get(token).await {
        Ok(actor) => actor,
        Err(err) => {
            tracing::debug!("token rejected: {err:#}");
            state.events.dispatch(Event::anonymous(EventName::Unauthorized));
            return GatewayError::Unauthorized("invalid access token".to_string()).into_response();
        }
    };

    if !actor.access_enabled {
        state.events.dispatch(Event::new(
            EventName::AccessDenied,
            &actor.source_name,
            &actor.id,
        ));
        return GatewayError::AccessDenied("access disabled for this subscription".to_string())
            .into_response();
    }

    request.extensions_mut().insert(actor);
    next.run(request).await
}
