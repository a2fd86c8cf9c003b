use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::{self, json_error};
use crate::request_meta::RequestMeta;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn origin_is_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    // Treat missing Origin as a non-browser client (curl, ingest jobs).
    let origin = match headers.get(axum::http::header::ORIGIN) {
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
        None => return true,
    };
    allowed.iter().any(|a| a == origin)
}

fn incoming_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
}

// Middleware: reuse the caller's x-request-id or mint one, and echo it back.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let request_id =
        incoming_request_id(req.headers()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestMeta {
        request_id: request_id.clone(),
    });

    let mut resp = next.run(req).await;
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

// Middleware for /rspc: Origin allowlist on mutations, then identity.
//
// rspc-axum serves queries over GET and mutations over POST, so the method is
// enough to tell them apart. Queries may run anonymously; a mutation without a
// valid access token is refused before it reaches a procedure.
pub async fn rspc_auth_guard(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let mutating = is_unsafe_method(req.method());

    if mutating && !origin_is_allowed(req.headers(), &state.config.allowed_origins) {
        return json_error(StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let user = match auth::access_token(req.headers()) {
        Some(token) => match auth::validate_access_jwt(&token, &state.config.jwt_secret) {
            Ok(user) => Some(user),
            Err(err) => {
                tracing::debug!(%err, "rejected access token");
                None
            }
        },
        None => None,
    };

    match user {
        Some(user) => {
            req.extensions_mut().insert(user);
        }
        None if mutating => {
            return json_error(StatusCode::UNAUTHORIZED, "sign in required").into_response();
        }
        None => {}
    }

    next.run(req).await
}
