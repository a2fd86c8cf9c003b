use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
};
use axum_extra::extract::cookie::CookieJar;
use pqwatch_core::{ActorId, IdentityProvider};
use serde::{Deserialize, Serialize};
use specta::Type;

use crate::state::AppState;

pub const ACCESS_COOKIE_NAME: &str = "access";

const JWT_ISSUER: &str = "pqwatch";
const JWT_AUDIENCE: &str = "pqwatch-web";

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

pub(crate) fn json_error(code: StatusCode, message: impl Into<String>) -> impl IntoResponse {
    (code, Json(ErrorBody { message: message.into() }))
}

/// Operator identity carried by a valid access token.
#[derive(Clone, Debug, Serialize, Type)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
}

impl IdentityProvider for AuthUser {
    fn current_actor_id(&self) -> Option<ActorId> {
        self.user_id.parse().ok()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub(crate) sub: String,
    pub(crate) username: String,
    #[serde(default)]
    pub(crate) is_admin: bool,
    pub(crate) exp: usize,
    pub(crate) iat: usize,
    pub(crate) iss: String,
    pub(crate) aud: String,
}

pub fn validate_access_jwt(token: &str, secret: &[u8]) -> anyhow::Result<AuthUser> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[JWT_AUDIENCE]);
    validation.set_issuer(&[JWT_ISSUER]);

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret),
        &validation,
    )?;

    Ok(AuthUser {
        user_id: data.claims.sub,
        username: data.claims.username,
        is_admin: data.claims.is_admin,
    })
}

/// Access token from the `access` cookie, falling back to a bearer header for
/// non-browser clients.
pub fn access_token(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(c) = jar.get(ACCESS_COOKIE_NAME) {
        return Some(c.value().to_string());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn whoami(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let token = match access_token(&headers) {
        Some(t) => t,
        None => return json_error(StatusCode::UNAUTHORIZED, "missing access token").into_response(),
    };

    match validate_access_jwt(&token, &state.config.jwt_secret) {
        Ok(me) => (StatusCode::OK, Json(me)).into_response(),
        Err(_) => json_error(StatusCode::UNAUTHORIZED, "invalid access token").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const SECRET: &[u8] = b"test-secret";

    fn token_for(sub: &str, secret: &[u8], iss: &str) -> String {
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: sub.to_string(),
            username: "ana".to_string(),
            is_admin: false,
            exp: now + 300,
            iat: now,
            iss: iss.to_string(),
            aud: JWT_AUDIENCE.to_string(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_actor() {
        let id = uuid::Uuid::new_v4();
        let user = validate_access_jwt(&token_for(&id.to_string(), SECRET, JWT_ISSUER), SECRET)
            .unwrap();
        assert_eq!(user.username, "ana");
        assert_eq!(user.current_actor_id(), Some(ActorId(id)));
    }

    #[test]
    fn wrong_secret_or_issuer_is_rejected() {
        let sub = uuid::Uuid::new_v4().to_string();
        assert!(validate_access_jwt(&token_for(&sub, b"other", JWT_ISSUER), SECRET).is_err());
        assert!(validate_access_jwt(&token_for(&sub, SECRET, "someone-else"), SECRET).is_err());
    }

    #[test]
    fn non_uuid_subject_has_no_actor() {
        let user = validate_access_jwt(&token_for("svc-reporter", SECRET, JWT_ISSUER), SECRET)
            .unwrap();
        assert_eq!(user.current_actor_id(), None);
    }

    #[test]
    fn token_from_cookie_or_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(access_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(access_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("access=from-cookie; other=1"),
        );
        assert_eq!(access_token(&headers).as_deref(), Some("from-cookie"));
    }
}
