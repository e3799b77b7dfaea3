//! Bearer-token auth.
//!
//! - Every protected request carries `Authorization: Bearer <jwt>` signed
//!   with `JWT_SECRET`; the `sub` claim is the user id.
//! - With `DEV_MODE=true` tokens are not checked and the caller is taken
//!   from the `x-user-id` header (default `dev-user`).

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{DecodingKey, Validation};

use super::error::error_response;
use super::routes::AppState;

/// Header naming the caller in dev mode.
pub const DEV_USER_HEADER: &str = "x-user-id";
const DEV_USER_DEFAULT: &str = "dev-user";

/// The authenticated caller, inserted as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct Claims {
    /// User id
    pub sub: String,
    /// Expiration unix seconds
    pub exp: i64,
}

fn verify_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

fn dev_user(req: &Request<Body>) -> String {
    req.headers()
        .get(DEV_USER_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEV_USER_DEFAULT)
        .to_string()
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if state.config.dev_mode {
        let id = dev_user(&req);
        req.extensions_mut().insert(AuthUser { id });
        return next.run(req).await;
    }

    // Fail closed when auth is not configured
    let Some(secret) = state.config.auth.jwt_secret.as_deref() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "auth_not_configured",
            "JWT_SECRET not configured",
        )
        .into_response();
    };

    let auth_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let token = auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .unwrap_or("");

    if token.is_empty() {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "Missing Authorization header",
        )
        .into_response();
    }

    match verify_jwt(token, secret) {
        Ok(claims) if !claims.sub.trim().is_empty() => {
            req.extensions_mut().insert(AuthUser { id: claims.sub });
            next.run(req).await
        }
        Ok(_) => error_response(StatusCode::UNAUTHORIZED, "unauthenticated", "Token has no subject")
            .into_response(),
        Err(_) => error_response(
            StatusCode::UNAUTHORIZED,
            "unauthenticated",
            "Invalid or expired token",
        )
        .into_response(),
    }
}

#[cfg(test)]
pub(crate) fn issue_test_token(secret: &str, user_id: &str) -> String {
    use jsonwebtoken::{EncodingKey, Header};

    let claims = Claims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip_with_the_right_secret_only() {
        let token = issue_test_token("s3cret", "alice");
        assert_eq!(verify_jwt(&token, "s3cret").unwrap().sub, "alice");
        assert!(verify_jwt(&token, "other").is_err());
        assert!(verify_jwt("not-a-jwt", "s3cret").is_err());
    }

    #[test]
    fn dev_user_defaults_when_header_missing() {
        let req = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(dev_user(&req), "dev-user");
        let req = Request::builder()
            .header(DEV_USER_HEADER, " bob ")
            .body(Body::empty())
            .unwrap();
        assert_eq!(dev_user(&req), "bob");
    }
}
