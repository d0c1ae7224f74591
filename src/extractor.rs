use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::AppError;

pub const SESSION_COOKIE: &str = "auth_token";

/// Session verification settings, installed as a request extension.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub secret: Option<String>,
}

impl SessionConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    pub fn from_env() -> Self {
        Self {
            secret: crate::config::JWT_SECRET.clone(),
        }
    }
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    email: String,
    #[allow(dead_code)]
    exp: usize,
}

/// key: session-user -> authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let secret = parts
            .extensions
            .get::<SessionConfig>()
            .and_then(|config| config.secret.clone())
            .ok_or_else(|| {
                AppError::SessionUnavailable("session signing secret is not configured".into())
            })?;

        let token_opt = if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookies = cookie_header.to_str().unwrap_or("");
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix(SESSION_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(|s| s.to_string())
            })
        } else {
            None
        };
        let token_opt = token_opt.or_else(|| {
            parts
                .headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|authz| authz.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
        });
        let token = token_opt.ok_or_else(|| AppError::Unauthorized("missing session".into()))?;

        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Unauthorized("invalid session".into()))?;
        Ok(AuthUser {
            user_id: decoded.claims.sub,
            email: decoded.claims.email,
        })
    }
}
