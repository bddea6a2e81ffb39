pub mod session_tokens;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::bad_request(format!("unknown role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub role: Role,
    pub roles: Vec<Role>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

/// Operator/admin JWT issuance and verification (HS256).
pub struct JwtAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    ttl_seconds: u64,
}

impl JwtAuth {
    pub fn new(secret: &str, issuer: String, audience: String, ttl_seconds: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            audience,
            ttl_seconds,
        }
    }

    /// Issue a token for the given role. Returns the token and its lifetime
    /// in seconds.
    pub fn issue(&self, role: Role) -> AppResult<(String, u64)> {
        let now = Utc::now().timestamp();
        let mut jti_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut jti_bytes);
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: role.as_str().to_string(),
            role,
            roles: vec![role],
            iat: now,
            nbf: now,
            exp: now + self.ttl_seconds as i64,
            jti: URL_SAFE_NO_PAD.encode(jti_bytes),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| {
            tracing::error!(error = %err, "failed to sign JWT");
            AppError::internal("Internal server error")
        })?;
        Ok((token, self.ttl_seconds))
    }

    pub fn verify(&self, token: &str) -> AppResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.validate_nbf = true;
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| AppError::unauthorized("Missing or invalid token"))?;
        Ok(data.claims)
    }
}

/// Constant-time membership test against a configured token allowlist.
pub fn token_in_list(candidate: &str, allowlist: &[String]) -> bool {
    let mut matched = 0u8;
    for token in allowlist {
        if token.len() == candidate.len() {
            matched |= token.as_bytes().ct_eq(candidate.as_bytes()).unwrap_u8();
        }
    }
    matched == 1
}

fn bearer_token(parts: &Parts) -> AppResult<String> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::unauthorized("Missing or invalid token"))
}

/// Extractor for routes requiring at least the operator role.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

impl<S> FromRequestParts<S> for AuthUser
where
    Arc<JwtAuth>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let jwt = Arc::<JwtAuth>::from_ref(state);
        let token = bearer_token(parts);
        async move {
            let claims = jwt.verify(&token?)?;
            Ok(AuthUser(claims))
        }
    }
}

/// Extractor for admin-only routes; role violations are 403, not 401.
#[derive(Debug, Clone)]
pub struct AdminUser(pub Claims);

impl<S> FromRequestParts<S> for AdminUser
where
    Arc<JwtAuth>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let jwt = Arc::<JwtAuth>::from_ref(state);
        let token = bearer_token(parts);
        async move {
            let claims = jwt.verify(&token?)?;
            if claims.role != Role::Admin {
                return Err(AppError::forbidden("Admin role required"));
            }
            Ok(AdminUser(claims))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt() -> JwtAuth {
        JwtAuth::new(
            "test-secret-0123456789",
            "woly-server".to_string(),
            "woly-api".to_string(),
            3600,
        )
    }

    #[test]
    fn issues_and_verifies_operator_token() {
        let auth = jwt();
        let (token, ttl) = auth.issue(Role::Operator).unwrap();
        assert_eq!(ttl, 3600);

        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.role, Role::Operator);
        assert_eq!(claims.roles, vec![Role::Operator]);
        assert_eq!(claims.iss, "woly-server");
        assert!(claims.exp - claims.iat == 3600);
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn rejects_token_from_other_secret() {
        let (token, _) = jwt().issue(Role::Admin).unwrap();
        let other = JwtAuth::new(
            "another-secret-987654321",
            "woly-server".to_string(),
            "woly-api".to_string(),
            3600,
        );
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn rejects_wrong_audience() {
        let issuer = JwtAuth::new(
            "test-secret-0123456789",
            "woly-server".to_string(),
            "other-api".to_string(),
            3600,
        );
        let (token, _) = issuer.issue(Role::Operator).unwrap();
        assert!(jwt().verify(&token).is_err());
    }

    #[test]
    fn token_membership_is_exact() {
        let list = vec!["alpha".to_string(), "beta-longer".to_string()];
        assert!(token_in_list("alpha", &list));
        assert!(token_in_list("beta-longer", &list));
        assert!(!token_in_list("alph", &list));
        assert!(!token_in_list("gamma", &list));
        assert!(!token_in_list("", &list));
    }
}
