use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const SESSION_TOKEN_TYP: &str = "ws-session";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub typ: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Session-token verification failures. `Expired` is distinguishable so the
/// session manager can close with 4001 (refresh) rather than 4401 (revoked).
#[derive(Debug, PartialEq, Eq)]
pub enum SessionTokenError {
    Expired,
    Invalid,
}

/// Mints and verifies the short-lived HS256 tokens node agents use for WS
/// upgrades. Key rotation: sign with the first secret, accept any.
pub struct SessionTokenService {
    signing: EncodingKey,
    accepting: Vec<DecodingKey>,
    issuer: String,
    audience: String,
    ttl_seconds: u64,
}

impl SessionTokenService {
    pub fn new(secrets: &[String], issuer: String, audience: String, ttl_seconds: u64) -> Self {
        assert!(
            !secrets.is_empty(),
            "session token service requires at least one secret"
        );
        Self {
            signing: EncodingKey::from_secret(secrets[0].as_bytes()),
            accepting: secrets
                .iter()
                .map(|s| DecodingKey::from_secret(s.as_bytes()))
                .collect(),
            issuer,
            audience,
            ttl_seconds,
        }
    }

    /// Mint a token bound to `node_id`. Returns `(token, expires_in_seconds)`.
    pub fn mint(&self, node_id: &str) -> Result<(String, u64), jsonwebtoken::errors::Error> {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: node_id.to_string(),
            typ: SESSION_TOKEN_TYP.to_string(),
            iat: now,
            nbf: now,
            exp: now + self.ttl_seconds as i64,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.signing)?;
        Ok((token, self.ttl_seconds))
    }

    /// Verify against every accepted secret. Enforces typ, issuer/audience,
    /// a positive lifetime no longer than the configured TTL, and a
    /// non-future `iat`.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, SessionTokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.validate_nbf = true;
        validation.leeway = 0;

        let mut saw_expired = false;
        for key in &self.accepting {
            match jsonwebtoken::decode::<SessionClaims>(token, key, &validation) {
                Ok(data) => {
                    let claims = data.claims;
                    if claims.typ != SESSION_TOKEN_TYP {
                        return Err(SessionTokenError::Invalid);
                    }
                    let lifetime = claims.exp - claims.iat;
                    if lifetime <= 0 || lifetime > self.ttl_seconds as i64 {
                        return Err(SessionTokenError::Invalid);
                    }
                    if claims.iat > Utc::now().timestamp() {
                        return Err(SessionTokenError::Invalid);
                    }
                    return Ok(claims);
                }
                Err(err) => {
                    if matches!(
                        err.kind(),
                        jsonwebtoken::errors::ErrorKind::ExpiredSignature
                    ) {
                        saw_expired = true;
                    }
                }
            }
        }
        if saw_expired {
            Err(SessionTokenError::Expired)
        } else {
            Err(SessionTokenError::Invalid)
        }
    }
}
