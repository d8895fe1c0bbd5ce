use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use http::header;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const MIN_SECRET_BYTES: usize = 32;

/// Verified identity for one request.
///
/// Only [`ContextVerifier::verify`] produces one from the outside world, and
/// nothing can change it afterwards: fields are private and there are no
/// setters. [`UserContext::with_permissions`] yields a separate value that has
/// to be issued as a fresh token before any stage will accept it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    identity_id: String,
    tenant_id: String,
    permissions: BTreeSet<String>,
    session_id: String,
    expires_at_epoch_secs: i64,
}

impl UserContext {
    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn expires_at_epoch_secs(&self) -> i64 {
        self.expires_at_epoch_secs
    }

    /// Time left before expiry, or `None` once expired.
    pub fn remaining(&self) -> Option<Duration> {
        let left = self.expires_at_epoch_secs - unix_now_secs();
        (left > 0).then(|| Duration::from_secs(left as u64))
    }

    pub fn with_permissions<I, S>(&self, extra: I) -> UserContext
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut permissions = self.permissions.clone();
        permissions.extend(extra.into_iter().map(Into::into));
        UserContext {
            identity_id: self.identity_id.clone(),
            tenant_id: self.tenant_id.clone(),
            permissions,
            session_id: self.session_id.clone(),
            expires_at_epoch_secs: self.expires_at_epoch_secs,
        }
    }

    /// Attributes handed to the policy engine as the principal.
    pub fn principal_attrs(&self) -> serde_json::Value {
        serde_json::json!({
            "identity_id": self.identity_id.as_str(),
            "tenant_id": self.tenant_id.as_str(),
            "permissions": &self.permissions,
            "session_id": self.session_id.as_str(),
        })
    }
}

/// Signed context token as carried between stages. Opaque outside this crate.
#[derive(Clone, PartialEq, Eq)]
pub struct ContextToken(String);

impl ContextToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ContextToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContextToken(..)")
    }
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub secret: Vec<u8>,
    pub issuer: String,
    pub audience: String,
    pub max_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    /// Every verification failure looks the same to the caller.
    fn rejected() -> Self {
        Self {
            code: "ERR_AUTHENTICATION",
            message: "authentication failed".to_string(),
        }
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: "ERR_INVALID_PARAMS",
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    aud: String,
    sub: String,
    tenant: String,
    perms: Vec<String>,
    sid: String,
    iat: i64,
    exp: i64,
    jti: String,
}

#[derive(Clone)]
pub struct ContextVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    max_ttl: Duration,
}

impl ContextVerifier {
    pub fn new(config: VerifierConfig) -> Result<Self, AuthError> {
        if config.secret.len() < MIN_SECRET_BYTES {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: format!("token secret must be at least {} bytes", MIN_SECRET_BYTES),
            });
        }
        if config.issuer.trim().is_empty() || config.audience.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "token issuer and audience must be non-empty".to_string(),
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256];
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_issuer(std::slice::from_ref(&config.issuer));
        validation.set_audience(std::slice::from_ref(&config.audience));
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(&config.secret),
            decoding_key: DecodingKey::from_secret(&config.secret),
            validation,
            issuer: config.issuer,
            audience: config.audience,
            max_ttl: config.max_ttl,
        })
    }

    pub fn issue<I, S>(
        &self,
        identity_id: &str,
        tenant_id: &str,
        permissions: I,
        ttl: Duration,
    ) -> Result<ContextToken, AuthError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.issue_at(identity_id, tenant_id, permissions, ttl, SystemTime::now())
    }

    pub fn issue_at<I, S>(
        &self,
        identity_id: &str,
        tenant_id: &str,
        permissions: I,
        ttl: Duration,
        issued_at: SystemTime,
    ) -> Result<ContextToken, AuthError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permissions = permissions
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<String>>();
        self.sign(
            identity_id,
            tenant_id,
            &permissions,
            Ulid::new().to_string().as_str(),
            ttl,
            issued_at,
        )
    }

    /// Issues a new token for a derived context, keeping its session.
    pub fn reissue(&self, context: &UserContext, ttl: Duration) -> Result<ContextToken, AuthError> {
        self.sign(
            &context.identity_id,
            &context.tenant_id,
            &context.permissions,
            &context.session_id,
            ttl,
            SystemTime::now(),
        )
    }

    fn sign(
        &self,
        identity_id: &str,
        tenant_id: &str,
        permissions: &BTreeSet<String>,
        session_id: &str,
        ttl: Duration,
        issued_at: SystemTime,
    ) -> Result<ContextToken, AuthError> {
        if !is_valid_id(identity_id) {
            return Err(AuthError::invalid_request("identity id is malformed"));
        }
        if !is_valid_id(tenant_id) {
            return Err(AuthError::invalid_request("tenant id is malformed"));
        }
        if let Some(bad) = permissions.iter().find(|p| !is_valid_permission(p)) {
            return Err(AuthError::invalid_request(format!(
                "permission `{}` is malformed",
                bad
            )));
        }
        if ttl.is_zero() || ttl > self.max_ttl {
            return Err(AuthError::invalid_request("ttl out of range"));
        }

        let iat = epoch_secs(issued_at);
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: identity_id.to_string(),
            tenant: tenant_id.to_string(),
            perms: permissions.iter().cloned().collect(),
            sid: session_id.to_string(),
            iat,
            exp: iat.saturating_add(ttl.as_secs().max(1) as i64),
            jti: Ulid::new().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map(ContextToken)
            .map_err(|_| AuthError {
                code: "ERR_INTERNAL",
                message: "failed to sign context token".to_string(),
            })
    }

    pub fn verify(&self, token: &ContextToken) -> Result<UserContext, AuthError> {
        let header = decode_header(token.as_str()).map_err(|err| {
            tracing::debug!(reason = %err, "auth.verify_rejected");
            AuthError::rejected()
        })?;
        if header.alg != Algorithm::HS256 {
            tracing::debug!(alg = ?header.alg, "auth.verify_rejected");
            return Err(AuthError::rejected());
        }

        let decoded = decode::<Claims>(token.as_str(), &self.decoding_key, &self.validation)
            .map_err(|err| {
                tracing::debug!(reason = %err, "auth.verify_rejected");
                AuthError::rejected()
            })?;
        let claims = decoded.claims;

        // Library exp check tolerates exp == now; the context is dead at exp.
        if unix_now_secs() >= claims.exp {
            tracing::debug!(reason = "expired", "auth.verify_rejected");
            return Err(AuthError::rejected());
        }

        if !is_valid_id(&claims.sub)
            || !is_valid_id(&claims.tenant)
            || !is_valid_id(&claims.sid)
            || !claims.perms.iter().all(|p| is_valid_permission(p))
        {
            tracing::debug!(reason = "malformed_claims", "auth.verify_rejected");
            return Err(AuthError::rejected());
        }

        Ok(UserContext {
            identity_id: claims.sub,
            tenant_id: claims.tenant,
            permissions: claims.perms.into_iter().collect(),
            session_id: claims.sid,
            expires_at_epoch_secs: claims.exp,
        })
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Result<ContextToken, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(AuthError::rejected)?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(AuthError::rejected)?;

    Ok(ContextToken(token.to_string()))
}

pub fn unix_now_secs() -> i64 {
    epoch_secs(SystemTime::now())
}

fn epoch_secs(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        .min(i64::MAX as u64) as i64
}

fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_valid_permission(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '*'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_rejects_missing_header() {
        let headers = HeaderMap::new();
        let err = bearer_token(&headers).unwrap_err();
        assert_eq!(err.code, "ERR_AUTHENTICATION");
    }

    #[test]
    fn bearer_token_strips_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().expect("header must parse"),
        );
        let token = bearer_token(&headers).expect("bearer token should parse");
        assert_eq!(token.as_str(), "abc.def.ghi");
    }

    #[test]
    fn id_and_permission_charsets() {
        assert!(is_valid_id("tenant-01.eu_west"));
        assert!(!is_valid_id("tenant' OR 1=1"));
        assert!(!is_valid_id(""));
        assert!(is_valid_permission("table:orders:read"));
        assert!(is_valid_permission("table:*:read"));
        assert!(!is_valid_permission("table orders"));
    }

    #[test]
    fn context_token_debug_does_not_leak() {
        let token = ContextToken::new("secret.jwt.value");
        assert_eq!(format!("{:?}", token), "ContextToken(..)");
    }

    #[test]
    fn with_permissions_returns_new_value() {
        let ctx = UserContext {
            identity_id: "alice".to_string(),
            tenant_id: "acme".to_string(),
            permissions: BTreeSet::from(["table:orders:read".to_string()]),
            session_id: "s1".to_string(),
            expires_at_epoch_secs: unix_now_secs() + 60,
        };
        let enriched = ctx.with_permissions(["table:customers:read"]);
        assert_eq!(ctx.permissions().len(), 1);
        assert_eq!(enriched.permissions().len(), 2);
        assert_eq!(enriched.session_id(), ctx.session_id());
    }
}
