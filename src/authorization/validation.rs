// Access token validation
// Signature, lifetime, audience and x-nmos-* scope claim checks against the
// cached issuer keys

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::debug;

use super::state::AuthorizationState;

/// The outcome of validating an access token.
///
/// `NoMatchingKeys` is recoverable: the caller sets
/// `fetch_token_issuer_pubkeys` so the token-issuer helper can fetch the
/// issuer's keys, and the client's retry will then succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenValidation {
    Succeeded,
    WithoutAuthentication,
    InsufficientScope,
    NoMatchingKeys,
    Failed,
}

impl TokenValidation {
    pub fn is_success(self) -> bool {
        self == TokenValidation::Succeeded
    }
}

/// The access a request needs from its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Read a token's claims without verifying its signature, for issuer
/// discovery.
pub fn unverified_claims(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// The issuer of a token, unverified.
pub fn token_issuer(token: &str) -> Option<String> {
    unverified_claims(token)?["iss"].as_str().map(str::to_string)
}

/// Validate a bearer token for a request.
///
/// `audience` is this resource server's host name, `api` the NMOS API name
/// whose `x-nmos-<api>` claim governs the request, and `path` the request
/// path matched against the claim's patterns.
pub fn validate_access_token(
    state: &AuthorizationState,
    token: Option<&str>,
    audience: &str,
    api: &str,
    path: &str,
    access: Access,
) -> TokenValidation {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        return TokenValidation::WithoutAuthentication;
    };

    let Ok(header) = decode_header(token) else {
        return TokenValidation::WithoutAuthentication;
    };
    let Some(issuer) = token_issuer(token) else {
        return TokenValidation::Failed;
    };

    let Some(jwks) = state.issuer_keys(&issuer) else {
        debug!(%issuer, "no keys cached for token issuer");
        return TokenValidation::NoMatchingKeys;
    };

    // prefer the key named by the token's kid; otherwise try all of them
    let candidates: Vec<&Jwk> = match &header.kid {
        Some(kid) => jwks
            .keys
            .iter()
            .filter(|jwk| jwk.common.key_id.as_deref() == Some(kid))
            .collect(),
        None => jwks.keys.iter().collect(),
    };
    if candidates.is_empty() {
        debug!(%issuer, kid = ?header.kid, "no matching key for token");
        return TokenValidation::NoMatchingKeys;
    }

    let mut claims = None;
    for jwk in candidates {
        if !matches!(jwk.algorithm, AlgorithmParameters::RSA(_)) {
            continue;
        }
        let Ok(decoding_key) = DecodingKey::from_jwk(jwk) else { continue };

        let mut validation = Validation::new(header.alg);
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            // only the RSA family is accepted for NMOS tokens
            return TokenValidation::Failed;
        }
        validation.set_audience(&[audience]);

        match decode::<Value>(token, &decoding_key, &validation) {
            Ok(decoded) => {
                claims = Some(decoded.claims);
                break;
            }
            Err(e) => {
                debug!(%issuer, "token failed validation: {}", e);
            }
        }
    }
    let Some(claims) = claims else {
        return TokenValidation::Failed;
    };

    // the x-nmos-<api> claim grants path patterns per access level
    let claim = &claims[format!("x-nmos-{}", api)];
    if claim.is_null() {
        return TokenValidation::InsufficientScope;
    }
    let permitted = |key: &str| -> bool {
        claim[key]
            .as_array()
            .map(|patterns| {
                patterns
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|pattern| wildcard_match(pattern, path))
            })
            .unwrap_or(false)
    };
    let allowed = match access {
        // write access implies read access
        Access::Read => permitted("read") || permitted("write"),
        Access::Write => permitted("write"),
    };
    if !allowed {
        return TokenValidation::InsufficientScope;
    }

    TokenValidation::Succeeded
}

// '*' matches any sequence of characters, including none
fn wildcard_match(pattern: &str, path: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == path,
        Some((prefix, rest)) => {
            if !path.starts_with(prefix) {
                return false;
            }
            let remaining = &path[prefix.len()..];
            if rest.is_empty() {
                return true;
            }
            (0..=remaining.len()).any(|skip| wildcard_match(rest, &remaining[skip..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::keys::SigningKeys;
    use crate::authorization::state::IssuerInfo;
    use jsonwebtoken::jwk::JwkSet;
    use serde_json::json;

    const ISSUER: &str = "https://auth.example.com";
    const AUDIENCE: &str = "node.example.com";

    fn state_with_issuer(keys: &SigningKeys) -> AuthorizationState {
        let jwks: JwkSet = serde_json::from_value(keys.public_jwks()).unwrap();
        let mut state = AuthorizationState::default();
        state.issuers.insert(
            ISSUER.to_string(),
            IssuerInfo::new(json!({ "issuer": ISSUER }), jwks),
        );
        state
    }

    fn make_token(keys: &SigningKeys, claims: Value) -> String {
        let mut header = jsonwebtoken::Header::new(Algorithm::RS256);
        header.kid = Some(keys.key_id().to_string());
        let encoding_key = keys.test_encoding_key();
        jsonwebtoken::encode(&header, &claims, encoding_key).unwrap()
    }

    fn base_claims() -> Value {
        json!({
            "iss": ISSUER,
            "sub": "user@example.com",
            "aud": [AUDIENCE],
            "exp": super::super::state::now_seconds() + 300,
            "iat": super::super::state::now_seconds(),
            "client_id": "client-1",
            "x-nmos-registration": { "read": ["*"], "write": ["*"] },
            "x-nmos-connection": { "read": ["*"], "write": ["single/*"] },
        })
    }

    #[test]
    fn test_valid_token_succeeds() {
        let keys = SigningKeys::generate().unwrap();
        let state = state_with_issuer(&keys);
        let token = make_token(&keys, base_claims());

        let result = validate_access_token(
            &state,
            Some(&token),
            AUDIENCE,
            "registration",
            "resource",
            Access::Write,
        );
        assert_eq!(result, TokenValidation::Succeeded);
    }

    #[test]
    fn test_missing_token() {
        let state = AuthorizationState::default();
        assert_eq!(
            validate_access_token(&state, None, AUDIENCE, "registration", "x", Access::Read),
            TokenValidation::WithoutAuthentication
        );
        assert_eq!(
            validate_access_token(&state, Some(""), AUDIENCE, "registration", "x", Access::Read),
            TokenValidation::WithoutAuthentication
        );
        assert_eq!(
            validate_access_token(&state, Some("garbage"), AUDIENCE, "registration", "x", Access::Read),
            TokenValidation::WithoutAuthentication
        );
    }

    #[test]
    fn test_unknown_issuer_reports_no_matching_keys() {
        let keys = SigningKeys::generate().unwrap();
        // valid token, but the issuer is not cached
        let token = make_token(&keys, base_claims());
        let state = AuthorizationState::default();

        let result = validate_access_token(
            &state,
            Some(&token),
            AUDIENCE,
            "registration",
            "x",
            Access::Read,
        );
        assert_eq!(result, TokenValidation::NoMatchingKeys);
    }

    #[test]
    fn test_expired_token_fails() {
        let keys = SigningKeys::generate().unwrap();
        let state = state_with_issuer(&keys);
        let mut claims = base_claims();
        claims["exp"] = json!(1);

        let token = make_token(&keys, claims);
        let result = validate_access_token(
            &state,
            Some(&token),
            AUDIENCE,
            "registration",
            "x",
            Access::Read,
        );
        assert_eq!(result, TokenValidation::Failed);
    }

    #[test]
    fn test_wrong_audience_fails() {
        let keys = SigningKeys::generate().unwrap();
        let state = state_with_issuer(&keys);
        let mut claims = base_claims();
        claims["aud"] = json!(["other.example.com"]);

        let token = make_token(&keys, claims);
        let result = validate_access_token(
            &state,
            Some(&token),
            AUDIENCE,
            "registration",
            "x",
            Access::Read,
        );
        assert_eq!(result, TokenValidation::Failed);
    }

    #[test]
    fn test_scope_claims() {
        let keys = SigningKeys::generate().unwrap();
        let state = state_with_issuer(&keys);
        let token = make_token(&keys, base_claims());

        // connection write is limited to single/*
        assert_eq!(
            validate_access_token(&state, Some(&token), AUDIENCE, "connection", "single/senders", Access::Write),
            TokenValidation::Succeeded
        );
        assert_eq!(
            validate_access_token(&state, Some(&token), AUDIENCE, "connection", "bulk/senders", Access::Write),
            TokenValidation::InsufficientScope
        );
        // but reads are unrestricted
        assert_eq!(
            validate_access_token(&state, Some(&token), AUDIENCE, "connection", "bulk/senders", Access::Read),
            TokenValidation::Succeeded
        );
        // no claim for this API at all
        assert_eq!(
            validate_access_token(&state, Some(&token), AUDIENCE, "query", "senders", Access::Read),
            TokenValidation::InsufficientScope
        );
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", "anything/at/all"));
        assert!(wildcard_match("single/*", "single/senders/abc"));
        assert!(!wildcard_match("single/*", "bulk/senders"));
        assert!(wildcard_match("single/*/staged", "single/senders/abc/staged"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "exactly"));
    }
}
