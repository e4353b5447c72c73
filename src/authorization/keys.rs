// Node signing keys
// The RSA keypair behind private_key_jwt client assertions and the node's
// published JWKS

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::model::make_id;
use crate::{NmosError, Result};

const RSA_KEY_BITS: usize = 2048;

/// The node's signing key.
pub struct SigningKeys {
    encoding_key: EncodingKey,
    key_id: String,
    public_jwk: Value,
}

#[derive(Debug, Serialize)]
struct ClientAssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: u64,
    iat: u64,
    jti: String,
}

impl SigningKeys {
    /// Generate a fresh RSA keypair.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| NmosError::Internal(format!("key generation failed: {}", e)))?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self> {
        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| NmosError::Internal(format!("key encoding failed: {}", e)))?;
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| NmosError::Internal(format!("key encoding failed: {}", e)))?;

        let public_key = private_key.to_public_key();
        let n = public_key.n().to_bytes_be();
        let e = public_key.e().to_bytes_be();

        // a stable key id derived from the public modulus
        let key_id = URL_SAFE_NO_PAD.encode(&Sha256::digest(&n)[..16]);

        let public_jwk = json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": key_id,
            "n": URL_SAFE_NO_PAD.encode(n),
            "e": URL_SAFE_NO_PAD.encode(e),
        });

        Ok(SigningKeys {
            encoding_key,
            key_id,
            public_jwk,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    #[cfg(test)]
    pub(crate) fn test_encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    /// The JWKS published at the node's jwks_uri.
    pub fn public_jwks(&self) -> Value {
        json!({ "keys": [self.public_jwk] })
    }

    /// A `private_key_jwt` client assertion for the given token endpoint,
    /// RFC 7523 section 2.2.
    pub fn make_client_assertion(&self, client_id: &str, token_endpoint: &str) -> Result<String> {
        let now = super::state::now_seconds();
        let claims = ClientAssertionClaims {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: token_endpoint.to_string(),
            exp: now + 300,
            iat: now,
            jti: make_id(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| NmosError::Internal(format!("client assertion signing failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_jwks_shape() {
        let keys = SigningKeys::generate().unwrap();
        let jwks = keys.public_jwks();
        let jwk = &jwks["keys"][0];
        assert_eq!(jwk["kty"], "RSA");
        assert_eq!(jwk["alg"], "RS256");
        assert_eq!(jwk["kid"], Value::String(keys.key_id().to_string()));
        assert!(jwk["n"].as_str().map(|n| !n.is_empty()).unwrap_or(false));
    }

    #[test]
    fn test_client_assertion_decodes_with_published_key() {
        let keys = SigningKeys::generate().unwrap();
        let assertion = keys
            .make_client_assertion("client-1", "https://auth.example.com/token")
            .unwrap();

        let jwk: jsonwebtoken::jwk::Jwk =
            serde_json::from_value(keys.public_jwks()["keys"][0].clone()).unwrap();
        let decoding_key = jsonwebtoken::DecodingKey::from_jwk(&jwk).unwrap();
        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.set_audience(&["https://auth.example.com/token"]);
        let decoded = jsonwebtoken::decode::<serde_json::Value>(
            &assertion,
            &decoding_key,
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims["iss"], "client-1");
        assert_eq!(decoded.claims["sub"], "client-1");
        assert_eq!(decoded.header.kid.as_deref(), Some(keys.key_id()));
    }
}
