//! DPoP key lifecycle and proof minting
//!
//! Proof-of-possession for every authenticated network call. Keys are
//! P-256 only; the key id is the RFC 7638 JWK thumbprint, stable across
//! serialize/deserialize. Each proof is a one-shot ES256 JWS with a
//! fresh `jti`; proofs are never cached or reused.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AuthError, Result};

/// Public half of a DPoP key in JWK form. Embedded in every proof
/// header and stored alongside the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

/// A session's DPoP signing key.
pub struct DpopKey {
    secret: SecretKey,
}

impl DpopKey {
    /// Generate a fresh P-256 key pair. One per new session.
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Reconstruct a key from its private JWK. Anything that is not a
    /// P-256 EC key is rejected.
    pub fn from_private_jwk(jwk: &str) -> Result<Self> {
        let secret = SecretKey::from_jwk_str(jwk)
            .map_err(|e| AuthError::DpopKey(format!("unusable private JWK: {}", e)))?;
        Ok(Self { secret })
    }

    /// Serialize the private key for encrypted storage.
    pub fn private_jwk(&self) -> String {
        self.secret.to_jwk_string().to_string()
    }

    pub fn public_jwk(&self) -> PublicJwk {
        let point = self.secret.public_key().to_encoded_point(false);
        // Uncompressed SEC1 points always carry both coordinates
        let x = point.x().expect("uncompressed point has x");
        let y = point.y().expect("uncompressed point has y");

        PublicJwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
        }
    }

    /// RFC 7638 thumbprint: SHA-256 over the required JWK members in
    /// lexicographic order, base64url without padding.
    pub fn thumbprint(&self) -> String {
        let jwk = self.public_jwk();
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            jwk.crv, jwk.kty, jwk.x, jwk.y
        );
        URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Mint a proof for one request.
    ///
    /// `htm` is the uppercased method, `htu` the URL with query and
    /// fragment stripped. The server nonce, when one has been issued
    /// for this host, rides along in the payload.
    pub fn proof(&self, method: &str, url: &str, nonce: Option<&str>) -> Result<String> {
        let header = serde_json::json!({
            "alg": "ES256",
            "typ": "dpop+jwt",
            "jwk": self.public_jwk(),
        });

        let mut payload = serde_json::json!({
            "jti": Uuid::new_v4().to_string(),
            "htm": method.to_uppercase(),
            "htu": normalize_htu(url)?,
            "iat": chrono::Utc::now().timestamp(),
        });
        if let Some(nonce) = nonce {
            payload["nonce"] = serde_json::Value::String(nonce.to_string());
        }

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(payload.to_string())
        );

        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key.sign(signing_input.as_bytes());

        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Strip a request URL down to scheme + host + path for the `htu`
/// claim.
pub fn normalize_htu(url: &str) -> Result<String> {
    let mut parsed = reqwest::Url::parse(url)
        .map_err(|e| AuthError::DpopKey(format!("unparseable htu: {}", e)))?;
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}
