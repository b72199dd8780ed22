//! Authentication handling
//!
//! Tokens are JWTs signed by the account service. The public key is loaded
//! once at startup; its type decides which signature algorithms are accepted.

use crate::identity::IdentityProvider;
use chatrelay_core::{Error, Identity, Result};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Public key family, detected from the PEM document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Ec,
    Ed,
}

impl KeyKind {
    pub fn algorithms(&self) -> &'static [Algorithm] {
        match self {
            KeyKind::Rsa => &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512],
            KeyKind::Ec => &[Algorithm::ES256, Algorithm::ES384],
            KeyKind::Ed => &[Algorithm::EdDSA],
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies token signatures against a single, immutable public key.
pub struct TokenVerifier {
    key: DecodingKey,
    kind: KeyKind,
    validation: Validation,
}

impl TokenVerifier {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (key, kind) = if let Ok(key) = DecodingKey::from_rsa_pem(pem) {
            (key, KeyKind::Rsa)
        } else if let Ok(key) = DecodingKey::from_ec_pem(pem) {
            (key, KeyKind::Ec)
        } else if let Ok(key) = DecodingKey::from_ed_pem(pem) {
            (key, KeyKind::Ed)
        } else {
            return Err(Error::config("public key is not an RSA, EC or Ed25519 PEM document"));
        };

        let algorithms = kind.algorithms();
        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms.to_vec();
        // `exp` is still checked whenever the token carries one.
        validation.required_spec_claims = HashSet::from(["sub".to_string()]);
        validation.validate_aud = false;

        Ok(Self {
            key,
            kind,
            validation,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path)
            .map_err(|e| Error::config(format!("reading public key {}: {}", path.display(), e)))?;
        let verifier = Self::from_pem(&pem)?;
        info!(path = %path.display(), kind = ?verifier.kind, "loaded token public key");
        Ok(verifier)
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Checks the signature and returns the token subject.
    pub fn verify(&self, token: &str) -> Result<String> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| Error::token_invalid(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(Error::token_invalid("empty subject"));
        }
        Ok(data.claims.sub)
    }
}

/// Login state of one connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// Terminal for the life of the connection.
    Authenticated(Identity),
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthState::Authenticated(identity) => Some(identity),
            AuthState::Unauthenticated => None,
        }
    }
}

/// Process-wide login gate shared by every connection.
pub struct AuthGate {
    verifier: TokenVerifier,
    provider: Arc<dyn IdentityProvider>,
}

impl AuthGate {
    pub fn new(verifier: TokenVerifier, provider: Arc<dyn IdentityProvider>) -> Self {
        Self { verifier, provider }
    }

    /// Step one of a login: signature check and subject extraction.
    pub fn verify(&self, token: Option<&str>) -> Result<String> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::token_invalid("token required"))?;
        self.verifier.verify(token)
    }

    /// Step two: resolve the display identity for a verified subject.
    pub async fn resolve(&self, subject_id: &str, token: &str) -> Result<Identity> {
        let identity = self.provider.lookup(subject_id, token).await?;
        debug!(subject = subject_id, nickname = %identity.display_name, "identity resolved");
        Ok(identity)
    }
}
