//! HMAC-SHA256 verification of inbound webhook signatures.
//!
//! Providers sign the raw request body with their shared webhook secret and
//! send the digest in the `X-Signature` header. The digest may be hex or
//! base64 encoded and may carry a `sha256=` prefix.
//!
//! Verification fails closed: a missing or empty header, an unknown or
//! inactive provider, an undecodable digest, or a mismatch all reject the
//! request. Digest comparison runs in constant time.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{instrument, warn};

use crate::provider::{ProviderRegistry, SecretString};
use crate::ErrorCategory;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";
const DIGEST_LENGTH: usize = 32;

/// Authentication failure for an inbound webhook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signature header is missing or empty")]
    MissingSignature,

    #[error("Provider '{provider}' is not registered")]
    UnknownProvider { provider: String },

    #[error("Provider '{provider}' is inactive")]
    InactiveProvider { provider: String },

    #[error("Signature is not a valid hex or base64 SHA-256 digest")]
    MalformedSignature,

    #[error("Signature does not match payload")]
    InvalidSignature,
}

impl SignatureError {
    /// Every signature failure is an authentication failure.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Authentication
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::UnknownProvider { .. } => "unknown_provider",
            Self::InactiveProvider { .. } => "inactive_provider",
            Self::MalformedSignature => "malformed_signature",
            Self::InvalidSignature => "invalid_signature",
        }
    }
}

/// Verifies webhook signatures against provider secrets.
#[derive(Clone)]
pub struct SignatureVerifier {
    registry: Arc<ProviderRegistry>,
}

impl SignatureVerifier {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Verify `signature_header` against an HMAC-SHA256 of `raw_body`.
    ///
    /// # Errors
    ///
    /// Returns a [`SignatureError`] for any authentication failure. No side
    /// effects occur on either path.
    #[instrument(skip(self, raw_body, signature_header), fields(body_len = raw_body.len()))]
    pub fn verify(
        &self,
        provider: &str,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<(), SignatureError> {
        let header = signature_header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(SignatureError::MissingSignature)?;

        let provider_entry =
            self.registry
                .get(provider)
                .ok_or_else(|| SignatureError::UnknownProvider {
                    provider: provider.to_string(),
                })?;
        if !provider_entry.is_active {
            return Err(SignatureError::InactiveProvider {
                provider: provider.to_string(),
            });
        }

        let provided = decode_digest(header)?;
        let expected = compute_digest(&provider_entry.webhook_secret, raw_body);

        if provided.len() == expected.len() && bool::from(provided.ct_eq(&expected)) {
            Ok(())
        } else {
            warn!(provider = %provider, "Webhook signature mismatch");
            Err(SignatureError::InvalidSignature)
        }
    }

    /// Produce a `sha256=<hex>` signature for `body`.
    pub fn sign(secret: &SecretString, body: &[u8]) -> String {
        format!("{}{}", SIGNATURE_PREFIX, hex::encode(compute_digest(secret, body)))
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("providers", &self.registry.len())
            .finish()
    }
}

fn compute_digest(secret: &SecretString, body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// Decode a hex or base64 digest, with or without the `sha256=` prefix.
fn decode_digest(header: &str) -> Result<Vec<u8>, SignatureError> {
    let value = header
        .get(..SIGNATURE_PREFIX.len())
        .filter(|p| p.eq_ignore_ascii_case(SIGNATURE_PREFIX))
        .map(|_| &header[SIGNATURE_PREFIX.len()..])
        .unwrap_or(header);

    let hex_candidate = value.len() == DIGEST_LENGTH * 2
        && value.bytes().all(|b| b.is_ascii_hexdigit());

    let decoded = if hex_candidate {
        hex::decode(value).map_err(|_| SignatureError::MalformedSignature)?
    } else {
        BASE64
            .decode(value)
            .map_err(|_| SignatureError::MalformedSignature)?
    };

    if decoded.len() != DIGEST_LENGTH {
        return Err(SignatureError::MalformedSignature);
    }
    Ok(decoded)
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
