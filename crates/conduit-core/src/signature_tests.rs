//! Tests for [`SignatureVerifier`].

use super::*;
use crate::provider::ProviderConfig;

const SECRET: &str = "It's a Secret to Everybody";
const BODY: &[u8] = br#"{"event_id":"evt_123","event_type":"user.created","data":{}}"#;

fn verifier() -> SignatureVerifier {
    let mut inactive = ProviderConfig::new("payment_service", "https://pay.example.com", SECRET);
    inactive.is_active = false;

    let registry = ProviderRegistry::from_configs(vec![
        ProviderConfig::new("user_service", "https://users.example.com", SECRET),
        inactive,
    ])
    .unwrap();
    SignatureVerifier::new(Arc::new(registry))
}

fn hex_signature() -> String {
    SignatureVerifier::sign(&SecretString::new(SECRET), BODY)
}

#[test]
fn test_accepts_prefixed_hex_signature() {
    let signature = hex_signature();
    assert!(signature.starts_with("sha256="));

    assert_eq!(
        verifier().verify("user_service", BODY, Some(&signature)),
        Ok(())
    );
}

#[test]
fn test_accepts_bare_hex_signature() {
    let signature = hex_signature();
    let bare = signature.trim_start_matches("sha256=");

    assert!(verifier().verify("user_service", BODY, Some(bare)).is_ok());
}

#[test]
fn test_accepts_base64_signature() {
    let signature = hex_signature();
    let raw = hex::decode(signature.trim_start_matches("sha256=")).unwrap();
    let encoded = BASE64.encode(raw);

    assert!(verifier().verify("user_service", BODY, Some(&encoded)).is_ok());
    assert!(verifier()
        .verify("user_service", BODY, Some(&format!("sha256={}", encoded)))
        .is_ok());
}

#[test]
fn test_known_digest_matches_reference_value() {
    // Reference digest from the GitHub webhook documentation
    let signature = SignatureVerifier::sign(&SecretString::new(SECRET), b"Hello, World!");

    assert_eq!(
        signature,
        "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
    );
}

#[test]
fn test_rejects_missing_and_empty_headers() {
    let verifier = verifier();

    assert_eq!(
        verifier.verify("user_service", BODY, None),
        Err(SignatureError::MissingSignature)
    );
    assert_eq!(
        verifier.verify("user_service", BODY, Some("")),
        Err(SignatureError::MissingSignature)
    );
    assert_eq!(
        verifier.verify("user_service", BODY, Some("   ")),
        Err(SignatureError::MissingSignature)
    );
}

#[test]
fn test_rejects_unknown_provider() {
    let result = verifier().verify("communication_service", BODY, Some(&hex_signature()));

    assert!(matches!(
        result,
        Err(SignatureError::UnknownProvider { provider }) if provider == "communication_service"
    ));
}

#[test]
fn test_rejects_inactive_provider_even_with_valid_signature() {
    let result = verifier().verify("payment_service", BODY, Some(&hex_signature()));

    assert!(matches!(
        result,
        Err(SignatureError::InactiveProvider { .. })
    ));
}

#[test]
fn test_rejects_tampered_body() {
    let signature = hex_signature();
    let tampered = br#"{"event_id":"evt_124","event_type":"user.created","data":{}}"#;

    assert_eq!(
        verifier().verify("user_service", tampered, Some(&signature)),
        Err(SignatureError::InvalidSignature)
    );
}

#[test]
fn test_rejects_signature_made_with_other_secret() {
    let signature = SignatureVerifier::sign(&SecretString::new("other"), BODY);

    assert_eq!(
        verifier().verify("user_service", BODY, Some(&signature)),
        Err(SignatureError::InvalidSignature)
    );
}

#[test]
fn test_rejects_undecodable_and_truncated_digests() {
    let verifier = verifier();

    assert_eq!(
        verifier.verify("user_service", BODY, Some("sha256=not-a-digest!")),
        Err(SignatureError::MalformedSignature)
    );
    assert_eq!(
        verifier.verify("user_service", BODY, Some("sha256=abcd")),
        Err(SignatureError::MalformedSignature)
    );
}

#[test]
fn test_all_failures_are_authentication_errors() {
    assert_eq!(
        SignatureError::InvalidSignature.category(),
        ErrorCategory::Authentication
    );
    assert_eq!(
        SignatureError::MissingSignature.category(),
        ErrorCategory::Authentication
    );
}
