use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Verify a webhook signature header against the tenant's secret.
///
/// The provider signs the raw body with HMAC-SHA-256 and sends the result
/// as `sha256=<hex>`. The secret is trimmed before keying — stray
/// whitespace around pasted secrets has burned us before. Any missing or
/// malformed input returns false; this function never errors.
pub fn verify_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    let secret = secret.trim();
    if secret.is_empty() {
        return false;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_matching_signature() {
        let body = br#"{"entry":[]}"#;
        let header = sign("top-secret", body);
        assert!(verify_signature("top-secret", Some(&header), body));
    }

    #[test]
    fn accepts_header_without_prefix() {
        let body = b"payload";
        let header = sign("top-secret", body);
        let bare = header.trim_start_matches("sha256=");
        assert!(verify_signature("top-secret", Some(bare), body));
    }

    #[test]
    fn rejects_tampered_body() {
        let header = sign("top-secret", b"original");
        assert!(!verify_signature("top-secret", Some(&header), b"tampered"));
    }

    #[test]
    fn rejects_missing_header() {
        assert!(!verify_signature("top-secret", None, b"payload"));
        assert!(!verify_signature("top-secret", Some(""), b"payload"));
    }

    #[test]
    fn rejects_unparseable_header() {
        assert!(!verify_signature(
            "top-secret",
            Some("sha256=not-hex-at-all"),
            b"payload"
        ));
        assert!(!verify_signature("top-secret", Some("sha256="), b"payload"));
    }

    #[test]
    fn rejects_empty_secret() {
        let header = sign("anything", b"payload");
        assert!(!verify_signature("", Some(&header), b"payload"));
        assert!(!verify_signature("   ", Some(&header), b"payload"));
    }

    #[test]
    fn stored_secret_whitespace_is_stripped() {
        // Producer signed with the clean secret; our copy has stray
        // whitespace from a paste. Verification must still pass.
        let body = b"payload";
        let header = sign("top-secret", body);
        assert!(verify_signature("  top-secret\n", Some(&header), body));
    }

    #[test]
    fn producer_signing_with_padded_secret_fails() {
        // The inverse misconfiguration: the producer keyed its HMAC with a
        // padded secret. Trimming on our side cannot and must not make
        // that match.
        let body = b"payload";
        let header = sign("  top-secret  ", body);
        assert!(!verify_signature("top-secret", Some(&header), body));
        assert!(!verify_signature("  top-secret  ", Some(&header), body));
    }
}
