//! Webhook authentication shared by the provider adapters.
//!
//! All comparisons are constant-time. Every failure is an error: there is no path that
//! accepts an unsigned payload.

use berth_core::SignatureError;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// SHA-256 hex digest of a raw body, stored with every received event
pub fn payload_digest(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

pub fn hmac_sha256_hex(secret: &str, message: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

pub fn hmac_sha512_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = match HmacSha512::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

fn matches(expected_hex: &str, provided_hex: &str) -> bool {
    let provided = provided_hex.trim().to_ascii_lowercase();
    !expected_hex.is_empty()
        && expected_hex.len() == provided.len()
        && expected_hex.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1
}

/// Parsed `t=<unix>,v1=<hex>[,v1=<hex>...]` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedSignature {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl TimestampedSignature {
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    let t = value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::Malformed(format!("bad timestamp: {}", value)))?;
                    timestamp = Some(t);
                }
                Some(("v1", value)) => signatures.push(value.to_string()),
                // Other schemes (v0, ...) are ignored
                Some(_) => {}
                None => return Err(SignatureError::Malformed(part.to_string())),
            }
        }

        let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("missing t=".to_string()))?;
        if signatures.is_empty() {
            return Err(SignatureError::Malformed("missing v1=".to_string()));
        }

        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Verify a timestamped HMAC-SHA256 header over `"<t>.<body>"`.
pub fn verify_timestamped(
    secret: &str,
    header: Option<&str>,
    raw: &[u8],
    now: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let header = header.filter(|h| !h.trim().is_empty()).ok_or(SignatureError::Missing)?;
    let parsed = TimestampedSignature::parse(header)?;

    let age = now - parsed.timestamp;
    if age.abs() > tolerance_secs {
        return Err(SignatureError::Expired { age_secs: age });
    }

    let mut signed = format!("{}.", parsed.timestamp).into_bytes();
    signed.extend_from_slice(raw);
    let expected = hmac_sha256_hex(secret, &signed);

    if parsed.signatures.iter().any(|s| matches(&expected, s)) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Verify a plain hex HMAC-SHA512 of the raw body.
pub fn verify_sha512(secret: &str, header: Option<&str>, raw: &[u8]) -> Result<(), SignatureError> {
    let header = header.filter(|h| !h.trim().is_empty()).ok_or(SignatureError::Missing)?;
    let expected = hmac_sha512_hex(secret, raw);
    if matches(&expected, header) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Verify a plain hex HMAC-SHA256 of the raw body.
pub fn verify_sha256(secret: &str, header: Option<&str>, raw: &[u8]) -> Result<(), SignatureError> {
    let header = header.filter(|h| !h.trim().is_empty()).ok_or(SignatureError::Missing)?;
    let expected = hmac_sha256_hex(secret, raw);
    if matches(&expected, header) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"id":"evt_1"}"#;

    fn header(t: i64) -> String {
        let mut signed = format!("{}.", t).into_bytes();
        signed.extend_from_slice(BODY);
        format!("t={},v1={}", t, hmac_sha256_hex(SECRET, &signed))
    }

    #[test]
    fn test_timestamped_signature_accepts_valid_header() {
        let now = 1_700_000_000;
        assert!(verify_timestamped(SECRET, Some(&header(now)), BODY, now + 10, 300).is_ok());
    }

    #[test]
    fn test_timestamped_signature_rejects_missing_header() {
        assert_eq!(
            verify_timestamped(SECRET, None, BODY, 0, 300),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_timestamped(SECRET, Some("  "), BODY, 0, 300),
            Err(SignatureError::Missing)
        );
    }

    #[test]
    fn test_timestamped_signature_rejects_replay_outside_window() {
        let t = 1_700_000_000;
        assert_eq!(
            verify_timestamped(SECRET, Some(&header(t)), BODY, t + 301, 300),
            Err(SignatureError::Expired { age_secs: 301 })
        );
    }

    #[test]
    fn test_timestamped_signature_rejects_tampered_body() {
        let t = 1_700_000_000;
        assert_eq!(
            verify_timestamped(SECRET, Some(&header(t)), br#"{"id":"evt_2"}"#, t, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_timestamped_header_must_have_both_parts() {
        assert!(matches!(
            TimestampedSignature::parse("v1=abc"),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            TimestampedSignature::parse("t=1"),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn test_sha512_signature() {
        let good = hmac_sha512_hex(SECRET, BODY);
        assert!(verify_sha512(SECRET, Some(&good), BODY).is_ok());
        assert!(verify_sha512(SECRET, Some(&good.to_uppercase()), BODY).is_ok());
        assert_eq!(
            verify_sha512("other", Some(&good), BODY),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(verify_sha512(SECRET, None, BODY), Err(SignatureError::Missing));
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        assert_eq!(payload_digest(b"").len(), 64);
        assert_ne!(payload_digest(b"a"), payload_digest(b"b"));
    }
}
