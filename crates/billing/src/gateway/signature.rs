//! Webhook signature verification
//!
//! Stripe-style scheme: the header carries `t=<unix ts>,v1=<hex digest>` where the
//! digest is HMAC-SHA256 over `"<ts>.<payload>"` keyed with the endpoint secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed timestamp
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature header is missing a timestamp or v1 signature")]
    MalformedHeader,
    #[error("signature timestamp outside tolerance window ({diff}s)")]
    TimestampOutOfTolerance { diff: i64 },
    #[error("webhook secret is empty")]
    EmptySecret,
    #[error("signature mismatch")]
    Mismatch,
}

/// Parsed `t=...,v1=...` header. A header may carry several v1 signatures while a
/// secret is being rotated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

pub fn parse_signature_header(header: &str) -> Result<SignatureHeader, SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" if !value.is_empty() => signatures.push(value.to_string()),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureHeader {
            timestamp,
            signatures,
        }),
        _ => Err(SignatureError::MalformedHeader),
    }
}

/// Hex HMAC-SHA256 of `"<timestamp>.<payload>"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, new_from_slice cannot fail here
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a signature header against `now` (unix seconds)
pub fn verify_signature_at(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }

    let parsed = parse_signature_header(header)?;

    let diff = (now - parsed.timestamp).abs();
    if diff > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::TimestampOutOfTolerance { diff });
    }

    let expected = compute_signature(secret, parsed.timestamp, payload);
    let matched = parsed
        .signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

pub fn verify_signature(payload: &[u8], header: &str, secret: &str) -> Result<(), SignatureError> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    verify_signature_at(payload, header, secret, now)
}

/// Build a header for `payload` the way the provider would
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &[u8] = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_parse_signature_header() {
        let parsed = parse_signature_header("t=1609459200,v1=abcdef,v0=ignored").unwrap();
        assert_eq!(parsed.timestamp, 1609459200);
        assert_eq!(parsed.signatures, vec!["abcdef".to_string()]);
    }

    #[test]
    fn test_parse_signature_header_invalid() {
        assert_eq!(
            parse_signature_header("invalid"),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            parse_signature_header("t=123"),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            parse_signature_header("t=abc,v1=ff"),
            Err(SignatureError::MalformedHeader)
        );
    }

    #[test]
    fn test_valid_signature_accepted() {
        let header = sign_payload(SECRET, NOW, PAYLOAD);
        assert_eq!(verify_signature_at(PAYLOAD, &header, SECRET, NOW + 10), Ok(()));
    }

    #[test]
    fn test_rotated_secret_any_v1_matches() {
        let good = compute_signature(SECRET, NOW, PAYLOAD);
        let header = format!("t={},v1=deadbeef,v1={}", NOW, good);
        assert_eq!(verify_signature_at(PAYLOAD, &header, SECRET, NOW), Ok(()));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign_payload(SECRET, NOW, PAYLOAD);
        let tampered = br#"{"id":"evt_1","type":"payment_intent.canceled"}"#;
        assert_eq!(
            verify_signature_at(tampered, &header, SECRET, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign_payload("whsec_other", NOW, PAYLOAD);
        assert_eq!(
            verify_signature_at(PAYLOAD, &header, SECRET, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let header = sign_payload(SECRET, NOW, PAYLOAD);
        assert_eq!(
            verify_signature_at(PAYLOAD, &header, SECRET, NOW + 301),
            Err(SignatureError::TimestampOutOfTolerance { diff: 301 })
        );
    }

    #[test]
    fn test_empty_secret_rejected() {
        let header = sign_payload("", NOW, PAYLOAD);
        assert_eq!(
            verify_signature_at(PAYLOAD, &header, "", NOW),
            Err(SignatureError::EmptySecret)
        );
    }
}
