//! Webhook signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The MAC is
//! HMAC-SHA256 keyed by the shared secret over `"{t}.{raw body}"`. Several `v1`
//! entries may be present while a secret is being rotated; any match is accepted.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Signature verification failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Header missing a timestamp or signature, or unparsable
    #[error("Malformed signature header: {0}")]
    Malformed(String),

    /// Timestamp outside the tolerance window
    #[error("Signature timestamp outside tolerance ({age_secs}s)")]
    Expired {
        /// Distance between the signed timestamp and now, in seconds
        age_secs: u64,
    },

    /// No signature matched the body
    #[error("Signature mismatch")]
    Mismatch,
}

/// Verify `header` against `body`.
///
/// # Errors
///
/// Returns [`SignatureError`] if the header is malformed, stale, or no
/// `v1` entry matches.
pub fn verify(
    body: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    SignatureError::Malformed(format!("timestamp is not an integer: {value}"))
                })?);
            }
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or_else(|| SignatureError::Malformed("missing timestamp".to_string()))?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed("missing v1 signature".to_string()));
    }

    let age_secs = now.timestamp().abs_diff(timestamp);
    if age_secs > tolerance.as_secs() {
        return Err(SignatureError::Expired { age_secs });
    }

    let expected = hex::encode(mac(body, secret, timestamp)?);
    if candidates
        .iter()
        .any(|candidate| constant_time_eq::constant_time_eq(candidate.as_bytes(), expected.as_bytes()))
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Build a signature header for `body`, as the provider would.
///
/// # Errors
///
/// Returns [`SignatureError::Malformed`] if the secret cannot key the MAC.
pub fn sign(body: &[u8], secret: &str, timestamp: i64) -> Result<String, SignatureError> {
    Ok(format!("t={timestamp},v1={}", hex::encode(mac(body, secret, timestamp)?)))
}

fn mac(body: &[u8], secret: &str, timestamp: i64) -> Result<Vec<u8>, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SECRET: &str = "whsec_test";
    const TOLERANCE: Duration = Duration::from_secs(300);

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn accepts_own_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign(body, SECRET, now().timestamp()).unwrap();
        assert!(verify(body, &header, SECRET, TOLERANCE, now()).is_ok());
    }

    #[test]
    fn rejects_tampered_body() {
        let header = sign(b"original", SECRET, now().timestamp()).unwrap();
        assert_eq!(
            verify(b"tampered", &header, SECRET, TOLERANCE, now()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_wrong_secret() {
        let header = sign(b"body", "whsec_other", now().timestamp()).unwrap();
        assert_eq!(
            verify(b"body", &header, SECRET, TOLERANCE, now()),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        for offset in [-301, 301] {
            let header = sign(b"body", SECRET, now().timestamp() + offset).unwrap();
            assert_eq!(
                verify(b"body", &header, SECRET, TOLERANCE, now()),
                Err(SignatureError::Expired { age_secs: 301 })
            );
        }
    }

    #[test]
    fn any_rotated_signature_matches() {
        let valid = sign(b"body", SECRET, now().timestamp()).unwrap();
        let v1 = valid.split_once(",v1=").unwrap().1;
        let header = format!("t={},v1=deadbeef,v1={v1}", now().timestamp());
        assert!(verify(b"body", &header, SECRET, TOLERANCE, now()).is_ok());
    }

    #[test]
    fn malformed_headers() {
        for header in ["", "v1=abc", "t=abc,v1=abc", "t=1700000000"] {
            assert!(matches!(
                verify(b"body", header, SECRET, TOLERANCE, now()),
                Err(SignatureError::Malformed(_))
            ));
        }
    }
}
