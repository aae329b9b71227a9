//! Access token inspection
//!
//! Access tokens are compact JWTs. Only the payload is read, to learn the `exp`
//! claim; signatures are the server's business.

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokenrelay_protocol::common::Claims;

use crate::error::{RelayError, Result};

/// Source of "now" for expiry decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Decode the claims segment of a JWT without verifying it
pub fn decode_claims(token: &str) -> Result<Claims> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_header), Some(payload), Some(_signature)) if !payload.is_empty() => payload,
        _ => return Err(RelayError::invalid_input("Access token is not a JWT")),
    };

    // Some issuers pad, most don't.
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| RelayError::invalid_input(format!("Malformed token payload: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::serialization(format!("Malformed token claims: {}", e)))
}

/// Expiration embedded in the token, if it can be read
pub fn expires_at(token: &str) -> Option<DateTime<Utc>> {
    let exp = decode_claims(token).ok()?.exp?;
    Utc.timestamp_opt(exp, 0).single()
}

/// Remaining lifetime at `now`; negative once expired
pub fn remaining_lifetime(token: &str, now: DateTime<Utc>) -> Option<Duration> {
    expires_at(token).map(|exp| exp - now)
}

/// True when the token's expiry is known and less than `threshold` away (or already past).
///
/// Tokens without a readable expiry are never considered expiring; a 401 from the
/// server still drives a refresh for them.
pub fn is_expiring_soon(token: &str, now: DateTime<Utc>, threshold: Duration) -> bool {
    match remaining_lifetime(token, now) {
        Some(remaining) => remaining < threshold,
        None => false,
    }
}
