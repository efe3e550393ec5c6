//! Best-effort decoding of the JWT payload segment.
//!
//! The client never validates signatures; it only reads a few fields out of
//! the payload for display and routing. Every failure here is reported as
//! "field absent".

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Fields the client reads from a token payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub email: Option<String>,
    /// Expiry as unix seconds.
    pub exp: Option<i64>,
}

impl TokenClaims {
    /// True only when the token carries an `exp` claim that has passed.
    /// Tokens without `exp` are not considered expired.
    pub fn is_expired(&self) -> bool {
        self.exp
            .map(|exp| exp <= Utc::now().timestamp())
            .unwrap_or(false)
    }
}

/// Decode the payload of a `header.payload.signature` token.
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let payload = decode_payload(token)?;
    Some(TokenClaims {
        user_id: string_field(&payload, "userId"),
        role: string_field(&payload, "role"),
        email: string_field(&payload, "email"),
        exp: payload.get("exp").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        }),
    })
}

pub fn extract_user_id(token: &str) -> Option<String> {
    decode_claims(token).and_then(|c| c.user_id)
}

pub fn extract_role(token: &str) -> Option<String> {
    decode_claims(token).and_then(|c| c.role)
}

pub fn extract_email(token: &str) -> Option<String> {
    decode_claims(token).and_then(|c| c.email)
}

fn decode_payload(token: &str) -> Option<Map<String, Value>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        warn!(parts = parts.len(), "Invalid token format, expected 3 segments");
        return None;
    }

    // Accept both padded and unpadded base64url
    let segment = parts[1].trim_end_matches('=');
    let bytes = match URL_SAFE_NO_PAD.decode(segment) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Token payload is not valid base64url");
            return None;
        }
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Some(map),
        Ok(_) => {
            warn!("Token payload is not a JSON object");
            None
        }
        Err(e) => {
            warn!(error = %e, "Token payload is not valid JSON");
            None
        }
    }
}

/// Read a field as a string, coercing scalars the way a lenient JSON
/// reader would. Null, arrays and objects count as absent.
fn string_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    let value = match payload.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    };
    if value.is_none() {
        debug!(field = key, "Field not present in token payload");
    }
    value
}
