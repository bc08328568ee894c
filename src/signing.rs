//! Request-signing helpers for the venues that require authenticated
//! subscribe payloads.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Coinbase Exchange WebSocket auth: base64(HMAC-SHA256(base64-decode(secret),
/// timestamp || method || request_path || body)).
pub fn coinbase_signature(secret_b64: &str, timestamp: &str, method: &str, request_path: &str, body: &str) -> Result<String> {
    let secret = BASE64
        .decode(secret_b64)
        .map_err(|e| GatewayError::InvalidArgument(format!("invalid coinbase secret: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&secret)
        .map_err(|e| GatewayError::InvalidArgument(format!("invalid coinbase secret length: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(request_path.as_bytes());
    mac.update(body.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// OKX WebSocket login auth: base64(HMAC-SHA256(secret, timestamp || method
/// || request_path || body)). Unlike Coinbase, the secret is used verbatim,
/// not base64-decoded.
pub fn okx_signature(secret: &str, timestamp: &str, method: &str, request_path: &str, body: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::InvalidArgument(format!("invalid okx secret: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(request_path.as_bytes());
    mac.update(body.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Binance user-data-stream style query signing: hex(HMAC-SHA256(secret,
/// query_string)). Used when a session needs a signed REST call (e.g. the
/// listen-key keepalive) rather than a raw subscribe frame.
pub fn binance_query_signature(secret: &str, query_string: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::InvalidArgument(format!("invalid binance secret: {e}")))?;
    mac.update(query_string.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coinbase_signature_is_deterministic() {
        let secret = BASE64.encode("supersecret");
        let sig1 = coinbase_signature(&secret, "1234567890", "GET", "/users/self/verify", "").unwrap();
        let sig2 = coinbase_signature(&secret, "1234567890", "GET", "/users/self/verify", "").unwrap();
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn okx_signature_changes_with_timestamp() {
        let sig1 = okx_signature("secret", "t1", "GET", "/api/v5/public/time", "").unwrap();
        let sig2 = okx_signature("secret", "t2", "GET", "/api/v5/public/time", "").unwrap();
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn binance_query_signature_is_hex() {
        let sig = binance_query_signature("secret", "symbol=BTCUSDT").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
