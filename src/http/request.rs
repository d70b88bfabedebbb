//! Request classification helpers.
//!
//! # Responsibilities
//! - Generate a short correlation id for log lines
//! - Resolve the caller's address, honoring trusted proxies
//! - Detect WebSocket upgrade requests and validate the handshake headers
//!
//! # Design Decisions
//! - The correlation id has no security role; it only ties log lines together
//! - Forwarding headers are only believed when the peer is a trusted proxy
//! - A malformed forwarding header from a trusted proxy is a bad request

use std::net::IpAddr;

use axum::http::{header, HeaderMap};
use rand::distributions::Alphanumeric;
use rand::Rng;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_FORWARDED_URI: &str = "x-forwarded-uri";

const CORRELATION_ID_LEN: usize = 4;
const WEBSOCKET_VERSION: &str = "13";

/// Short random id attached to every log line of an exchange.
pub fn correlation_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Why a request was rejected before matching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedRequest {
    #[error("Invalid request target '{0}'")]
    Target(String),
    #[error("Invalid forwarded address '{0}'")]
    ForwardedAddress(String),
    #[error("Missing Sec-WebSocket-Key header")]
    MissingWebSocketKey,
    #[error("Unsupported WebSocket version '{0}'")]
    WebSocketVersion(String),
}

/// Resolve the client address.
///
/// When `peer` is a trusted proxy the first `X-Forwarded-For` entry wins,
/// then `X-Real-IP`; otherwise the peer address is used as-is.
pub fn client_ip(peer: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> Result<IpAddr, MalformedRequest> {
    if !trusted_proxies.contains(&peer) {
        return Ok(peer);
    }

    if let Some(value) = headers.get(X_FORWARDED_FOR) {
        let raw = value.to_str().unwrap_or_default();
        let first = raw.split(',').next().unwrap_or_default().trim();
        return first
            .parse()
            .map_err(|_| MalformedRequest::ForwardedAddress(raw.to_string()));
    }

    if let Some(value) = headers.get(X_REAL_IP) {
        let raw = value.to_str().unwrap_or_default().trim();
        return raw
            .parse()
            .map_err(|_| MalformedRequest::ForwardedAddress(raw.to_string()));
    }

    Ok(peer)
}

/// A request target must be an absolute path.
pub fn validate_target(path: &str) -> Result<(), MalformedRequest> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(MalformedRequest::Target(path.to_string()))
    }
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// True if the request asks to switch to the WebSocket protocol.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_has_token(headers, header::CONNECTION, "upgrade")
        && header_has_token(headers, header::UPGRADE, "websocket")
}

/// Check the handshake headers of an upgrade request and return the client key.
pub fn websocket_key(headers: &HeaderMap) -> Result<&[u8], MalformedRequest> {
    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if version.trim() != WEBSOCKET_VERSION {
        return Err(MalformedRequest::WebSocketVersion(version.to_string()));
    }

    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|v| v.as_bytes())
        .filter(|v| !v.is_empty())
        .ok_or(MalformedRequest::MissingWebSocketKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_correlation_id_shape() {
        let id = correlation_id();
        assert_eq!(id.len(), 4);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_untrusted_peer_ignores_forwarding() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        let resolved = client_ip(ip("10.0.0.9"), &headers, &[ip("10.0.0.1")]).unwrap();
        assert_eq!(resolved, ip("10.0.0.9"));
    }

    #[test]
    fn test_trusted_proxy_uses_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4, 10.0.0.1"));
        headers.insert(X_REAL_IP, HeaderValue::from_static("5.6.7.8"));
        let resolved = client_ip(ip("10.0.0.1"), &headers, &[ip("10.0.0.1")]).unwrap();
        assert_eq!(resolved, ip("1.2.3.4"));
    }

    #[test]
    fn test_trusted_proxy_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REAL_IP, HeaderValue::from_static("5.6.7.8"));
        let resolved = client_ip(ip("10.0.0.1"), &headers, &[ip("10.0.0.1")]).unwrap();
        assert_eq!(resolved, ip("5.6.7.8"));
    }

    #[test]
    fn test_garbage_forwarded_header_is_malformed() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("not-an-ip"));
        let err = client_ip(ip("10.0.0.1"), &headers, &[ip("10.0.0.1")]).unwrap_err();
        assert!(matches!(err, MalformedRequest::ForwardedAddress(_)));
    }

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.remove(header::UPGRADE);
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn test_handshake_validation() {
        let mut headers = HeaderMap::new();
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        assert_eq!(websocket_key(&headers), Err(MalformedRequest::MissingWebSocketKey));

        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(websocket_key(&headers).is_ok());

        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert!(matches!(websocket_key(&headers), Err(MalformedRequest::WebSocketVersion(_))));
    }

    #[test]
    fn test_target_validation() {
        assert!(validate_target("/ok").is_ok());
        assert!(validate_target("*").is_err());
    }
}
