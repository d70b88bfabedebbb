//! Per-exchange request data handed to handlers.

use std::net::{IpAddr, Ipv4Addr};

use axum::http::{HeaderMap, Method, Uri};
use bytes::Bytes;

use crate::http::body::ParsedBody;
use crate::http::request::X_FORWARDED_URI;
use crate::http::values::ValuesMap;
use crate::lifecycle::ShutdownSignal;
use crate::routing::RouteParams;

/// Request metadata shared by HTTP exchanges and WebSocket sessions.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub query: ValuesMap,
    pub params: RouteParams,
    pub remote_ip: IpAddr,
    pub correlation_id: String,
}

impl RequestInfo {
    /// Metadata for `uri` with no headers, no parameters and a loopback caller.
    pub fn new(method: Method, uri: Uri) -> Self {
        let query = ValuesMap::from_query(uri.query());
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            query,
            params: RouteParams::new(),
            remote_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            correlation_id: String::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// `"<ip> <correlation id>"`, the prefix used in exchange log lines.
    pub fn client_id(&self) -> String {
        format!("{} {}", self.remote_ip, self.correlation_id)
    }

    /// The original URI as reported by a fronting proxy.
    pub fn forwarded_uri(&self) -> Option<&str> {
        self.headers.get(X_FORWARDED_URI).and_then(|v| v.to_str().ok())
    }
}

/// Everything an HTTP handler can read about its request.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    info: RequestInfo,
    body: Bytes,
    parsed: ParsedBody,
    shutdown: ShutdownSignal,
}

impl ExchangeContext {
    pub fn new(info: RequestInfo, body: Bytes, parsed: ParsedBody, shutdown: ShutdownSignal) -> Self {
        Self {
            info,
            body,
            parsed,
            shutdown,
        }
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn method(&self) -> &Method {
        &self.info.method
    }

    pub fn path(&self) -> &str {
        self.info.path()
    }

    pub fn uri(&self) -> &Uri {
        &self.info.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.info.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.info.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query(&self) -> &ValuesMap {
        &self.info.query
    }

    pub fn params(&self) -> &RouteParams {
        &self.info.params
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.info.remote_ip
    }

    pub fn correlation_id(&self) -> &str {
        &self.info.correlation_id
    }

    pub fn forwarded_uri(&self) -> Option<&str> {
        self.info.forwarded_uri()
    }

    /// Raw request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn parsed_body(&self) -> &ParsedBody {
        &self.parsed
    }

    pub fn form(&self) -> Option<&ValuesMap> {
        self.parsed.as_form()
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        self.parsed.as_json()
    }

    /// Process-wide shutdown signal, for handlers with long waits of their own.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}
