//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so different
//! implementations can be plugged in; a minimal blocking client over
//! `std::net::TcpStream` is provided for the demo binaries.

use crate::error::{SyncError, SyncResult};
use crate::transport::Transport;
use entisync_protocol::{RequestBody, ResponseBody};
use parking_lot::RwLock;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Request path served by the entity server.
pub const ENDPOINT_PATH: &str = "/entisync";

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. This
/// allows using different HTTP libraries or even non-HTTP transports.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based transport.
///
/// Uses JSON encoding for request/response bodies and posts everything
/// to a single endpoint.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the server (e.g., "http://sync.example.com:8080").
    base_url: String,
    client: C,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }
}

impl<C: HttpClient> Transport for HttpTransport<C> {
    fn send(&self, request: &RequestBody) -> SyncResult<ResponseBody> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = serde_json::to_vec(request)
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;

        let url = format!("{}{}", self.base_url, ENDPOINT_PATH);
        let response_body = self.client.post(&url, body).map_err(|e| {
            self.set_error(&e);
            self.connected.store(false, Ordering::SeqCst);
            SyncError::transport_retryable(e)
        })?;

        self.clear_error();

        serde_json::from_slice(&response_body)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Minimal blocking HTTP/1.1 client over a TCP stream.
///
/// One connection per request, `connection: close`. Only what the demo
/// binaries need; production deployments would implement [`HttpClient`]
/// with a real HTTP library.
#[derive(Debug, Clone)]
pub struct PlainHttpClient {
    timeout: Duration,
}

impl PlainHttpClient {
    /// Creates a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PlainHttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpClient for PlainHttpClient {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        let (authority, path) = split_url(url)?;

        let stream = TcpStream::connect(authority).map_err(|e| e.to_string())?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| e.to_string())?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| e.to_string())?;
        let mut stream = stream;

        let head = format!(
            "POST {path} HTTP/1.1\r\nhost: {authority}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).map_err(|e| e.to_string())?;
        stream.write_all(&body).map_err(|e| e.to_string())?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).map_err(|e| e.to_string())?;
        parse_response(&raw)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Splits "http://host:port/ignored" into ("host:port", "/path").
fn split_url(url: &str) -> Result<(&str, &str), String> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| format!("unsupported url: {url}"))?;
    match rest.find('/') {
        Some(slash) => Ok((&rest[..slash], &rest[slash..])),
        None => Ok((rest, "/")),
    }
}

/// Extracts the body from a raw HTTP/1.1 response.
///
/// Status is not inspected beyond well-formedness: the server reports
/// store-level errors in-band, and the wire body carries the error kind
/// either way.
fn parse_response(raw: &[u8]) -> Result<Vec<u8>, String> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or("malformed http response")?;
    let head = std::str::from_utf8(&raw[..header_end]).map_err(|e| e.to_string())?;
    if !head.starts_with("HTTP/1.1 ") && !head.starts_with("HTTP/1.0 ") {
        return Err("malformed http status line".into());
    }
    Ok(raw[header_end + 4..].to_vec())
}
