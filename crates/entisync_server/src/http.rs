//! Minimal HTTP/1.1 plumbing for the REST endpoint.
//!
//! The server speaks just enough HTTP for the sync protocol: a single
//! `POST /entisync` route with a JSON body, one request per connection.
//! Anything fancier belongs in a real reverse proxy in front of it.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The single route the REST endpoint serves.
pub(crate) const ENDPOINT_PATH: &str = "/entisync";

/// A parsed inbound request.
#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

/// Reads and parses one HTTP request from the stream.
pub(crate) async fn read_request<S>(
    stream: &mut S,
    config: &ServerConfig,
) -> ServerResult<ParsedRequest>
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    // Accumulate until the end of the header block.
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > config.max_header_bytes {
            return Err(ServerError::InvalidRequest("header block too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::InvalidRequest(
                "connection closed before headers".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| ServerError::InvalidRequest("headers are not valid UTF-8".into()))?;
    let mut lines = header_text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| ServerError::InvalidRequest("missing request line".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ServerError::InvalidRequest("missing method".into()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| ServerError::InvalidRequest("missing path".into()))?
        .to_string();

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| ServerError::InvalidRequest("bad content-length".into()))?;
            }
        }
    }

    if content_length > config.max_body_bytes {
        return Err(ServerError::BodyTooLarge {
            size: content_length,
            limit: config.max_body_bytes,
        });
    }

    // Body bytes already buffered past the header block, then the rest.
    let mut body = buf.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::InvalidRequest(
                "connection closed mid-body".into(),
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(ParsedRequest { method, path, body })
}

/// Writes a JSON response with the given status.
pub(crate) async fn write_response<S>(
    stream: &mut S,
    status: u16,
    body: &[u8],
) -> ServerResult<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
