use crate::error::Error;
use crate::stream::TransportReader;
use bytes::BytesMut;
use std::collections::HashMap;
use tokio::io::AsyncBufReadExt;
use tokio::time::{timeout, Duration};
use url::Url;

const MAX_HEADER_SIZE: usize = 16 * 1024;
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADERS: usize = 64;

/// Builds the client upgrade request from a ws/wss URL. Returns the request
/// text, the `host:port` pair for the TCP connect, and whether the scheme
/// asks for TLS (which the caller provides via `connect_with_stream`).
pub fn construct_http_request(
    ws_url: &str,
    key: &str,
    extensions_header: Option<&str>,
    subprotocols: &[String],
) -> Result<(String, String, bool), Error> {
    let parsed_url = Url::parse(ws_url)?;

    let (default_port, secure) = match parsed_url.scheme() {
        "ws" => (80, false),
        "wss" => (443, true),
        _ => return Err(Error::InvalidSchemeURL),
    };

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?;
    let port = parsed_url.port().unwrap_or(default_port);

    // The Host header skips the port when the URL did, the TCP connect
    // string always needs it
    let request_host_field = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => String::from(host),
    };
    let host_with_port = format!("{}:{}", host, port);

    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
        request_path, request_host_field, key,
    );
    if let Some(extensions) = extensions_header {
        request.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", extensions));
    }
    if !subprotocols.is_empty() {
        request.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            subprotocols.join(", ")
        ));
    }
    request.push_str("\r\n");

    Ok((request, host_with_port, secure))
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    /// Case-insensitive header lookup; keys are stored lowercased.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

/// Reads from the transport until a full header block (`\r\n\r\n`) is
/// buffered, consuming nothing past it: frames pipelined right behind the
/// handshake stay in the buffer for the frame decoder. Bounded in both size
/// and time so a stalled or hostile peer can't pin the accept path.
async fn read_header_block(reader: &mut TransportReader) -> Result<BytesMut, Error> {
    let mut header_buf = BytesMut::with_capacity(1024);

    timeout(HEADER_READ_TIMEOUT, async {
        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Err(Error::IncompleteHTTPRequest);
            }

            let prev_len = header_buf.len();
            header_buf.extend_from_slice(available);

            // The delimiter may straddle the chunk boundary, hence searching
            // the accumulated buffer rather than just this chunk
            let delimiter = header_buf
                .windows(4)
                .position(|window| window == b"\r\n\r\n");
            if let Some(pos) = delimiter {
                let end = pos + 4;
                reader.consume(end - prev_len);
                header_buf.truncate(end);
                return Ok(());
            }

            let chunk_len = available.len();
            reader.consume(chunk_len);
            if header_buf.len() > MAX_HEADER_SIZE {
                return Err(Error::IncompleteHTTPRequest);
            }
        }
    })
    .await??;

    Ok(header_buf)
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HashMap<String, String>, Error> {
    let mut headers = HashMap::new();
    for header in raw {
        let key = header.name.to_ascii_lowercase();
        let value = String::from_utf8(header.value.to_vec())?;
        // Repeated headers fold into a comma-separated list, which is how
        // Sec-WebSocket-Extensions offers across lines are read back
        headers
            .entry(key)
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value.trim());
            })
            .or_insert_with(|| value.trim().to_string());
    }
    Ok(headers)
}

/// Parses the server-side upgrade request off the wire.
pub async fn parse_http_request(reader: &mut TransportReader) -> Result<HttpRequest, Error> {
    let buffer = read_header_block(reader).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(&buffer)? {
        httparse::Status::Partial => Err(Error::IncompleteHTTPRequest),
        httparse::Status::Complete(_) => {
            if request.version != Some(1) {
                return Err(Error::InvalidHTTPHandshake);
            }
            Ok(HttpRequest {
                method: request.method.unwrap_or_default().to_string(),
                path: request.path.unwrap_or_default().to_string(),
                headers: collect_headers(request.headers)?,
            })
        }
    }
}

/// Parses the client-side handshake response off the wire.
pub async fn parse_http_response(reader: &mut TransportReader) -> Result<HttpResponse, Error> {
    let buffer = read_header_block(reader).await?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(&buffer)? {
        httparse::Status::Partial => Err(Error::IncompleteHTTPRequest),
        httparse::Status::Complete(_) => Ok(HttpResponse {
            status: response.code.ok_or(Error::IncompleteHTTPRequest)?,
            headers: collect_headers(response.headers)?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_for_plain_url() {
        let (request, host_with_port, secure) =
            construct_http_request("ws://localhost:8080/chat?room=1", "a2V5", None, &[]).unwrap();
        assert!(!secure);
        assert_eq!(host_with_port, "localhost:8080");
        assert!(request.starts_with("GET /chat?room=1 HTTP/1.1"));
        assert!(request.contains("Host: localhost:8080"));
        assert!(request.contains("Upgrade: websocket"));
        assert!(request.contains("Sec-WebSocket-Key: a2V5"));
        assert!(request.contains("Sec-WebSocket-Version: 13"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_defaults_ports_by_scheme() {
        let (_, host_with_port, secure) =
            construct_http_request("wss://example.com/socket", "a2V5", None, &[]).unwrap();
        assert!(secure);
        assert_eq!(host_with_port, "example.com:443");
    }

    #[test]
    fn request_carries_extension_and_protocol_offers() {
        let (request, _, _) = construct_http_request(
            "ws://localhost:9001/",
            "a2V5",
            Some("permessage-deflate; client_max_window_bits"),
            &["chat.v2".to_string(), "chat.v1".to_string()],
        )
        .unwrap();
        assert!(request
            .contains("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n"));
        assert!(request.contains("Sec-WebSocket-Protocol: chat.v2, chat.v1\r\n"));
    }

    #[test]
    fn invalid_scheme_is_rejected() {
        assert!(construct_http_request("http://localhost/", "a2V5", None, &[]).is_err());
        assert!(construct_http_request("ws://:8080", "a2V5", None, &[]).is_err());
    }
}
