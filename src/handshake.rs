use crate::config::{ClientConfig, WebSocketConfig};
use crate::connection::WSConnection;
use crate::error::Error;
use crate::extensions::{client_offers, negotiate_client, negotiate_server, parse_offers};
use crate::request::{
    construct_http_request, parse_http_request, parse_http_response, HttpRequest,
};
use crate::stream::{Transport, TransportStream, TransportWriter};
use crate::utils::{generate_websocket_accept_value, generate_websocket_key, is_valid_websocket_key};
use crate::Role;
use log::debug;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const BAD_REQUEST_RESPONSE: &str =
    "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const METHOD_NOT_ALLOWED_RESPONSE: &str =
    "HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Accepts one server-side WebSocket connection with default configuration.
pub async fn accept_async<S: Transport + 'static>(stream: S) -> Result<WSConnection, Error> {
    accept_async_with_config(stream, None).await
}

/// Accepts one server-side WebSocket connection, negotiating extensions and
/// subprotocols from the supplied configuration.
pub async fn accept_async_with_config<S: Transport + 'static>(
    stream: S,
    config: Option<WebSocketConfig>,
) -> Result<WSConnection, Error> {
    server_handshake(
        Box::new(stream),
        config.unwrap_or_default(),
        None::<fn(&HttpRequest) -> bool>,
    )
    .await
}

/// Same as [`accept_async_with_config`], with an upgrade predicate: when it
/// declines, the client gets `405 Method Not Allowed` instead of `101` and no
/// connection is established.
pub async fn accept_async_with_predicate<S, P>(
    stream: S,
    config: Option<WebSocketConfig>,
    predicate: P,
) -> Result<WSConnection, Error>
where
    S: Transport + 'static,
    P: FnOnce(&HttpRequest) -> bool,
{
    server_handshake(Box::new(stream), config.unwrap_or_default(), Some(predicate)).await
}

async fn server_handshake<P>(
    stream: TransportStream,
    config: WebSocketConfig,
    predicate: Option<P>,
) -> Result<WSConnection, Error>
where
    P: FnOnce(&HttpRequest) -> bool,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut buf_reader = BufReader::new(read_half);

    let request = parse_http_request(&mut buf_reader).await?;

    if let Err(error) = validate_upgrade_request(&request) {
        debug!("rejecting upgrade request: {}", error);
        respond_and_bail(&mut write_half, BAD_REQUEST_RESPONSE).await?;
        return Err(error);
    }

    if let Some(predicate) = predicate {
        if !predicate(&request) {
            respond_and_bail(&mut write_half, METHOD_NOT_ALLOWED_RESPONSE).await?;
            return Err(Error::UpgradeDeclined(405));
        }
    }

    // validate_upgrade_request established the key is present and well formed
    let key = request.header("sec-websocket-key").unwrap_or_default();
    let accept_value = generate_websocket_accept_value(key);

    let offers = request
        .header("sec-websocket-extensions")
        .map(parse_offers)
        .unwrap_or_default();
    let (extensions_header, pipeline) = match negotiate_server(&config.extensions, &offers) {
        Ok(negotiated) => negotiated,
        Err(error) => {
            debug!("extension negotiation failed: {}", error);
            respond_and_bail(&mut write_half, BAD_REQUEST_RESPONSE).await?;
            return Err(error);
        }
    };

    let protocol = request
        .header("sec-websocket-protocol")
        .and_then(|offered| select_subprotocol(offered, &config.subprotocols));

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\n",
        accept_value,
    );
    if let Some(extensions) = &extensions_header {
        response.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", extensions));
    }
    if let Some(protocol) = &protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
    }
    response.push_str("\r\n");

    write_half.write_all(response.as_bytes()).await?;
    write_half.flush().await?;

    Ok(WSConnection::spawn(
        buf_reader,
        write_half,
        Role::Server,
        config,
        pipeline,
        protocol,
    ))
}

async fn respond_and_bail(write_half: &mut TransportWriter, response: &str) -> Result<(), Error> {
    write_half.write_all(response.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}

fn validate_upgrade_request(request: &HttpRequest) -> Result<(), Error> {
    if request.method != "GET" {
        return Err(Error::InvalidHTTPHandshake);
    }
    if !header_has_token(request.header("connection"), "upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }
    if !header_has_token(request.header("upgrade"), "websocket") {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if request.header("sec-websocket-version") != Some("13") {
        return Err(Error::UnsupportedWebsocketVersion);
    }
    match request.header("sec-websocket-key") {
        Some(key) if is_valid_websocket_key(key) => Ok(()),
        _ => Err(Error::NoSecWebsocketKey),
    }
}

// `Connection: keep-alive, Upgrade` style lists are fine, matching is per
// token and case-insensitive
fn header_has_token(value: Option<&str>, token: &str) -> bool {
    value
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

fn select_subprotocol(offered: &str, supported: &[String]) -> Option<String> {
    offered
        .split(',')
        .map(str::trim)
        .find(|token| supported.iter().any(|s| s == token))
        .map(str::to_string)
}

/// Connects to a `ws://` URL over plain TCP with default configuration.
pub async fn connect_async(ws_url: &str) -> Result<WSConnection, Error> {
    connect_async_with_config(ws_url, None).await
}

/// Connects to a `ws://` URL over plain TCP. `wss://` URLs are refused here:
/// establish the TLS stream yourself and hand it to [`connect_with_stream`].
pub async fn connect_async_with_config(
    ws_url: &str,
    config: Option<ClientConfig>,
) -> Result<WSConnection, Error> {
    let config = config.unwrap_or_default().web_socket_config;
    let key = generate_websocket_key();
    let offers = client_offers(&config.extensions);
    let (request, host_with_port, secure) =
        construct_http_request(ws_url, &key, offers.as_deref(), &config.subprotocols)?;
    if secure {
        return Err(Error::InvalidSchemeURL);
    }

    let stream = TcpStream::connect(host_with_port).await?;
    client_handshake(Box::new(stream), request, key, config).await
}

/// Performs the client handshake over an already-established transport (for
/// example a TLS stream for a `wss://` URL).
pub async fn connect_with_stream<S: Transport + 'static>(
    stream: S,
    ws_url: &str,
    config: Option<ClientConfig>,
) -> Result<WSConnection, Error> {
    let config = config.unwrap_or_default().web_socket_config;
    let key = generate_websocket_key();
    let offers = client_offers(&config.extensions);
    let (request, _, _) =
        construct_http_request(ws_url, &key, offers.as_deref(), &config.subprotocols)?;
    client_handshake(Box::new(stream), request, key, config).await
}

async fn client_handshake(
    stream: TransportStream,
    request: String,
    key: String,
    config: WebSocketConfig,
) -> Result<WSConnection, Error> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut buf_reader = BufReader::new(read_half);

    write_half.write_all(request.as_bytes()).await?;
    write_half.flush().await?;

    let response = parse_http_response(&mut buf_reader).await?;

    if response.status != 101 {
        return Err(Error::NoUpgrade);
    }
    if !header_has_token(response.header("upgrade"), "websocket")
        || !header_has_token(response.header("connection"), "upgrade")
    {
        return Err(Error::NoUpgrade);
    }

    let expected_accept = generate_websocket_accept_value(&key);
    match response.header("sec-websocket-accept") {
        Some(accept) if accept == expected_accept => {}
        _ => return Err(Error::InvalidAcceptKey),
    }

    let pipeline = negotiate_client(
        &config.extensions,
        response.header("sec-websocket-extensions"),
    )?;

    let protocol = match response.header("sec-websocket-protocol") {
        Some(protocol) => {
            if !config.subprotocols.iter().any(|s| s == protocol) {
                return Err(Error::UnsolicitedSubprotocol(protocol.to_string()));
            }
            Some(protocol.to_string())
        }
        None => None,
    };

    Ok(WSConnection::spawn(
        buf_reader,
        write_half,
        Role::Client,
        config,
        pipeline,
        protocol,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_header_token_matching() {
        assert!(header_has_token(Some("Upgrade"), "upgrade"));
        assert!(header_has_token(Some("keep-alive, Upgrade"), "upgrade"));
        assert!(!header_has_token(Some("keep-alive"), "upgrade"));
        assert!(!header_has_token(None, "upgrade"));
    }

    #[test]
    fn subprotocol_first_client_match_wins() {
        let supported = vec!["chat.v1".to_string(), "chat.v2".to_string()];
        assert_eq!(
            select_subprotocol("chat.v2, chat.v1", &supported),
            Some("chat.v2".to_string())
        );
        assert_eq!(select_subprotocol("graphql-ws", &supported), None);
    }
}
