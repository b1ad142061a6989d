//! Client side of the WebSocket opening handshake (RFC 6455 §4).

use super::Error;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use http::StatusCode;
use log::{debug, warn};
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use std::str::FromStr;
use url::Url;

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the size of the server's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

const NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Computes the Sec-WebSocket-Accept value from a Sec-WebSocket-Key.
///
/// The accept key is calculated as: Base64(SHA-1(key + GUID))
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// A fresh random Sec-WebSocket-Key.
pub fn generate_key() -> String {
    BASE64.encode(rand::random::<[u8; 16]>())
}

/// Run the opening handshake over `stream`, asking for `protocol`.
///
/// Returns the response headers on success. The stream's own timeouts
/// bound every read and write.
pub fn client_handshake<S: Read + Write + ?Sized>(
    stream: &mut S,
    url: &Url,
    protocol: &str,
) -> Result<HeaderMap, Error> {
    let key = generate_key();
    let request = build_request(url, &key, protocol)?;
    debug!("\r\n{}", request);

    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let head = read_response_head(stream)?;
    let (status, headers) = parse_response(&head)?;
    validate_response(status, &headers, &key, protocol)?;

    Ok(headers)
}

fn build_request(url: &Url, key: &str, protocol: &str) -> Result<String, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Handshake("URL has no host".into()))?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let target = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    Ok(format!(
        "GET {} HTTP/1.1\r\n\
        Host: {}\r\n\
        User-Agent: {}/{}\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: {}\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Protocol: {}\r\n\
        \r\n",
        target, host, NAME, VERSION, key, protocol
    ))
}

/// Read the response head one byte at a time so nothing past the blank
/// line is consumed; frames may follow immediately.
fn read_response_head<S: Read + ?Sized>(stream: &mut S) -> Result<Vec<u8>, Error> {
    let mut head: Vec<u8> = Vec::with_capacity(512);
    let mut one_byte_buffer = [0_u8];

    loop {
        stream.read_exact(&mut one_byte_buffer)?;
        head.push(one_byte_buffer[0]);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Handshake("response head too large".into()));
        }
    }
}

fn parse_response(head: &[u8]) -> Result<(StatusCode, HeaderMap), Error> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Handshake("response is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| Error::Handshake("empty response".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::Handshake(format!(
            "unexpected status line: {}",
            status_line
        )));
    }
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_str(code).ok())
        .ok_or_else(|| {
            Error::Handshake(format!("unexpected status line: {}", status_line))
        })?;

    let mut headers = HeaderMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = HeaderName::from_str(name.trim())
            .map_err(|_| Error::Handshake(format!("bad header name: {}", name)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| Error::Handshake(format!("bad header value for {}", name)))?;
        headers.append(name, value);
    }

    Ok((status, headers))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn validate_response(
    status: StatusCode,
    headers: &HeaderMap,
    key: &str,
    protocol: &str,
) -> Result<(), Error> {
    if status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::Handshake(format!("unexpected status {}", status)));
    }

    let upgrade = header_str(headers, &UPGRADE).unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::Handshake("missing Upgrade: websocket".into()));
    }

    let connection = header_str(headers, &CONNECTION).unwrap_or_default();
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(Error::Handshake("missing Connection: Upgrade".into()));
    }

    let accept = header_str(headers, &SEC_WEBSOCKET_ACCEPT).unwrap_or_default();
    if accept != compute_accept_key(key) {
        return Err(Error::Handshake("Sec-WebSocket-Accept mismatch".into()));
    }

    match header_str(headers, &SEC_WEBSOCKET_PROTOCOL) {
        Some(selected) if selected == protocol => Ok(()),
        Some(selected) => Err(Error::Handshake(format!(
            "server selected subprotocol {:?}",
            selected
        ))),
        None => {
            warn!("server did not echo subprotocol {}", protocol);
            Ok(())
        }
    }
}
