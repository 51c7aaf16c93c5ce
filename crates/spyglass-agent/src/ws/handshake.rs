//! RFC 6455 opening handshake (server side)
//!
//! Validates the HTTP/1.1 upgrade request and answers with
//! `Sec-WebSocket-Accept = Base64(SHA1(key ++ GUID))`. A malformed request
//! is an error; the caller closes the connection without a response body.

use super::sha1::sha1;
use std::io::{self, Read, Write};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// Cap on the upgrade request size
const MAX_REQUEST: usize = 8 * 1024;

/// Perform the server side of the upgrade on a fresh connection.
pub fn accept<S: Read + Write>(stream: &mut S) -> io::Result<()> {
    let request = read_request(stream)?;
    let key = validate_request(&request)
        .map_err(|msg| io::Error::new(io::ErrorKind::InvalidData, msg))?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key(&key)
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// Compute the accept key for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut combined = client_key.trim().to_string();
    combined.push_str(WEBSOCKET_GUID);
    base64_encode(&sha1(combined.as_bytes()))
}

/// Read the raw HTTP request up to the blank line.
fn read_request<S: Read>(stream: &mut S) -> io::Result<String> {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];

    while !buffer.ends_with(b"\r\n\r\n") {
        if buffer.len() >= MAX_REQUEST {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upgrade request too large",
            ));
        }
        stream.read_exact(&mut byte)?;
        buffer.push(byte[0]);
    }

    String::from_utf8(buffer)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "request is not UTF-8"))
}

/// Check the upgrade headers and extract the client key.
fn validate_request(request: &str) -> Result<String, &'static str> {
    let mut lines = request.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    if !request_line.starts_with("GET ") {
        return Err("not a GET request");
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut key = None;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => {
                connection_ok = value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
            }
            "sec-websocket-key" => key = Some(value.to_string()),
            _ => {}
        }
    }

    if !upgrade_ok {
        return Err("missing Upgrade: websocket header");
    }
    if !connection_ok {
        return Err("missing Connection: Upgrade header");
    }
    key.ok_or("missing Sec-WebSocket-Key header")
}

/// Standard Base64 with padding.
pub fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);

    for chunk in data.chunks(3) {
        let n = (chunk[0] as u32) << 16
            | (chunk.get(1).copied().unwrap_or(0) as u32) << 8
            | chunk.get(2).copied().unwrap_or(0) as u32;

        out.push(ALPHABET[(n >> 18 & 0x3F) as usize] as char);
        out.push(ALPHABET[(n >> 12 & 0x3F) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(n >> 6 & 0x3F) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[(n & 0x3F) as usize] as char
        } else {
            '='
        });
    }

    out
}
