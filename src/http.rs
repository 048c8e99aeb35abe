//! One-shot HTTP GET adapter.
//!
//! An HTTP connection carries exactly one logical command.  The request URI
//! is percent-decoded and either names a core plus a command
//! (`/<corename>/<command...>`) or a bare server command (`/<command>`).
//! The core's first status line is wrapped in an `HTTP/1.0` response whose
//! status code mirrors the status token; the raw status line is preserved in
//! an `X-GraphProcessor` header and streams as the first body line.

use crate::protocol::{DENIED_STR, ERROR_STR, FAIL_STR, NONE_STR, SUCCESS_STR, VALUE_STR};

/// Percent-decoding failure; the request is rejected with a `FAILURE` status.
#[derive(Debug, PartialEq, Eq)]
pub struct BadUriEncoding;

/// Decode a request URI: `+` becomes a space, `%%` a literal `%`, and `%HH`
/// the corresponding byte, which must be printable ASCII.  A single leading
/// `/` is removed.
pub fn percent_decode(uri: &str) -> Result<String, BadUriEncoding> {
    let bytes = uri.as_bytes();
    let mut out = String::with_capacity(uri.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(' ');
                i += 1;
            }
            b'%' => {
                if bytes.get(i + 1) == Some(&b'%') {
                    out.push('%');
                    i += 2;
                    continue;
                }
                let hex = bytes.get(i + 1..i + 3).ok_or(BadUriEncoding)?;
                let hex = std::str::from_utf8(hex).map_err(|_| BadUriEncoding)?;
                let byte = u8::from_str_radix(hex, 16).map_err(|_| BadUriEncoding)?;
                if !(byte == b' ' || byte.is_ascii_graphic()) {
                    return Err(BadUriEncoding);
                }
                out.push(byte as char);
                i += 3;
            }
            b'/' if i == 0 => {
                i += 1;
            }
            b => {
                out.push(b as char);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Where a decoded request path routes to.
#[derive(Debug, PartialEq, Eq)]
pub enum UriTarget {
    /// Empty request path: answer with the server banner.
    Empty,
    /// A single path component: run it as a bare server command.
    ServerCommand(String),
    /// `corename/command...`: bind to the named core, run the rest.
    CoreCommand { core: String, command: String },
}

/// Split a decoded path on `/`, ignoring empty components.  With two or more
/// components the first names the core and the remainder, slashes preserved,
/// is the command.
pub fn split_uri(decoded: &str) -> UriTarget {
    let components: Vec<&str> = decoded.split('/').filter(|c| !c.is_empty()).collect();
    match components.len() {
        0 => UriTarget::Empty,
        1 => UriTarget::ServerCommand(decoded.to_string()),
        _ => {
            let core = components[0];
            let start = decoded.find(core).expect("component comes from decoded") + core.len();
            let command = decoded[start..].trim_start_matches('/').to_string();
            UriTarget::CoreCommand {
                core: core.to_string(),
                command,
            }
        }
    }
}

/// Parse `METHOD URI VERSION`. The version is case-normalized; only
/// HTTP/1.0 and HTTP/1.1 are accepted.  No method check beyond structure.
pub fn parse_request_line(line: &str) -> Result<(String, String), RequestError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let [method, uri, version] = words[..] else {
        return Err(RequestError::BadRequestLine);
    };
    let version = version.to_ascii_uppercase();
    if version != "HTTP/1.0" && version != "HTTP/1.1" {
        return Err(RequestError::UnknownVersion);
    }
    Ok((method.to_string(), uri.to_string()))
}

#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    BadRequestLine,
    UnknownVersion,
}

/// Map a reply status line onto an HTTP status code by its first token.
pub fn status_for_line(line: &str) -> (u16, &'static str) {
    match line.split_whitespace().next().unwrap_or("") {
        t if t == SUCCESS_STR => (200, "OK"),
        t if t == FAIL_STR => (400, "Bad Request"),
        t if t == ERROR_STR => (500, "Internal Server Error"),
        t if t == NONE_STR => (404, "Not Found"),
        t if t == DENIED_STR => (401, "Unauthorized"),
        t if t == VALUE_STR => (222, "Value Follows"),
        _ => (500, "Internal Server Error"),
    }
}

/// Render the response header. The reply always claims `HTTP/1.0` and closes
/// after one response; `x_graphprocessor` carries the raw status line.
pub fn response_header(code: u16, title: &str, x_graphprocessor: Option<&str>) -> String {
    let mut out = format!("HTTP/1.0 {code} {title}\r\nContent-Type: text/plain\r\n");
    if let Some(status_line) = x_graphprocessor {
        out.push_str("X-GraphProcessor: ");
        out.push_str(status_line.trim_end());
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}
