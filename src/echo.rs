//! Request echo formatting.
//!
//! Renders an inbound request as a text block:
//!
//! ```text
//! GET /path?q=1 HTTP/1.1
//!
//! Host: example.com
//! Accept: */*
//! User-Agent: curl/8.0
//!
//! <body, if any>
//! ```
//!
//! Headers are listed in canonical `Title-Case` form, sorted by name, one
//! line per value. The same block is the body of plain HTTP responses and
//! the payload of the SSE `request` event.

use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Version};
use std::fmt::Write;

/// Render the request line, headers and body.
pub fn format_request(parts: &Parts, body: &[u8]) -> Vec<u8> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = String::with_capacity(256);
    let _ = writeln!(out, "{} {} {}", parts.method, path, protocol(parts.version));
    out.push('\n');
    let _ = writeln!(out, "Host: {}", host(parts));
    out.push_str(&format_headers(&parts.headers));

    let mut out = out.into_bytes();
    if !body.is_empty() {
        out.push(b'\n');
        out.extend_from_slice(body);
    }
    out
}

/// Header lines, sorted by canonical name. `Host` is left out.
pub fn format_headers(headers: &HeaderMap) -> String {
    let mut names: Vec<_> = headers
        .keys()
        .filter(|name| **name != header::HOST)
        .map(|name| (canonical_name(name.as_str()), name))
        .collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::new();
    for (canonical, name) in names {
        for value in headers.get_all(name) {
            let _ = writeln!(out, "{}: {}", canonical, String::from_utf8_lossy(value.as_bytes()));
        }
    }
    out
}

/// Protocol token as it appears on an HTTP/1 request line.
pub fn protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Host the client addressed: the `Host` header, else the URI authority
/// (HTTP/2 carries it as `:authority`).
pub fn host(parts: &Parts) -> String {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Project page linked from the footer.
pub const LEARN_MORE_URL: &str = "https://websocket.org/tools/websocket-echo-server";

const BANNER: &str = r"         __      __   _                 _        _                    
         \ \    / /__| |__  ___ ___  __| |_____| |_                  
          \ \/\/ / -_) '_ \(_-</ _ \/ _| / / -_)  _|                 
           \_/\_/\___|_.__//__/\___/\__|_\_\___|\__|                 
";

/// Footer for plain HTTP responses, pointing at the interactive endpoints.
pub fn footer(parts: &Parts) -> String {
    let forwarded_https = parts
        .headers
        .get("x-forwarded-proto")
        .is_some_and(|v| v.as_bytes() == b"https");
    let scheme = if forwarded_https || parts.uri.scheme_str() == Some("https") {
        "https"
    } else {
        "http"
    };
    let host = host(parts);

    let rule = "-".repeat(70);
    format!(
        "\n{rule}\n{BANNER}\n  \
         WebSocket UI: {scheme}://{host}/.ws  |  SSE: {scheme}://{host}/.sse\n  \
         Learn more: {LEARN_MORE_URL}\n\
         {rule}\n"
    )
}

/// `name` in canonical form: `x-forwarded-for` becomes `X-Forwarded-For`.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Canonical hex dump: offset, 16 bytes split in two groups of eight, and
/// a printable-ASCII gutter.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 16);
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}
