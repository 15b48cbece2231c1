/*!
Minimal HTTP plumbing for the Director surface: tolerant single-request
parsing (CRLFCRLF and LFLF header termination, 64 KiB header cap,
Content-Length bodies) and JSON response helpers with the loopback-only CORS
policy.
*/

use std::collections::HashMap;
use std::io::{self, Read, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Method {
    Get,
    Post,
    Options,
    Other(String),
}

#[derive(Debug, Clone)]
pub(crate) struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}

/// Parse a single HTTP request from a reader.
pub(crate) fn read_http_request<R: Read>(reader: &mut R) -> io::Result<HttpRequest> {
    const HDR_CAP: usize = 64 * 1024;
    const BODY_CAP: usize = 4 * 1024 * 1024;
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let mut header_end: Option<usize> = None;

    while header_end.is_none() && buf.len() < HDR_CAP {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        header_end = find_header_end(&buf);
    }
    let body_start = header_end.unwrap_or(buf.len());
    let header_bytes = &buf[..body_start];

    let header_str = String::from_utf8_lossy(header_bytes);
    let mut lines = header_str.lines();
    let request_line = lines.next().unwrap_or_default().trim().to_string();
    let mut it = request_line.split_whitespace();
    let method = match it.next().unwrap_or("") {
        "GET" => Method::Get,
        "POST" => Method::Post,
        "OPTIONS" => Method::Options,
        other => Method::Other(other.to_string()),
    };
    let path = it.next().unwrap_or("/").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let mut body: Vec<u8> = buf[body_start..].to_vec();
    if let Some(len) = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        let len = len.min(BODY_CAP);
        while body.len() < len {
            let n = reader.read(&mut tmp)?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&tmp[..n]);
        }
        body.truncate(len);
    }

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

/// CORS is restricted to loopback origins; anything else gets no allow
/// header and the browser refuses the response.
pub(crate) fn cors_origin(headers: &HashMap<String, String>) -> Option<String> {
    let origin = headers.get("origin")?;
    let trimmed = origin.trim();
    let loopback = ["http://localhost", "http://127.0.0.1", "https://localhost"]
        .iter()
        .any(|p| {
            trimmed == *p
                || trimmed
                    .strip_prefix(*p)
                    .map(|rest| rest.starts_with(':'))
                    .unwrap_or(false)
        });
    loopback.then(|| trimmed.to_string())
}

fn cors_headers(origin: Option<&str>) -> String {
    match origin {
        Some(o) => format!(
            "Access-Control-Allow-Origin: {o}\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type\r\n"
        ),
        None => String::new(),
    }
}

pub(crate) fn respond_json<W: Write>(
    w: &mut W,
    status: &str,
    origin: Option<&str>,
    body: &serde_json::Value,
) {
    let payload = body.to_string();
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n",
        cors_headers(origin),
        payload.len()
    );
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(payload.as_bytes());
    let _ = w.flush();
}

pub(crate) fn respond_no_content<W: Write>(w: &mut W, origin: Option<&str>) {
    let header = format!(
        "HTTP/1.1 204 No Content\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
        cors_headers(origin)
    );
    let _ = w.write_all(header.as_bytes());
    let _ = w.flush();
}

pub(crate) fn ok_envelope(data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "success": true, "data": data })
}

pub(crate) fn err_envelope(error: &str) -> serde_json::Value {
    serde_json::json!({ "success": false, "error": error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_get_with_crlf() {
        let raw = b"GET /api/session HTTP/1.1\r\nHost: x\r\nOrigin: http://localhost:5173\r\n\r\n";
        let req = read_http_request(&mut Cursor::new(&raw[..])).expect("parse");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/api/session");
        assert_eq!(
            req.headers.get("origin").map(|s| s.as_str()),
            Some("http://localhost:5173")
        );
    }

    #[test]
    fn test_parse_post_body_lf_only() {
        let raw = b"POST /api/nudge HTTP/1.1\nContent-Length: 9\n\n{\"a\": 1}X";
        let req = read_http_request(&mut Cursor::new(&raw[..])).expect("parse");
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.body, b"{\"a\": 1}X");
    }

    #[test]
    fn test_cors_loopback_only() {
        let mut h = HashMap::new();
        h.insert("origin".to_string(), "http://localhost:5173".to_string());
        assert_eq!(cors_origin(&h).as_deref(), Some("http://localhost:5173"));
        h.insert("origin".to_string(), "http://127.0.0.1:8000".to_string());
        assert!(cors_origin(&h).is_some());
        h.insert("origin".to_string(), "http://evil.example".to_string());
        assert!(cors_origin(&h).is_none());
        h.insert(
            "origin".to_string(),
            "http://localhost.evil.example".to_string(),
        );
        assert!(cors_origin(&h).is_none());
    }

    #[test]
    fn test_envelopes() {
        assert_eq!(
            ok_envelope(serde_json::json!(1)).to_string(),
            "{\"data\":1,\"success\":true}"
        );
        assert!(err_envelope("nope").to_string().contains("\"success\":false"));
    }
}
