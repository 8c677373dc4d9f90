//! Minimal HTTP types: request head parsing and response serialization.
//!
//! The server speaks just enough HTTP/1.1 for its own surface; the parser
//! consumes a complete header block (everything up to `\r\n\r\n`) and the
//! response writer emits status line, headers, and body. Anything more
//! exotic (chunked request bodies, trailers) is rejected upstream.

use std::collections::HashMap;

/// A parsed request head plus its (possibly disk-staged) body handle.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    /// HTTP method, uppercase.
    pub method: String,
    /// Path component of the request target (no query).
    pub path: String,
    /// Raw query string without the `?`, empty when absent.
    pub query: String,
    /// Header map with lowercase names.
    pub headers: HashMap<String, String>,
}

impl RequestHead {
    /// Parse the header block (without the terminating blank line).
    ///
    /// Returns `None` for anything that is not a well-formed request head.
    #[must_use]
    pub fn parse(header_block: &str) -> Option<Self> {
        let mut lines = header_block.split("\r\n");
        let request_line = lines.next()?;
        let mut parts = request_line.split(' ');
        let method = parts.next()?.to_uppercase();
        let target = parts.next()?;
        let version = parts.next()?;
        if !version.starts_with("HTTP/1.") {
            return None;
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (target.to_string(), String::new()),
        };

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':')?;
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }

        Some(Self { method, path, query, headers })
    }

    /// A header value by lowercase name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The Content-Length, `0` when absent, `None` when unparseable.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        match self.header("content-length") {
            Some(value) => value.trim().parse().ok(),
            None => Some(0),
        }
    }

    /// The value of one cookie from the `Cookie` header.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        let cookies = self.header("cookie")?;
        for pair in cookies.split(';') {
            let (key, value) = pair.split_once('=')?;
            if key.trim() == name {
                return Some(value.trim());
            }
        }
        None
    }

    /// Decode the query string into key/value pairs.
    #[must_use]
    pub fn query_params(&self) -> HashMap<String, String> {
        parse_query(&self.query)
    }
}

/// Decode `a=1&b=two` with percent-decoding of both keys and values.
#[must_use]
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Percent-decode a URL component; `+` decodes to space.
#[must_use]
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            },
            b'%' if i + 2 < bytes.len() => {
                let hex = &input[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    },
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    },
                }
            },
            byte => {
                out.push(byte);
                i += 1;
            },
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// An HTTP response ready for serialization.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Content type.
    pub content_type: String,
    /// Body bytes.
    pub body: Vec<u8>,
    /// Extra headers, already formatted as `Name: value` pairs.
    pub extra_headers: Vec<String>,
}

impl Response {
    /// A response with the given status, content type, and body.
    #[must_use]
    pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            body: body.into(),
            extra_headers: Vec::new(),
        }
    }

    /// 200 JSON response from a serializable value.
    #[must_use]
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(200, "application/json", value.to_string())
    }

    /// 200 HTML response.
    #[must_use]
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(200, "text/html; charset=utf-8", body.into().into_bytes())
    }

    /// Plain-text response with a status code.
    #[must_use]
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status, "text/plain; charset=utf-8", body.into().into_bytes())
    }

    /// JSON error with a status code.
    #[must_use]
    pub fn error(status: u16, message: &str) -> Self {
        Self::new(
            status,
            "application/json",
            serde_json::json!({ "error": message }).to_string(),
        )
    }

    /// 302 redirect, optionally setting a cookie.
    #[must_use]
    pub fn redirect(location: &str, set_cookie: Option<String>) -> Self {
        let mut response = Self::new(302, "text/html; charset=utf-8", Vec::new());
        response.extra_headers.push(format!("Location: {location}"));
        if let Some(cookie) = set_cookie {
            response.extra_headers.push(format!("Set-Cookie: {cookie}"));
        }
        response
    }

    /// Attach an extra header.
    #[must_use]
    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.extra_headers.push(header.into());
        self
    }

    /// Serialize status line, headers, and body.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason = reason_phrase(self.status);
        let mut out = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n",
            self.status,
            reason,
            self.content_type,
            self.body.len()
        )
        .into_bytes();
        for header in &self.extra_headers {
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}
