use crate::error::IngestError;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref NUMERIC_SEGMENT: Regex = Regex::new(r"^\d+$").unwrap();
    static ref UUID_SEGMENT: Regex = Regex::new(
        r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$"
    )
    .unwrap();
}

/// Request or response body, decoded according to Content-Type.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(serde_json::Value),
    Text(String),
}

impl Body {
    pub fn as_text(&self) -> String {
        match self {
            Body::Json(v) => v.to_string(),
            Body::Text(t) => t.clone(),
        }
    }

    pub fn encoding(&self) -> &'static str {
        match self {
            Body::Json(_) => "json",
            Body::Text(_) => "text",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Body>,
    pub raw: String,
    /// Caller-supplied capture timestamp (ISO-8601) or empty.
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status_code: u16,
    pub status_message: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Body>,
    pub raw: String,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    /// Full URL for this request. Proxied captures carry an
    /// absolute-form target; origin-form paths are joined with the
    /// Host header.
    pub fn url(&self) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return self.path.clone();
        }
        let host = self.header("Host").unwrap_or("unknown");
        format!("http://{}{}", host, self.path)
    }

    pub fn has_json_body(&self) -> bool {
        matches!(self.body, Some(Body::Json(_)))
    }
}

/// Parse a raw HTTP request blob. The start line must have exactly
/// three fields; header lines are consumed until the first blank line
/// and the remainder is the body.
pub fn parse_request(raw: &str, timestamp: &str) -> Result<HttpRequest, IngestError> {
    let lines: Vec<&str> = raw.split("\r\n").collect();

    let request_line = lines.first().copied().unwrap_or("");
    let parts: Vec<&str> = request_line.splitn(3, ' ').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(IngestError::Parse(format!(
            "invalid request line: {request_line:?}"
        )));
    }

    let (headers, body_raw) = split_headers(&lines);
    let body = parse_body(&body_raw, headers.get("Content-Type").map(|s| s.as_str()));

    Ok(HttpRequest {
        method: parts[0].to_string(),
        path: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
        body,
        raw: raw.to_string(),
        timestamp: timestamp.to_string(),
    })
}

/// Parse a raw HTTP response blob. The status line needs at least a
/// version and a numeric status code.
pub fn parse_response(raw: &str) -> Result<HttpResponse, IngestError> {
    let lines: Vec<&str> = raw.split("\r\n").collect();

    let status_line = lines.first().copied().unwrap_or("");
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return Err(IngestError::Parse(format!(
            "invalid status line: {status_line:?}"
        )));
    }
    let status_code: u16 = parts[1]
        .parse()
        .map_err(|_| IngestError::Parse(format!("invalid status code: {:?}", parts[1])))?;

    let (headers, body_raw) = split_headers(&lines);
    let body = parse_body(&body_raw, headers.get("Content-Type").map(|s| s.as_str()));

    Ok(HttpResponse {
        version: parts[0].to_string(),
        status_code,
        status_message: parts.get(2).unwrap_or(&"").to_string(),
        headers,
        body,
        raw: raw.to_string(),
    })
}

fn split_headers(lines: &[&str]) -> (HashMap<String, String>, String) {
    let mut headers = HashMap::new();
    let mut body_start = lines.len();

    for (i, line) in lines.iter().enumerate().skip(1) {
        if line.is_empty() {
            body_start = i + 1;
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let body_raw = if body_start < lines.len() {
        lines[body_start..].join("\r\n")
    } else {
        String::new()
    };

    (headers, body_raw)
}

fn parse_body(body_raw: &str, content_type: Option<&str>) -> Option<Body> {
    if body_raw.trim().is_empty() {
        return None;
    }

    if content_type.is_some_and(|ct| ct.contains("application/json")) {
        if let Ok(value) = serde_json::from_str(body_raw) {
            return Some(Body::Json(value));
        }
    }

    Some(Body::Text(body_raw.to_string()))
}

/// Rewrite numeric and UUID-shaped path segments to a `{id}`
/// placeholder, turning a concrete path into an endpoint pattern.
/// Only whole segments are rewritten; `/items/42abc` stays as is.
pub fn endpoint_pattern(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if NUMERIC_SEGMENT.is_match(segment) || UUID_SEGMENT.is_match(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
