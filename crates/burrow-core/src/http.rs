use time::{OffsetDateTime, macros::format_description};

use crate::net::Headers;

/// Both header-block terminators the front-end peeks for, strictest first.
pub const HEADER_TERMINATORS: &[&[u8]] = &[b"\r\n\r\n", b"\n\n"];

/// Parses a raw request head into a lower-cased header map. The request line
/// carries no colon and falls out naturally; malformed lines are skipped.
pub fn parse_headers(head: &[u8]) -> Headers {
	let mut headers = Headers::new();
	let text = String::from_utf8_lossy(head);
	for line in text.split('\n') {
		let Some((key, value)) = line.split_once(':') else {
			continue;
		};
		let key = key.trim().to_ascii_lowercase();
		let value = value.trim().to_string();
		if key.is_empty() || value.is_empty() {
			continue;
		}
		headers.insert(key, value);
	}
	headers
}

/// First line of a request head as `(method, path)`.
pub fn request_line(head: &[u8]) -> Option<(String, String)> {
	let text = String::from_utf8_lossy(head);
	let line = text.lines().next()?;
	let mut parts = line.split_whitespace();
	let method = parts.next()?.to_string();
	let path = parts.next()?.to_string();
	Some((method, path))
}

/// Fixed `HTTP/1.1 200` close-delimited HTML response used for error pages.
pub fn html_response(body: &str) -> String {
	response("text/html; charset=utf-8", body)
}

/// Same envelope with a JSON body.
pub fn json_response(body: &str) -> String {
	response("application/json", body)
}

fn response(content_type: &str, body: &str) -> String {
	let format =
		format_description!("[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] UTC");
	let date = OffsetDateTime::now_utc().format(&format).unwrap_or_default();
	format!(
		"HTTP/1.1 200 OK\r\nServer: burrow\r\nDate: {date}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
		body.len()
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn headers_are_lower_cased_and_trimmed() {
		let headers = parse_headers(b"GET / HTTP/1.1\r\nHost: a.example\r\nX-Real-IP:  1.2.3.4 \r\n");
		assert_eq!(headers.get("host").map(String::as_str), Some("a.example"));
		assert_eq!(headers.get("x-real-ip").map(String::as_str), Some("1.2.3.4"));
	}

	#[test]
	fn request_line_splits_method_and_path() {
		let parsed = request_line(b"POST /api/auth-resource HTTP/1.1\r\nHost: x\r\n");
		assert_eq!(
			parsed,
			Some(("POST".to_string(), "/api/auth-resource".to_string()))
		);
		assert!(request_line(b"").is_none());
	}

	#[test]
	fn responses_carry_the_body_length() {
		let response = html_response("<h1>nope</h1>");
		assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
		assert!(response.contains("Content-Length: 13\r\n"));
		assert!(response.ends_with("\r\n\r\n<h1>nope</h1>"));
	}
}
