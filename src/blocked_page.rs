//! Layer 7: renders the 403 response (§4.7). Pure string building — no I/O.

use crate::model::DecisionKind;

/// Renders the full `HTTP/1.1 403 Forbidden` response, headers and body
/// included, ready to write to the client socket as-is.
pub fn render(hostname: &str, reason: &str, kind: DecisionKind) -> Vec<u8> {
	let body = render_body(hostname, reason, kind);
	let mut response = format!(
		"HTTP/1.1 403 Forbidden\r\n\
		 Content-Type: text/html; charset=utf-8\r\n\
		 Content-Length: {}\r\n\
		 Connection: close\r\n\
		 X-Blocked-By: ProxySentry\r\n\
		 \r\n",
		body.len()
	)
	.into_bytes();
	response.extend_from_slice(body.as_bytes());
	response
}

fn render_body(hostname: &str, reason: &str, kind: DecisionKind) -> String {
	let hostname = html_escape(hostname);
	let reason = html_escape(reason);
	format!(
		"<!DOCTYPE html>\n\
		 <html>\n\
		 <head><title>403 Forbidden</title></head>\n\
		 <body>\n\
		 <h1>Access Blocked</h1>\n\
		 <p>The request to <strong>{hostname}</strong> was blocked by policy ({kind}).</p>\n\
		 <p>Reason: {reason}</p>\n\
		 </body>\n\
		 </html>\n"
	)
}

fn html_escape(s: &str) -> String {
	s.replace('&', "&amp;")
		.replace('<', "&lt;")
		.replace('>', "&gt;")
		.replace('"', "&quot;")
}
