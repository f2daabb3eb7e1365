//! Layer 4: `ConnectionHandler` — the per-connection state machine
//! (§4.4). States: Recv-First, Classify, Forward-HTTP, Tunnel-HTTPS,
//! Emit-403, Terminate.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, info_span, warn, Instrument};

use crate::blocked_page;
use crate::matchers::ip::canonical;
use crate::metrics::Metrics;
use crate::model::{DecisionKind, ProxyRequest};
use crate::policy::Decision;
use crate::snapshot::BlocklistSnapshot;
use crate::telemetry::{TelemetrySink, TelemetryTask};

/// Read buffer for the first client read and all subsequent forwarding
/// copies (§4.4): 128 KiB, chosen to accommodate high-throughput streams.
const READ_BUFFER_SIZE: usize = 65536 * 2;
const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct ParsedRequest {
	method: String,
	target: String,
}

enum Target {
	Connect { host: String, port: u16 },
	Http { host: String, port: u16 },
}

/// Handles one accepted connection end-to-end. Never panics on malformed or
/// hostile input; every failure path either emits a response or just closes
/// the socket, per §7.
pub async fn handle(
	mut client: TcpStream,
	peer_addr: SocketAddr,
	snapshot: Arc<BlocklistSnapshot>,
	telemetry: TelemetrySink,
	metrics: Arc<Metrics>,
) {
	let conn_id = next_conn_id();
	let span = info_span!("connection", conn_id, peer = %peer_addr);
	handle_inner(&mut client, peer_addr, snapshot, telemetry, metrics).instrument(span).await;
}

fn next_conn_id() -> u64 {
	use std::sync::atomic::{AtomicU64, Ordering};
	static NEXT: AtomicU64 = AtomicU64::new(1);
	NEXT.fetch_add(1, Ordering::Relaxed)
}

async fn handle_inner(
	client: &mut TcpStream,
	peer_addr: SocketAddr,
	snapshot: Arc<BlocklistSnapshot>,
	telemetry: TelemetrySink,
	metrics: Arc<Metrics>,
) {
	let start = std::time::Instant::now();
	let timestamp = Utc::now();
	let src_ip = canonical(peer_addr.ip());
	let src_port = peer_addr.port();

	let mut buf = vec![0u8; READ_BUFFER_SIZE];
	let read_result = timeout(FIRST_READ_TIMEOUT, client.read(&mut buf)).await;
	let n = match read_result {
		Ok(Ok(0)) | Err(_) => return,
		Ok(Ok(n)) => n,
		Ok(Err(_)) => return,
	};
	buf.truncate(n);

	let Some(parsed) = parse_first_line(&buf) else { return };

	let Some(target) = classify(&parsed) else { return };

	let (hostname, port, is_connect) = match &target {
		Target::Connect { host, port } => (host.clone(), *port, true),
		Target::Http { host, port } => (host.clone(), *port, false),
	};

	let dst_ip = resolve(&hostname, port).await.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

	let decision = snapshot.evaluate(Some(&hostname), src_ip, dst_ip, Some(src_port), Some(port));

	let hits = match &decision {
		Decision::Block { reason, kind, entity_id, logged_rule_id } => {
			emit_blocked(client, &hostname, reason, *kind).await;
			let mut hits = Vec::new();
			if let Some(id) = entity_id {
				hits.push((*id, *kind));
			}
			// An earlier composite `log` rule may have matched before this
			// block was found further down the pipeline; both hits count
			// (spec §9 Design Notes).
			if let Some(id) = logged_rule_id {
				hits.push((*id, DecisionKind::Rule));
			}
			submit_row(
				&telemetry,
				&metrics,
				timestamp,
				start,
				&parsed.method,
				&hostname,
				&parsed.target,
				src_ip,
				src_port,
				dst_ip,
				port,
				403,
				0,
				true,
				Some(reason.clone()),
				hits,
			);
			metrics.record_decision(*kind, true);
			return;
		}
		Decision::LogAndContinue { entity_id } => vec![(*entity_id, DecisionKind::Rule)],
		// A matching composite `allow` rule still counts as one hit, even
		// though the connection proceeds (spec §9 Design Notes).
		Decision::Allow { entity_id } => entity_id.map(|id| vec![(id, DecisionKind::Rule)]).unwrap_or_default(),
	};

	if let Some((_, kind)) = hits.first() {
		metrics.record_decision(*kind, false);
	}

	if is_connect {
		tunnel_https(
			client, &hostname, port, src_ip, src_port, dst_ip, timestamp, start, &telemetry, &metrics, hits,
		)
		.await;
	} else {
		forward_http(
			client, &buf, &parsed, &hostname, port, src_ip, src_port, dst_ip, timestamp, start, &telemetry, &metrics,
			hits,
		)
		.await;
	}
}

fn parse_first_line(buf: &[u8]) -> Option<ParsedRequest> {
	let first_line_end = buf.windows(2).position(|w| w == b"\r\n").unwrap_or(buf.len());
	let first_line = String::from_utf8_lossy(&buf[..first_line_end]);
	let mut parts = first_line.split_whitespace();
	let method = parts.next()?.to_string();
	let target = parts.next()?.to_string();
	Some(ParsedRequest { method, target })
}

fn classify(parsed: &ParsedRequest) -> Option<Target> {
	if parsed.method.eq_ignore_ascii_case("CONNECT") {
		let (host, port) = split_host_port(&parsed.target, 443)?;
		Some(Target::Connect { host, port })
	} else {
		let rest = parsed.target.strip_prefix("http://").unwrap_or(&parsed.target);
		let host_part = rest.split('/').next().unwrap_or(rest);
		let (host, port) = split_host_port(host_part, 80)?;
		Some(Target::Http { host, port })
	}
}

fn split_host_port(s: &str, default_port: u16) -> Option<(String, u16)> {
	if s.is_empty() {
		return None;
	}
	match s.rsplit_once(':') {
		Some((host, port_str)) => match port_str.parse::<u16>() {
			Ok(port) => Some((host.to_lowercase(), port)),
			Err(_) => Some((s.to_lowercase(), default_port)),
		},
		None => Some((s.to_lowercase(), default_port)),
	}
}

async fn resolve(host: &str, port: u16) -> Option<IpAddr> {
	tokio::net::lookup_host((host, port)).await.ok()?.next().map(|addr| canonical(addr.ip()))
}

async fn emit_blocked(client: &mut TcpStream, hostname: &str, reason: &str, kind: DecisionKind) {
	let response = blocked_page::render(hostname, reason, kind);
	if let Err(err) = client.write_all(&response).await {
		warn!(error = %err, "failed to write blocked response, terminating");
	}
}

#[allow(clippy::too_many_arguments)]
async fn tunnel_https(
	client: &mut TcpStream,
	host: &str,
	port: u16,
	src_ip: IpAddr,
	src_port: u16,
	dst_ip: IpAddr,
	timestamp: chrono::DateTime<Utc>,
	start: std::time::Instant,
	telemetry: &TelemetrySink,
	metrics: &Metrics,
	hits: Vec<(crate::model::EntityId, DecisionKind)>,
) {
	let connect_result = timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await;
	let mut upstream = match connect_result {
		Ok(Ok(stream)) => stream,
		_ => {
			send_bad_gateway(client).await;
			submit_row(
				telemetry, metrics, timestamp, start, "CONNECT", host, &format!("{host}:{port}"), src_ip, src_port,
				dst_ip, port, 502, 0, false, None, Vec::new(),
			);
			return;
		}
	};

	if client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.is_err() {
		return;
	}

	info!(host, port, "tunnel established");
	let _ = tokio::io::copy_bidirectional(client, &mut upstream).await;

	submit_row(
		telemetry, metrics, timestamp, start, "CONNECT", host, &format!("{host}:{port}"), src_ip, src_port, dst_ip,
		port, 200, 0, false, None, hits,
	);
}

#[allow(clippy::too_many_arguments)]
async fn forward_http(
	client: &mut TcpStream,
	raw_request: &[u8],
	parsed: &ParsedRequest,
	host: &str,
	port: u16,
	src_ip: IpAddr,
	src_port: u16,
	dst_ip: IpAddr,
	timestamp: chrono::DateTime<Utc>,
	start: std::time::Instant,
	telemetry: &TelemetrySink,
	metrics: &Metrics,
	hits: Vec<(crate::model::EntityId, DecisionKind)>,
) {
	let rewritten = rewrite_connection_header(raw_request);

	let connect_result = timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect((host, port))).await;
	let mut upstream = match connect_result {
		Ok(Ok(stream)) => stream,
		_ => {
			send_bad_gateway(client).await;
			submit_row(
				telemetry, metrics, timestamp, start, &parsed.method, host, &parsed.target, src_ip, src_port, dst_ip,
				port, 502, 0, false, None, Vec::new(),
			);
			return;
		}
	};

	if upstream.write_all(&rewritten).await.is_err() {
		send_bad_gateway(client).await;
		submit_row(
			telemetry, metrics, timestamp, start, &parsed.method, host, &parsed.target, src_ip, src_port, dst_ip, port,
			502, 0, false, None, Vec::new(),
		);
		return;
	}

	let mut total_size: u64 = 0;
	let mut chunk = vec![0u8; READ_BUFFER_SIZE];
	loop {
		match upstream.read(&mut chunk).await {
			Ok(0) => break,
			Ok(n) => {
				total_size += n as u64;
				if client.write_all(&chunk[..n]).await.is_err() {
					break;
				}
			}
			Err(_) => break,
		}
	}
	metrics.record_bytes_forwarded(total_size);

	submit_row(
		telemetry, metrics, timestamp, start, &parsed.method, host, &parsed.target, src_ip, src_port, dst_ip, port, 200,
		total_size, false, None, hits,
	);
}

async fn send_bad_gateway(client: &mut TcpStream) {
	let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
}

const CONNECTION_KEEPALIVE: &[u8] = b"Connection: keep-alive";
const CONNECTION_CLOSE: &[u8] = b"Connection: close";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Replaces `Connection: keep-alive` with `Connection: close`, or injects
/// `Connection: close` before the final blank line if no `Connection` header
/// is present at all (§4.4 "Forward-HTTP"). Operates directly on the raw
/// bytes — a POST body can ride along in the same initial read and is not
/// guaranteed to be valid UTF-8, so this must never round-trip through a
/// lossy decode (spec §8 Testable Property 5: bytes forwarded upstream must
/// be identical except for the `Connection` header).
fn rewrite_connection_header(raw: &[u8]) -> Vec<u8> {
	if let Some(idx) = find_subslice(raw, CONNECTION_KEEPALIVE) {
		let mut out = Vec::with_capacity(raw.len());
		out.extend_from_slice(&raw[..idx]);
		out.extend_from_slice(CONNECTION_CLOSE);
		out.extend_from_slice(&raw[idx + CONNECTION_KEEPALIVE.len()..]);
		return out;
	}
	if find_subslice(raw, CONNECTION_CLOSE).is_some() {
		return raw.to_vec();
	}
	match find_subslice(raw, HEADER_END) {
		Some(idx) => {
			let mut out = Vec::with_capacity(raw.len() + CONNECTION_CLOSE.len() + 2);
			out.extend_from_slice(&raw[..idx]);
			out.extend_from_slice(b"\r\n");
			out.extend_from_slice(CONNECTION_CLOSE);
			out.extend_from_slice(&raw[idx..]);
			out
		}
		None => raw.to_vec(),
	}
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	if needle.is_empty() || haystack.len() < needle.len() {
		return None;
	}
	haystack.windows(needle.len()).position(|w| w == needle)
}

#[allow(clippy::too_many_arguments)]
fn submit_row(
	telemetry: &TelemetrySink,
	metrics: &Metrics,
	timestamp: chrono::DateTime<Utc>,
	start: std::time::Instant,
	method: &str,
	hostname: &str,
	url: &str,
	src_ip: IpAddr,
	src_port: u16,
	dst_ip: IpAddr,
	dst_port: u16,
	status_code: u16,
	content_length: u64,
	blocked: bool,
	block_reason: Option<String>,
	hits: Vec<(crate::model::EntityId, DecisionKind)>,
) {
	metrics.record_telemetry_submitted();
	let row = ProxyRequest {
		timestamp,
		method: method.to_string(),
		url: url.to_string(),
		hostname: hostname.to_string(),
		source_ip: src_ip,
		source_port: src_port,
		destination_ip: dst_ip,
		destination_port: dst_port,
		status_code,
		content_length,
		response_time_ms: start.elapsed().as_millis() as u64,
		blocked,
		block_reason,
	};
	telemetry.submit(TelemetryTask { row, hits, broadcast: true });
}
