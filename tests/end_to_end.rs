//! Black-box scenarios over real loopback TCP sockets, matching §8 S1-S6.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use proxysentry::broadcaster::ChannelBroadcaster;
use proxysentry::metrics::Metrics;
use proxysentry::model::{BlockRule, BlockedDomain, BlockedIp, BlockedPort, DomainCategory, Direction, EntityId, PortProtocol, RuleAction};
use proxysentry::snapshot::BlocklistSnapshot;
use proxysentry::store::{InMemoryStore, Store};
use proxysentry::telemetry::TelemetrySink;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_proxy(store: Arc<InMemoryStore>) -> SocketAddr {
	let snapshot = Arc::new(BlocklistSnapshot::empty());
	let store_dyn: Arc<dyn Store> = store.clone();
	snapshot.reload(&*store_dyn).await.unwrap();

	let broadcaster = Arc::new(ChannelBroadcaster::new(16));
	let telemetry = TelemetrySink::spawn(store_dyn, broadcaster, 256, 1);
	let metrics = Arc::new(Metrics::new());

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	tokio::spawn(async move {
		loop {
			let (stream, peer) = match listener.accept().await {
				Ok(pair) => pair,
				Err(_) => return,
			};
			let snapshot = snapshot.clone();
			let telemetry = telemetry.clone();
			let metrics = metrics.clone();
			tokio::spawn(async move {
				proxysentry::connection::handle(stream, peer, snapshot, telemetry, metrics).await;
			});
		}
	});

	addr
}

async fn read_response(stream: &mut TcpStream) -> String {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];
	loop {
		match tokio::time::timeout(Duration::from_millis(500), stream.read(&mut chunk)).await {
			Ok(Ok(0)) | Err(_) => break,
			Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
			Ok(Err(_)) => break,
		}
	}
	String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn s1_blocked_exact_domain_via_connect() {
	let store = Arc::new(InMemoryStore::new());
	store.seed_domains(vec![BlockedDomain::new(EntityId(1), "ads.example", DomainCategory::Manual)]).await;
	let addr = spawn_proxy(store.clone()).await;

	let mut client = TcpStream::connect(addr).await.unwrap();
	client.write_all(b"CONNECT ads.example:443 HTTP/1.1\r\n\r\n").await.unwrap();
	let response = read_response(&mut client).await;

	assert!(response.starts_with("HTTP/1.1 403 Forbidden"));
	assert!(response.contains("ads.example"));

	tokio::time::sleep(Duration::from_millis(100)).await;
	let rows = store.requests_snapshot().await;
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0].method, "CONNECT");
	assert_eq!(rows[0].status_code, 403);
	assert!(rows[0].blocked);
	assert!(rows[0].block_reason.as_ref().unwrap().contains("ads.example"));

	let domains = store.list_active_domains().await.unwrap();
	assert_eq!(domains[0].hit_count, 1);
}

#[tokio::test]
async fn s2_blocked_by_subdomain() {
	let store = Arc::new(InMemoryStore::new());
	store.seed_domains(vec![BlockedDomain::new(EntityId(1), "ads.net", DomainCategory::Manual)]).await;
	let addr = spawn_proxy(store.clone()).await;

	let mut client = TcpStream::connect(addr).await.unwrap();
	client
		.write_all(b"GET http://foo.ads.net/x HTTP/1.1\r\nHost: foo.ads.net\r\n\r\n")
		.await
		.unwrap();
	let response = read_response(&mut client).await;

	assert!(response.starts_with("HTTP/1.1 403 Forbidden"));

	tokio::time::sleep(Duration::from_millis(100)).await;
	let domains = store.list_active_domains().await.unwrap();
	assert_eq!(domains[0].hit_count, 1);
}

#[tokio::test]
async fn s4_cidr_source_block() {
	let store = Arc::new(InMemoryStore::new());
	store
		.seed_ips(vec![BlockedIp::parse(EntityId(1), "127.0.0.1/32", Direction::Source).unwrap()])
		.await;
	let addr = spawn_proxy(store.clone()).await;

	let mut client = TcpStream::connect(addr).await.unwrap();
	client.write_all(b"GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n\r\n").await.unwrap();
	let response = read_response(&mut client).await;

	assert!(response.starts_with("HTTP/1.1 403 Forbidden"));
	tokio::time::sleep(Duration::from_millis(100)).await;
	let rows = store.requests_snapshot().await;
	assert!(rows[0].block_reason.as_ref().unwrap().to_lowercase().contains("ip"));
}

#[tokio::test]
async fn s5_port_range_block_on_destination() {
	let store = Arc::new(InMemoryStore::new());
	store
		.seed_ports(vec![BlockedPort {
			id: EntityId(1),
			port: 1024,
			port_end: Some(65535),
			direction: Direction::Destination,
			protocol: PortProtocol::Tcp,
			active: true,
			reason: None,
			hit_count: 0,
		}])
		.await;
	let addr = spawn_proxy(store.clone()).await;

	let mut client = TcpStream::connect(addr).await.unwrap();
	client.write_all(b"CONNECT example.org:8443 HTTP/1.1\r\n\r\n").await.unwrap();
	let response = read_response(&mut client).await;
	assert!(response.starts_with("HTTP/1.1 403 Forbidden"));

	tokio::time::sleep(Duration::from_millis(100)).await;
	let ports = store.list_active_ports().await.unwrap();
	assert_eq!(ports[0].hit_count, 1);
}

#[tokio::test]
async fn s6_upstream_failure_yields_502() {
	let store = Arc::new(InMemoryStore::new());
	let addr = spawn_proxy(store.clone()).await;

	let mut client = TcpStream::connect(addr).await.unwrap();
	client
		.write_all(b"GET http://this-host-should-not-resolve.invalid/ HTTP/1.1\r\nHost: this-host-should-not-resolve.invalid\r\n\r\n")
		.await
		.unwrap();
	let response = read_response(&mut client).await;

	assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));

	tokio::time::sleep(Duration::from_millis(100)).await;
	let rows = store.requests_snapshot().await;
	assert_eq!(rows.len(), 1);
	assert!(!rows[0].blocked);
	assert_eq!(rows[0].status_code, 502);
}

#[tokio::test]
async fn allow_rule_short_circuits_domain_block() {
	let store = Arc::new(InMemoryStore::new());

	// A real loopback listener stands in for "intranet.corp" so the allowed
	// CONNECT has an actual upstream to tunnel to; the proxy only ever sees
	// the literal host string, so an address works exactly like a hostname.
	let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let upstream_addr = upstream.local_addr().unwrap();
	tokio::spawn(async move {
		let _ = upstream.accept().await;
	});
	let hostname = upstream_addr.ip().to_string();

	store.seed_domains(vec![BlockedDomain::new(EntityId(1), &hostname, DomainCategory::Manual)]).await;
	store
		.seed_rules(vec![BlockRule {
			id: EntityId(10),
			name: "trust corp net".into(),
			priority: 10,
			action: RuleAction::Allow,
			active: true,
			hit_count: 0,
			reason: None,
			created_at: Utc::now(),
			domain_pattern: Some(hostname.clone()),
			source_ip: Some("127.0.0.1".parse().unwrap()),
			source_ip_cidr: Some(32),
			dest_ip: None,
			dest_ip_cidr: None,
			source_port_start: None,
			source_port_end: None,
			dest_port_start: None,
			dest_port_end: None,
		}])
		.await;
	let addr = spawn_proxy(store.clone()).await;

	let mut client = TcpStream::connect(addr).await.unwrap();
	client
		.write_all(format!("CONNECT {hostname}:{} HTTP/1.1\r\n\r\n", upstream_addr.port()).as_bytes())
		.await
		.unwrap();
	let response = read_response(&mut client).await;

	assert!(response.starts_with("HTTP/1.1 200 Connection Established"));

	tokio::time::sleep(Duration::from_millis(100)).await;
	let domains = store.list_active_domains().await.unwrap();
	assert_eq!(domains[0].hit_count, 0);
	let rules = store.list_active_rules_by_priority().await.unwrap();
	assert_eq!(rules[0].hit_count, 1);
}
