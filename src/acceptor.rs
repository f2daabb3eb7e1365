//! Layer 5: the dual-stack listener and accept loop (§4.5).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connection;
use crate::metrics::Metrics;
use crate::snapshot::BlocklistSnapshot;
use crate::telemetry::TelemetrySink;

const LISTEN_BACKLOG: i32 = 200;

/// Binds the listener, preferring a dual-stack AF_INET6 socket with
/// `IPV6_V6ONLY` cleared so IPv4-mapped clients land on the same FD; falls
/// back to plain AF_INET on the same port if IPv6 binding fails.
pub fn bind(host: &str, port: u16) -> Result<TcpListener, crate::error::ProxyError> {
	if let Ok(listener) = bind_dual_stack(port) {
		info!(port, "listening on dual-stack IPv6/IPv4");
		return Ok(listener);
	}
	warn!(port, "dual-stack IPv6 bind failed, falling back to IPv4");
	bind_ipv4(host, port).map_err(crate::error::ProxyError::Bind)
}

fn bind_dual_stack(port: u16) -> std::io::Result<TcpListener> {
	let socket = Socket::new(Domain::IPV6, Type::STREAM, None)?;
	socket.set_only_v6(false)?;
	socket.set_reuse_address(true)?;
	let addr: SocketAddr = (IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into();
	socket.bind(&addr.into())?;
	socket.listen(LISTEN_BACKLOG)?;
	socket.set_nonblocking(true)?;
	TcpListener::from_std(socket.into())
}

fn bind_ipv4(host: &str, port: u16) -> std::io::Result<TcpListener> {
	let ip: IpAddr = host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
	let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
	socket.set_reuse_address(true)?;
	let addr: SocketAddr = (ip, port).into();
	socket.bind(&addr.into())?;
	socket.listen(LISTEN_BACKLOG)?;
	socket.set_nonblocking(true)?;
	TcpListener::from_std(socket.into())
}

/// Runs the accept loop until `shutdown` is cancelled. Accept errors are
/// logged and the loop continues; a cancelled token stops new accepts but
/// does not forcibly close in-flight handlers (§5).
pub async fn run(
	listener: TcpListener,
	snapshot: Arc<BlocklistSnapshot>,
	telemetry: TelemetrySink,
	metrics: Arc<Metrics>,
	shutdown: CancellationToken,
) {
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => {
				info!("acceptor shutting down, no longer accepting connections");
				return;
			}
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer_addr)) => {
						metrics.record_accepted();
						let snapshot = snapshot.clone();
						let telemetry = telemetry.clone();
						let metrics = metrics.clone();
						tokio::spawn(async move {
							connection::handle(stream, peer_addr, snapshot, telemetry, metrics).await;
						});
					}
					Err(err) => {
						error!(error = %err, "accept error, continuing");
					}
				}
			}
		}
	}
}
