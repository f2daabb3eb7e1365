use std::sync::Arc;

use anyhow::Result;
use proxysentry::broadcaster::ChannelBroadcaster;
use proxysentry::config::Config;
use proxysentry::metrics::{self, Metrics};
use proxysentry::snapshot::BlocklistSnapshot;
use proxysentry::store::{InMemoryStore, Store};
use proxysentry::telemetry::{TelemetrySink, DEFAULT_CHANNEL_CAPACITY, DEFAULT_WORKER_COUNT};
use proxysentry::acceptor;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const METRICS_PORT: u16 = 19000;

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let config = Config::load();
	info!(host = %config.host, port = config.port, "starting proxysentryd");

	let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
	let broadcaster = Arc::new(ChannelBroadcaster::new(256));
	let metrics = Arc::new(Metrics::new());

	let snapshot = Arc::new(BlocklistSnapshot::empty());
	snapshot.reload(&*store).await?;
	log_startup_summary(&snapshot);

	let telemetry = TelemetrySink::spawn(store.clone(), broadcaster.clone(), DEFAULT_CHANNEL_CAPACITY, DEFAULT_WORKER_COUNT);

	let shutdown = CancellationToken::new();
	let listener = acceptor::bind(&config.host, config.port)?;

	let mut run_set = JoinSet::new();

	let acceptor_shutdown = shutdown.child_token();
	let acceptor_snapshot = snapshot.clone();
	let acceptor_telemetry = telemetry.clone();
	let acceptor_metrics = metrics.clone();
	run_set.spawn(async move {
		acceptor::run(listener, acceptor_snapshot, acceptor_telemetry, acceptor_metrics, acceptor_shutdown).await;
		Ok::<(), anyhow::Error>(())
	});

	let metrics_for_server = metrics.clone();
	let metrics_shutdown = shutdown.child_token();
	run_set.spawn(async move {
		let router = metrics::router(metrics_for_server);
		let listener = tokio::net::TcpListener::bind(("0.0.0.0", METRICS_PORT)).await?;
		info!(port = METRICS_PORT, "metrics endpoint listening");
		axum::serve(listener, router).with_graceful_shutdown(async move { metrics_shutdown.cancelled().await }).await?;
		Ok::<(), anyhow::Error>(())
	});

	let signal_shutdown = shutdown.clone();
	run_set.spawn(async move {
		tokio::signal::ctrl_c().await?;
		info!("received shutdown signal");
		signal_shutdown.cancel();
		Ok::<(), anyhow::Error>(())
	});

	while let Some(result) = run_set.join_next().await {
		result??;
	}

	Ok(())
}

fn log_startup_summary(snapshot: &BlocklistSnapshot) {
	let counts = snapshot.current().counts();
	info!(
		domains = counts.domains,
		ips = counts.ips,
		ports = counts.ports,
		rules = counts.rules,
		"policy snapshot loaded"
	);
}
