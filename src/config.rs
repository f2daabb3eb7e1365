//! Ambient component A1: CLI flags and environment variables (§6, §10.3).

use std::time::Duration;

use clap::Parser;

const DEFAULT_PORT: u16 = 8088;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_DNS_TIMEOUT_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(name = "proxysentryd", about = "Forwarding HTTP/HTTPS proxy with layered policy enforcement")]
struct Args {
	/// Address to bind the proxy listener on.
	#[arg(long, value_name = "HOST")]
	host: Option<String>,

	/// Port to bind the proxy listener on. Falls back to PROXY_PORT, then 8088.
	#[arg(short, long, value_name = "PORT")]
	port: Option<u16>,
}

/// Resolved runtime configuration. CLI flags win over environment variables,
/// which win over the built-in defaults — matching the original runner's
/// `argparse` + `os.environ` precedence.
#[derive(Debug, Clone)]
pub struct Config {
	pub host: String,
	pub port: u16,
	pub dns_servers: Vec<String>,
	pub dns_timeout: Duration,
}

impl Config {
	pub fn load() -> Config {
		let args = Args::parse();
		Config::from_args_and_env(args)
	}

	fn from_args_and_env(args: Args) -> Config {
		let host = args.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

		let port = args.port.or_else(|| std::env::var("PROXY_PORT").ok().and_then(|v| v.parse().ok())).unwrap_or(DEFAULT_PORT);

		let dns_servers = std::env::var("DNS_SERVERS")
			.ok()
			.map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
			.unwrap_or_default();

		let dns_timeout = std::env::var("DNS_TIMEOUT")
			.ok()
			.and_then(|v| v.parse::<u64>().ok())
			.map(Duration::from_secs)
			.unwrap_or(Duration::from_secs(DEFAULT_DNS_TIMEOUT_SECS));

		Config {
			host,
			port,
			dns_servers,
			dns_timeout,
		}
	}
}
