use std::io;

/// Error kinds raised by the data plane. Every variant here corresponds to a
/// row in spec §7's error taxonomy; callers decide recovery per variant
/// rather than this type prescribing it.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("malformed request line")]
	MalformedRequest,

	#[error("policy evaluation error: {0}")]
	PolicyEvaluation(String),

	#[error("failed to connect upstream: {0}")]
	UpstreamConnect(#[source] io::Error),

	#[error("upstream io error: {0}")]
	UpstreamIo(#[source] io::Error),

	#[error("failed to write to client: {0}")]
	DownstreamWrite(#[source] io::Error),

	#[error("telemetry error: {0}")]
	Telemetry(String),

	#[error("failed to bind listener: {0}")]
	Bind(#[source] io::Error),
}

/// Errors raised by matcher primitives. Per spec §4.2, these always collapse
/// to "no match" at the call site rather than aborting evaluation.
#[derive(thiserror::Error, Debug)]
pub enum MatchError {
	#[error("invalid ip address: {0}")]
	InvalidIp(String),

	#[error("invalid cidr prefix: {0}")]
	InvalidPrefix(#[from] ipnet::PrefixLenError),

	#[error("invalid glob pattern: {0}")]
	InvalidGlob(#[from] regex::Error),
}

/// Errors raised by a `Store` implementation. The core only ever sees these
/// at the edge of a policy check or telemetry submit, where they are
/// swallowed per §7.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("store backend error: {0}")]
	Backend(String),

	#[error("entity not found: {0}")]
	NotFound(u64),
}
