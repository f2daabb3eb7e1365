//! Data model for the policy entities and telemetry rows the core consumes.
//! Schemas are owned by the Store (§3); this module only holds the
//! in-memory projection the data plane actually reads.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier minted by the Store. The core never constructs these
/// itself beyond the in-memory reference implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Which side of the connection an IP or port rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	Source,
	Destination,
	Both,
}

impl Direction {
	pub fn applies_to(&self, wanted: Direction) -> bool {
		*self == Direction::Both || *self == wanted
	}
}

/// Transport protocol a port rule covers. Retained from the original model
/// (`BlockedPort.protocol`) but not consulted by `PolicyEngine::evaluate` —
/// the source never filtered on it either, and this proxy only ever handles
/// TCP connections (see spec Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortProtocol {
	Tcp,
	Udp,
	Both,
}

/// Action a composite `BlockRule` applies when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
	Allow,
	Block,
	Log,
}

/// Informational category for a blocked domain. Closed set restored from the
/// original `BlockedDomain.CATEGORY_CHOICES`; spec.md keeps the field but
/// drops its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainCategory {
	Manual,
	Ads,
	Malware,
	Phishing,
	Adult,
	Social,
	Gambling,
	Streaming,
	Gaming,
	Other,
}

impl Default for DomainCategory {
	fn default() -> Self {
		DomainCategory::Manual
	}
}

/// Which pattern-matching strategy a domain pattern was classified into at
/// ingest. Classifying once up front (rather than re-sniffing the pattern
/// string on every request) is the REDESIGN FLAG in spec §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainPatternKind {
	Exact,
	LeadingDot,
	Contains,
	Prefix,
	Suffix,
	Glob,
}

impl DomainPatternKind {
	pub fn classify(pattern: &str) -> DomainPatternKind {
		if pattern.starts_with("*.") || pattern.starts_with('.') {
			DomainPatternKind::LeadingDot
		} else if pattern.starts_with('*') && pattern.ends_with('*') && pattern.len() > 1 {
			DomainPatternKind::Contains
		} else if pattern.ends_with('*') {
			DomainPatternKind::Prefix
		} else if pattern.starts_with('*') {
			DomainPatternKind::Suffix
		} else if pattern.contains('*') || pattern.contains('?') {
			DomainPatternKind::Glob
		} else {
			DomainPatternKind::Exact
		}
	}
}

/// A blocked domain pattern. `pattern` is always stored lowercase and
/// stripped; `is_wildcard` is derived at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedDomain {
	pub id: EntityId,
	pub pattern: String,
	pub category: DomainCategory,
	pub active: bool,
	pub reason: Option<String>,
	pub hit_count: u64,
}

impl BlockedDomain {
	pub fn new(id: EntityId, pattern: &str, category: DomainCategory) -> Self {
		BlockedDomain {
			id,
			pattern: pattern.trim().to_lowercase(),
			category,
			active: true,
			reason: None,
			hit_count: 0,
		}
	}

	pub fn is_wildcard(&self) -> bool {
		self.pattern.contains('*') || self.pattern.starts_with('.')
	}

	pub fn kind(&self) -> DomainPatternKind {
		DomainPatternKind::classify(&self.pattern)
	}
}

/// A blocked IP address or CIDR network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedIp {
	pub id: EntityId,
	pub address: IpAddr,
	pub prefix_len: Option<u8>,
	pub direction: Direction,
	pub active: bool,
	pub reason: Option<String>,
	pub hit_count: u64,
}

impl BlockedIp {
	/// Parses `addr` as either a bare address or an `addr/prefix` CIDR form,
	/// splitting at ingest per spec §3.
	pub fn parse(
		id: EntityId,
		addr: &str,
		direction: Direction,
	) -> Result<BlockedIp, crate::error::MatchError> {
		let (addr_part, prefix) = match addr.split_once('/') {
			Some((a, p)) => (
				a,
				Some(
					p.parse::<u8>()
						.map_err(|_| crate::error::MatchError::InvalidIp(addr.to_string()))?,
				),
			),
			None => (addr, None),
		};
		let address = addr_part
			.parse::<IpAddr>()
			.map_err(|_| crate::error::MatchError::InvalidIp(addr.to_string()))?;
		Ok(BlockedIp {
			id,
			address,
			prefix_len: prefix,
			direction,
			active: true,
			reason: None,
			hit_count: 0,
		})
	}

	pub fn is_range(&self) -> bool {
		self.prefix_len.is_some()
	}
}

/// A blocked port or port range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedPort {
	pub id: EntityId,
	pub port: u16,
	pub port_end: Option<u16>,
	pub direction: Direction,
	pub protocol: PortProtocol,
	pub active: bool,
	pub reason: Option<String>,
	pub hit_count: u64,
}

impl BlockedPort {
	pub fn is_range(&self) -> bool {
		self.port_end.is_some()
	}
}

/// A composite, conjunctive policy rule. Absent optional fields are
/// wildcards — see spec §3/§4.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRule {
	pub id: EntityId,
	pub name: String,
	pub priority: i64,
	pub action: RuleAction,
	pub active: bool,
	pub hit_count: u64,
	pub reason: Option<String>,
	pub created_at: DateTime<Utc>,

	pub domain_pattern: Option<String>,

	pub source_ip: Option<IpAddr>,
	pub source_ip_cidr: Option<u8>,
	pub dest_ip: Option<IpAddr>,
	pub dest_ip_cidr: Option<u8>,

	pub source_port_start: Option<u16>,
	pub source_port_end: Option<u16>,
	pub dest_port_start: Option<u16>,
	pub dest_port_end: Option<u16>,
}

impl BlockRule {
	pub fn reason_or_default(&self) -> String {
		self
			.reason
			.clone()
			.unwrap_or_else(|| format!("rule: {}", self.name))
	}
}

/// A single completed connection-handling episode, logged exactly once per
/// spec §8 invariant 7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
	pub timestamp: DateTime<Utc>,
	pub method: String,
	pub url: String,
	pub hostname: String,
	pub source_ip: IpAddr,
	pub source_port: u16,
	pub destination_ip: IpAddr,
	pub destination_port: u16,
	pub status_code: u16,
	pub content_length: u64,
	pub response_time_ms: u64,
	pub blocked: bool,
	pub block_reason: Option<String>,
}

/// A list-view projection broadcast to real-time subscribers — the only part
/// of `ProxyRequest` the out-of-scope dashboard needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequestListView {
	pub timestamp: DateTime<Utc>,
	pub method: String,
	pub hostname: String,
	pub status_code: u16,
	pub blocked: bool,
}

impl From<&ProxyRequest> for ProxyRequestListView {
	fn from(row: &ProxyRequest) -> Self {
		ProxyRequestListView {
			timestamp: row.timestamp,
			method: row.method.clone(),
			hostname: row.hostname.clone(),
			status_code: row.status_code,
			blocked: row.blocked,
		}
	}
}

/// Per-hostname aggregate, updated atomically by the Store on every
/// completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainStats {
	pub hostname: String,
	pub request_count: u64,
	pub blocked_count: u64,
	pub total_bytes: u64,
	pub first_seen: DateTime<Utc>,
	pub last_seen: DateTime<Utc>,
}

/// The kind of check that produced a block/log decision — used for logging
/// and metrics (`block_reason`/`rule_kind` in spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
	Rule,
	Domain,
	SrcIp,
	DstIp,
	SrcPort,
	DstPort,
}

impl std::fmt::Display for DecisionKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			DecisionKind::Rule => "rule",
			DecisionKind::Domain => "domain",
			DecisionKind::SrcIp => "src_ip",
			DecisionKind::DstIp => "dst_ip",
			DecisionKind::SrcPort => "src_port",
			DecisionKind::DstPort => "dst_port",
		};
		write!(f, "{s}")
	}
}
