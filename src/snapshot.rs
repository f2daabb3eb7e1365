//! Layer 3: `BlocklistSnapshot` — an atomically swappable, immutable view of
//! the active policy entities (§4.3). Readers never take a lock; a reload
//! builds a brand new `SnapshotView` and swaps it in via `ArcSwap`, mirroring
//! the hot-path/cold-path split in the block-filter-engine idiom this crate
//! follows (sync `evaluate`, async `reload`).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::model::{BlockRule, BlockedDomain, BlockedIp, BlockedPort};
use crate::policy::{self, Decision, PolicyView};
use crate::store::Store;

/// One immutable generation of the policy data, partitioned the way
/// `evaluate` needs it.
pub struct SnapshotView {
	composite_rules: Vec<BlockRule>,
	domain_exact: HashMap<String, BlockedDomain>,
	domain_wildcards: Vec<BlockedDomain>,
	ip_exact: Vec<BlockedIp>,
	ip_ranges: Vec<BlockedIp>,
	port_exact: Vec<BlockedPort>,
	port_ranges: Vec<BlockedPort>,
}

impl SnapshotView {
	pub fn build(
		domains: Vec<BlockedDomain>,
		ips: Vec<BlockedIp>,
		ports: Vec<BlockedPort>,
		mut rules: Vec<BlockRule>,
	) -> SnapshotView {
		let mut domain_exact = HashMap::new();
		let mut domain_wildcards = Vec::new();
		for domain in domains.into_iter().filter(|d| d.active) {
			if domain.is_wildcard() {
				domain_wildcards.push(domain);
			} else {
				domain_exact.insert(domain.pattern.clone(), domain);
			}
		}

		let mut ip_exact = Vec::new();
		let mut ip_ranges = Vec::new();
		for ip in ips.into_iter().filter(|i| i.active) {
			if ip.is_range() {
				ip_ranges.push(ip);
			} else {
				ip_exact.push(ip);
			}
		}

		let mut port_exact = Vec::new();
		let mut port_ranges = Vec::new();
		for port in ports.into_iter().filter(|p| p.active) {
			if port.is_range() {
				port_ranges.push(port);
			} else {
				port_exact.push(port);
			}
		}

		rules.retain(|r| r.active);
		rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.created_at.cmp(&a.created_at)));

		SnapshotView {
			composite_rules: rules,
			domain_exact,
			domain_wildcards,
			ip_exact,
			ip_ranges,
			port_exact,
			port_ranges,
		}
	}

	pub fn counts(&self) -> SnapshotCounts {
		SnapshotCounts {
			domains: self.domain_exact.len() + self.domain_wildcards.len(),
			ips: self.ip_exact.len() + self.ip_ranges.len(),
			ports: self.port_exact.len() + self.port_ranges.len(),
			rules: self.composite_rules.len(),
		}
	}
}

/// Counts surfaced in the startup summary (§2 A6).
pub struct SnapshotCounts {
	pub domains: usize,
	pub ips: usize,
	pub ports: usize,
	pub rules: usize,
}

impl PolicyView for SnapshotView {
	fn composite_rules(&self) -> &[BlockRule] {
		&self.composite_rules
	}
	fn domain_exact(&self) -> &HashMap<String, BlockedDomain> {
		&self.domain_exact
	}
	fn domain_wildcards(&self) -> &[BlockedDomain] {
		&self.domain_wildcards
	}
	fn ip_exact(&self) -> &[BlockedIp] {
		&self.ip_exact
	}
	fn ip_ranges(&self) -> &[BlockedIp] {
		&self.ip_ranges
	}
	fn port_exact(&self) -> &[BlockedPort] {
		&self.port_exact
	}
	fn port_ranges(&self) -> &[BlockedPort] {
		&self.port_ranges
	}
}

/// Holds the current `SnapshotView` behind an `ArcSwap` so `evaluate` never
/// blocks a concurrent `reload`.
pub struct BlocklistSnapshot {
	inner: ArcSwap<SnapshotView>,
}

impl BlocklistSnapshot {
	pub fn empty() -> BlocklistSnapshot {
		BlocklistSnapshot {
			inner: ArcSwap::from_pointee(SnapshotView::build(Vec::new(), Vec::new(), Vec::new(), Vec::new())),
		}
	}

	/// Pulls the full active entity set from `store` and swaps it in.
	pub async fn reload(&self, store: &dyn Store) -> Result<(), crate::error::StoreError> {
		let domains = store.list_active_domains().await?;
		let ips = store.list_active_ips().await?;
		let ports = store.list_active_ports().await?;
		let rules = store.list_active_rules_by_priority().await?;
		self.inner.store(Arc::new(SnapshotView::build(domains, ips, ports, rules)));
		Ok(())
	}

	/// Returns the current view for inspection (e.g. the startup summary).
	pub fn current(&self) -> Arc<SnapshotView> {
		self.inner.load_full()
	}

	pub fn evaluate(
		&self,
		hostname: Option<&str>,
		src_ip: IpAddr,
		dst_ip: IpAddr,
		src_port: Option<u16>,
		dst_port: Option<u16>,
	) -> Decision {
		let view = self.inner.load();
		policy::evaluate(&**view, hostname, src_ip, dst_ip, src_port, dst_port)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{DomainCategory, EntityId};

	#[test]
	fn build_partitions_exact_and_wildcard_domains() {
		let domains = vec![
			BlockedDomain::new(EntityId(1), "example.com", DomainCategory::Manual),
			BlockedDomain::new(EntityId(2), "*.ads.net", DomainCategory::Ads),
		];
		let view = SnapshotView::build(domains, Vec::new(), Vec::new(), Vec::new());
		assert_eq!(view.domain_exact.len(), 1);
		assert_eq!(view.domain_wildcards.len(), 1);
	}

	#[test]
	fn build_sorts_rules_by_priority_then_recency_desc() {
		use chrono::{Duration, Utc};
		let now = Utc::now();
		let rule = |id: u64, priority: i64, age_secs: i64| crate::model::BlockRule {
			id: EntityId(id),
			name: format!("r{id}"),
			priority,
			action: crate::model::RuleAction::Block,
			active: true,
			hit_count: 0,
			reason: None,
			created_at: now - Duration::seconds(age_secs),
			domain_pattern: None,
			source_ip: None,
			source_ip_cidr: None,
			dest_ip: None,
			dest_ip_cidr: None,
			source_port_start: None,
			source_port_end: None,
			dest_port_start: None,
			dest_port_end: None,
		};
		let rules = vec![rule(1, 5, 10), rule(2, 1, 100), rule(3, 1, 5)];
		let view = SnapshotView::build(Vec::new(), Vec::new(), Vec::new(), rules);
		let ids: Vec<u64> = view.composite_rules.iter().map(|r| r.id.0).collect();
		assert_eq!(ids, vec![3, 2, 1]);
	}
}
