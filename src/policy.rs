//! Layer 2: the single-entry-point policy engine (§4.2). `evaluate` is a
//! pure function over a `PolicyView` — it never touches the Store directly
//! and never mutates hit counters; the caller (ConnectionHandler/Telemetry)
//! is responsible for persisting the hit-count bump against whatever entity
//! fired, keyed by the `EntityId` this module hands back.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::matchers::{domain_matches, ip_matches, port_matches};
use crate::model::{BlockRule, BlockedDomain, BlockedIp, BlockedPort, DecisionKind, Direction, EntityId, RuleAction};

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
	/// `entity_id` is `Some` when a composite `allow` rule is what produced
	/// this decision — per spec §9 Design Notes, "a matching Allow also
	/// counts as one hit", so the caller must still bump that rule's
	/// hit_count even though the connection proceeds.
	Allow {
		entity_id: Option<EntityId>,
	},
	Block {
		reason: String,
		kind: DecisionKind,
		entity_id: Option<EntityId>,
		/// Set when an earlier composite `log` rule matched before this
		/// block was found further down the pipeline (§4.2 step 1 "log
		/// matches note and continue"). Both hits must be counted.
		logged_rule_id: Option<EntityId>,
	},
	LogAndContinue {
		entity_id: EntityId,
	},
}

/// The read-only view `evaluate` needs out of a `BlocklistSnapshot`. Kept as
/// a trait so `policy.rs` has no dependency on how the snapshot actually
/// stores or refreshes its data.
pub trait PolicyView {
	/// Composite rules, pre-sorted ascending priority then descending
	/// creation time, active entries only.
	fn composite_rules(&self) -> &[BlockRule];
	/// Active, non-wildcard domains keyed by their exact pattern string.
	fn domain_exact(&self) -> &HashMap<String, BlockedDomain>;
	/// Active wildcard domains, in no particular required order.
	fn domain_wildcards(&self) -> &[BlockedDomain];
	/// Active, non-range IP rules.
	fn ip_exact(&self) -> &[BlockedIp];
	/// Active, range (CIDR) IP rules.
	fn ip_ranges(&self) -> &[BlockedIp];
	/// Active, non-range port rules.
	fn port_exact(&self) -> &[BlockedPort];
	/// Active, range port rules.
	fn port_ranges(&self) -> &[BlockedPort];
}

/// Evaluates a single connection's policy tuple against `view`, per the
/// strict precedence order in §4.2.
pub fn evaluate(
	view: &dyn PolicyView,
	hostname: Option<&str>,
	src_ip: IpAddr,
	dst_ip: IpAddr,
	src_port: Option<u16>,
	dst_port: Option<u16>,
) -> Decision {
	let logged = match evaluate_composite_rules(view, hostname, src_ip, dst_ip, src_port, dst_port) {
		CompositeOutcome::Done(decision) => return decision,
		CompositeOutcome::Logged(entity_id) => Some(entity_id),
		CompositeOutcome::NoMatch => None,
	};

	if let Some(hostname) = hostname {
		if let Some(d) = evaluate_domain(view, hostname) {
			return attach_logged(d, logged);
		}
	}

	if let Some(d) = evaluate_ip(view.ip_exact(), view.ip_ranges(), src_ip, Direction::Source, DecisionKind::SrcIp) {
		return attach_logged(d, logged);
	}
	if let Some(d) = evaluate_ip(view.ip_exact(), view.ip_ranges(), dst_ip, Direction::Destination, DecisionKind::DstIp) {
		return attach_logged(d, logged);
	}
	if let Some(d) = evaluate_port(view.port_exact(), view.port_ranges(), src_port, Direction::Source, DecisionKind::SrcPort) {
		return attach_logged(d, logged);
	}
	if let Some(d) = evaluate_port(view.port_exact(), view.port_ranges(), dst_port, Direction::Destination, DecisionKind::DstPort) {
		return attach_logged(d, logged);
	}

	match logged {
		Some(entity_id) => Decision::LogAndContinue { entity_id },
		None => Decision::Allow { entity_id: None },
	}
}

/// Folds an earlier composite `log` rule's id into a `Block` decision found
/// further down the pipeline, so the caller can bump both hit counters.
fn attach_logged(decision: Decision, logged: Option<EntityId>) -> Decision {
	match decision {
		Decision::Block { reason, kind, entity_id, .. } => Decision::Block {
			reason,
			kind,
			entity_id,
			logged_rule_id: logged,
		},
		other => other,
	}
}

enum CompositeOutcome {
	Done(Decision),
	Logged(EntityId),
	NoMatch,
}

fn evaluate_composite_rules(
	view: &dyn PolicyView,
	hostname: Option<&str>,
	src_ip: IpAddr,
	dst_ip: IpAddr,
	src_port: Option<u16>,
	dst_port: Option<u16>,
) -> CompositeOutcome {
	for rule in view.composite_rules() {
		if !rule.active {
			continue;
		}
		if !rule_matches(rule, hostname, src_ip, dst_ip, src_port, dst_port) {
			continue;
		}
		return match rule.action {
			RuleAction::Block => CompositeOutcome::Done(Decision::Block {
				reason: rule.reason_or_default(),
				kind: DecisionKind::Rule,
				entity_id: Some(rule.id),
				logged_rule_id: None,
			}),
			RuleAction::Allow => CompositeOutcome::Done(Decision::Allow { entity_id: Some(rule.id) }),
			RuleAction::Log => CompositeOutcome::Logged(rule.id),
		};
	}
	CompositeOutcome::NoMatch
}

fn rule_matches(
	rule: &BlockRule,
	hostname: Option<&str>,
	src_ip: IpAddr,
	dst_ip: IpAddr,
	src_port: Option<u16>,
	dst_port: Option<u16>,
) -> bool {
	if let Some(pattern) = &rule.domain_pattern {
		let Some(hostname) = hostname else { return false };
		let kind = crate::model::DomainPatternKind::classify(pattern);
		if !domain_matches(hostname, pattern, kind) {
			return false;
		}
	}
	if let Some(rule_src_ip) = rule.source_ip {
		if !ip_matches(src_ip, rule_src_ip, rule.source_ip_cidr) {
			return false;
		}
	}
	if let Some(rule_dst_ip) = rule.dest_ip {
		if !ip_matches(dst_ip, rule_dst_ip, rule.dest_ip_cidr) {
			return false;
		}
	}
	if rule.source_port_start.is_some() && !port_matches(src_port, rule.source_port_start, rule.source_port_end) {
		return false;
	}
	if rule.dest_port_start.is_some() && !port_matches(dst_port, rule.dest_port_start, rule.dest_port_end) {
		return false;
	}
	true
}

fn evaluate_domain(view: &dyn PolicyView, hostname: &str) -> Option<Decision> {
	let labels: Vec<&str> = hostname.split('.').collect();
	for i in 0..labels.len() {
		let suffix = labels[i..].join(".");
		if let Some(domain) = view.domain_exact().get(&suffix) {
			if domain.active {
				return Some(block_domain(domain));
			}
		}
	}
	for domain in view.domain_wildcards() {
		if !domain.active {
			continue;
		}
		if domain_matches(hostname, &domain.pattern, domain.kind()) {
			return Some(block_domain(domain));
		}
	}
	None
}

fn block_domain(domain: &BlockedDomain) -> Decision {
	Decision::Block {
		reason: domain
			.reason
			.clone()
			.unwrap_or_else(|| format!("blocked domain: {}", domain.pattern)),
		kind: DecisionKind::Domain,
		entity_id: Some(domain.id),
		logged_rule_id: None,
	}
}

fn evaluate_ip(
	exact: &[BlockedIp],
	ranges: &[BlockedIp],
	candidate: IpAddr,
	direction: Direction,
	kind: DecisionKind,
) -> Option<Decision> {
	for entry in exact {
		if entry.active && entry.direction.applies_to(direction) && ip_matches(candidate, entry.address, None) {
			return Some(block_ip(entry, kind));
		}
	}
	for entry in ranges {
		if entry.active && entry.direction.applies_to(direction) && ip_matches(candidate, entry.address, entry.prefix_len) {
			return Some(block_ip(entry, kind));
		}
	}
	None
}

fn block_ip(entry: &BlockedIp, kind: DecisionKind) -> Decision {
	Decision::Block {
		reason: entry
			.reason
			.clone()
			.unwrap_or_else(|| format!("blocked ip: {}", entry.address)),
		kind,
		entity_id: Some(entry.id),
		logged_rule_id: None,
	}
}

fn evaluate_port(
	exact: &[BlockedPort],
	ranges: &[BlockedPort],
	candidate: Option<u16>,
	direction: Direction,
	kind: DecisionKind,
) -> Option<Decision> {
	for entry in exact {
		if entry.active && entry.direction.applies_to(direction) && port_matches(candidate, Some(entry.port), None) {
			return Some(block_port(entry, kind));
		}
	}
	for entry in ranges {
		if entry.active
			&& entry.direction.applies_to(direction)
			&& port_matches(candidate, Some(entry.port), entry.port_end)
		{
			return Some(block_port(entry, kind));
		}
	}
	None
}

fn block_port(entry: &BlockedPort, kind: DecisionKind) -> Decision {
	Decision::Block {
		reason: entry
			.reason
			.clone()
			.unwrap_or_else(|| format!("blocked port: {}", entry.port)),
		kind,
		entity_id: Some(entry.id),
		logged_rule_id: None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;

	#[derive(Default)]
	struct TestView {
		rules: Vec<BlockRule>,
		domain_exact: HashMap<String, BlockedDomain>,
		domain_wildcards: Vec<BlockedDomain>,
		ip_exact: Vec<BlockedIp>,
		ip_ranges: Vec<BlockedIp>,
		port_exact: Vec<BlockedPort>,
		port_ranges: Vec<BlockedPort>,
	}

	impl PolicyView for TestView {
		fn composite_rules(&self) -> &[BlockRule] {
			&self.rules
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

	fn unspecified() -> IpAddr {
		"0.0.0.0".parse().unwrap()
	}

	#[test]
	fn allows_when_nothing_matches() {
		let view = TestView::default();
		let decision = evaluate(&view, Some("example.com"), unspecified(), unspecified(), Some(1234), Some(80));
		assert_eq!(decision, Decision::Allow { entity_id: None });
	}

	#[test]
	fn blocks_on_exact_domain() {
		let mut view = TestView::default();
		view.domain_exact.insert(
			"ads.net".into(),
			BlockedDomain::new(EntityId(1), "ads.net", Default::default()),
		);
		let decision = evaluate(&view, Some("ads.net"), unspecified(), unspecified(), None, None);
		match decision {
			Decision::Block { kind, entity_id, .. } => {
				assert_eq!(kind, DecisionKind::Domain);
				assert_eq!(entity_id, Some(EntityId(1)));
			}
			other => panic!("expected block, got {other:?}"),
		}
	}

	#[test]
	fn subdomain_walks_to_exact_suffix() {
		let mut view = TestView::default();
		view.domain_exact.insert(
			"ads.net".into(),
			BlockedDomain::new(EntityId(1), "ads.net", Default::default()),
		);
		let decision = evaluate(&view, Some("tracker.ads.net"), unspecified(), unspecified(), None, None);
		assert!(matches!(decision, Decision::Block { .. }));
	}

	#[test]
	fn allow_rule_short_circuits_everything() {
		let mut view = TestView::default();
		view.domain_exact.insert(
			"ads.net".into(),
			BlockedDomain::new(EntityId(1), "ads.net", Default::default()),
		);
		view.rules.push(BlockRule {
			id: EntityId(10),
			name: "trust ads.net".into(),
			priority: 0,
			action: RuleAction::Allow,
			active: true,
			hit_count: 0,
			reason: None,
			created_at: Utc::now(),
			domain_pattern: Some("ads.net".into()),
			source_ip: None,
			source_ip_cidr: None,
			dest_ip: None,
			dest_ip_cidr: None,
			source_port_start: None,
			source_port_end: None,
			dest_port_start: None,
			dest_port_end: None,
		});
		let decision = evaluate(&view, Some("ads.net"), unspecified(), unspecified(), None, None);
		assert_eq!(decision, Decision::Allow { entity_id: Some(EntityId(10)) });
	}

	#[test]
	fn log_rule_does_not_short_circuit() {
		let mut view = TestView::default();
		view.domain_exact.insert(
			"ads.net".into(),
			BlockedDomain::new(EntityId(1), "ads.net", Default::default()),
		);
		view.rules.push(BlockRule {
			id: EntityId(10),
			name: "note ads.net".into(),
			priority: 0,
			action: RuleAction::Log,
			active: true,
			hit_count: 0,
			reason: None,
			created_at: Utc::now(),
			domain_pattern: Some("ads.net".into()),
			source_ip: None,
			source_ip_cidr: None,
			dest_ip: None,
			dest_ip_cidr: None,
			source_port_start: None,
			source_port_end: None,
			dest_port_start: None,
			dest_port_end: None,
		});
		let decision = evaluate(&view, Some("ads.net"), unspecified(), unspecified(), None, None);
		match decision {
			Decision::Block { kind, entity_id, logged_rule_id, .. } => {
				assert_eq!(kind, DecisionKind::Domain);
				assert_eq!(entity_id, Some(EntityId(1)));
				assert_eq!(logged_rule_id, Some(EntityId(10)));
			}
			other => panic!("expected block carrying the earlier log hit, got {other:?}"),
		}
	}
}
