//! IP/CIDR matching (§4.1). Invalid inputs fail closed — callers get `false`,
//! never a propagated error, since a single bad rule must not take down
//! evaluation of every other rule.

use std::net::IpAddr;

use ipnet::IpNet;

/// Normalizes an IPv4-mapped IPv6 address down to its IPv4 form, otherwise
/// returns the address unchanged. Mirrors `to_canonical` in the block-proxy
/// idiom this crate follows for peer-address normalization.
pub fn canonical(addr: IpAddr) -> IpAddr {
	match addr {
		IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
			Some(v4) => IpAddr::V4(v4),
			None => IpAddr::V6(v6),
		},
		other => other,
	}
}

/// Returns whether `candidate` is covered by the rule address `rule_addr`,
/// optionally as a `/prefix_len` network.
pub fn ip_matches(candidate: IpAddr, rule_addr: IpAddr, prefix_len: Option<u8>) -> bool {
	let candidate = canonical(candidate);
	let rule_addr = canonical(rule_addr);

	match prefix_len {
		Some(len) => match IpNet::new(rule_addr, len) {
			Ok(net) => net.contains(&candidate),
			Err(_) => false,
		},
		None => candidate == rule_addr,
	}
}
