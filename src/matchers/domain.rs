//! Domain pattern matching (§4.1). `hostname` is always lower-cased and
//! port-stripped by the caller; `pattern` is pre-classified into a
//! `DomainPatternKind` at ingest (§9 REDESIGN FLAGS) so this function never
//! re-sniffs the pattern string.

use crate::model::DomainPatternKind;

/// Returns whether `hostname` is covered by `pattern`, interpreted according
/// to `kind`.
pub fn domain_matches(hostname: &str, pattern: &str, kind: DomainPatternKind) -> bool {
	match kind {
		DomainPatternKind::Exact => exact_or_subdomain(hostname, pattern),
		DomainPatternKind::LeadingDot => {
			let base = pattern.strip_prefix("*.").or_else(|| pattern.strip_prefix('.')).unwrap_or(pattern);
			exact_or_subdomain(hostname, base)
		}
		DomainPatternKind::Contains => {
			let interior = pattern.trim_matches('*');
			!interior.is_empty() && hostname.contains(interior)
		}
		DomainPatternKind::Prefix => {
			let prefix = pattern.trim_end_matches('*');
			hostname.starts_with(prefix)
		}
		DomainPatternKind::Suffix => {
			let suffix = pattern.trim_start_matches('*');
			hostname.ends_with(suffix)
		}
		DomainPatternKind::Glob => glob_match(hostname, pattern),
	}
}

fn exact_or_subdomain(hostname: &str, base: &str) -> bool {
	hostname == base || hostname.ends_with(&format!(".{base}"))
}

/// Standard `*`/`?` glob semantics, anchored at both ends.
fn glob_match(hostname: &str, pattern: &str) -> bool {
	let mut regex_str = String::with_capacity(pattern.len() * 2 + 2);
	regex_str.push('^');
	for ch in pattern.chars() {
		match ch {
			'*' => regex_str.push_str(".*"),
			'?' => regex_str.push('.'),
			c => regex_str.push_str(&regex::escape(&c.to_string())),
		}
	}
	regex_str.push('$');
	match regex::Regex::new(&regex_str) {
		Ok(re) => re.is_match(hostname),
		Err(_) => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case("example.com", "example.com", DomainPatternKind::Exact, true; "exact match")]
	#[test_case("www.example.com", "example.com", DomainPatternKind::Exact, true; "exact subdomain")]
	#[test_case("notexample.com", "example.com", DomainPatternKind::Exact, false; "exact no false suffix match")]
	#[test_case("ads.net", ".ads.net", DomainPatternKind::LeadingDot, true; "leading dot bare")]
	#[test_case("x.ads.net", ".ads.net", DomainPatternKind::LeadingDot, true; "leading dot subdomain")]
	#[test_case("ads.net", "*.ads.net", DomainPatternKind::LeadingDot, true; "leading star dot bare")]
	#[test_case("tracker.ads.net", "*.ads.net", DomainPatternKind::LeadingDot, true; "leading star dot subdomain")]
	#[test_case("evilads.net", ".ads.net", DomainPatternKind::LeadingDot, false; "leading dot no partial label match")]
	#[test_case("foo.xyz.bar", "*xyz*", DomainPatternKind::Contains, true; "contains hit")]
	#[test_case("foo.bar", "*xyz*", DomainPatternKind::Contains, false; "contains miss")]
	#[test_case("xyz.example.com", "xyz*", DomainPatternKind::Prefix, true; "prefix hit")]
	#[test_case("example.xyz", "xyz*", DomainPatternKind::Prefix, false; "prefix miss")]
	#[test_case("example.xyz", "*xyz", DomainPatternKind::Suffix, true; "suffix hit")]
	#[test_case("xyz.example", "*xyz", DomainPatternKind::Suffix, false; "suffix miss")]
	#[test_case("a1b.example.com", "a?b.example.com", DomainPatternKind::Glob, true; "glob question mark")]
	#[test_case("ab.example.com", "a?b.example.com", DomainPatternKind::Glob, false; "glob question mark miss")]
	fn matches(hostname: &str, pattern: &str, kind: DomainPatternKind, expect: bool) {
		assert_eq!(domain_matches(hostname, pattern, kind), expect);
	}

	#[test]
	fn classify_matches_documented_forms() {
		assert_eq!(DomainPatternKind::classify("example.com"), DomainPatternKind::Exact);
		assert_eq!(DomainPatternKind::classify(".ads.net"), DomainPatternKind::LeadingDot);
		assert_eq!(DomainPatternKind::classify("*.ads.net"), DomainPatternKind::LeadingDot);
		assert_eq!(DomainPatternKind::classify("*xyz*"), DomainPatternKind::Contains);
		assert_eq!(DomainPatternKind::classify("xyz*"), DomainPatternKind::Prefix);
		assert_eq!(DomainPatternKind::classify("*xyz"), DomainPatternKind::Suffix);
		assert_eq!(DomainPatternKind::classify("a?b.com"), DomainPatternKind::Glob);
	}
}
