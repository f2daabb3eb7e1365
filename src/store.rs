//! The `Store` abstraction (§6) — the persistence boundary the core talks
//! to. The real storage engine is explicitly out of scope (§1); this module
//! only defines the trait and ships an in-memory reference implementation
//! sufficient to run the proxy standalone and drive the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{BlockRule, BlockedDomain, BlockedIp, BlockedPort, DomainStats, EntityId, ProxyRequest};

#[async_trait]
pub trait Store: Send + Sync {
	async fn list_active_domains(&self) -> Result<Vec<BlockedDomain>, StoreError>;
	async fn list_active_ips(&self) -> Result<Vec<BlockedIp>, StoreError>;
	async fn list_active_ports(&self) -> Result<Vec<BlockedPort>, StoreError>;
	async fn list_active_rules_by_priority(&self) -> Result<Vec<BlockRule>, StoreError>;

	async fn increment_domain_hit(&self, id: EntityId) -> Result<(), StoreError>;
	async fn increment_ip_hit(&self, id: EntityId) -> Result<(), StoreError>;
	async fn increment_port_hit(&self, id: EntityId) -> Result<(), StoreError>;
	async fn increment_rule_hit(&self, id: EntityId) -> Result<(), StoreError>;

	async fn upsert_domain_stats(&self, hostname: &str, bytes: u64, blocked: bool) -> Result<(), StoreError>;
	async fn append_proxy_request(&self, row: ProxyRequest) -> Result<EntityId, StoreError>;
}

/// `tokio::sync::RwLock`-guarded in-memory tables. Stands in for the real
/// persistence engine; production deployments provide their own `Store`.
#[derive(Default)]
pub struct InMemoryStore {
	domains: RwLock<Vec<BlockedDomain>>,
	ips: RwLock<Vec<BlockedIp>>,
	ports: RwLock<Vec<BlockedPort>>,
	rules: RwLock<Vec<BlockRule>>,
	domain_stats: RwLock<HashMap<String, DomainStats>>,
	requests: RwLock<Vec<ProxyRequest>>,
	next_request_id: AtomicU64,
}

impl InMemoryStore {
	pub fn new() -> InMemoryStore {
		InMemoryStore::default()
	}

	pub async fn seed_domains(&self, domains: Vec<BlockedDomain>) {
		*self.domains.write().await = domains;
	}

	pub async fn seed_ips(&self, ips: Vec<BlockedIp>) {
		*self.ips.write().await = ips;
	}

	pub async fn seed_ports(&self, ports: Vec<BlockedPort>) {
		*self.ports.write().await = ports;
	}

	pub async fn seed_rules(&self, rules: Vec<BlockRule>) {
		*self.rules.write().await = rules;
	}

	pub async fn requests_snapshot(&self) -> Vec<ProxyRequest> {
		self.requests.read().await.clone()
	}

	pub async fn domain_stats_snapshot(&self) -> HashMap<String, DomainStats> {
		self.domain_stats.read().await.clone()
	}
}

#[async_trait]
impl Store for InMemoryStore {
	async fn list_active_domains(&self) -> Result<Vec<BlockedDomain>, StoreError> {
		Ok(self.domains.read().await.iter().filter(|d| d.active).cloned().collect())
	}

	async fn list_active_ips(&self) -> Result<Vec<BlockedIp>, StoreError> {
		Ok(self.ips.read().await.iter().filter(|i| i.active).cloned().collect())
	}

	async fn list_active_ports(&self) -> Result<Vec<BlockedPort>, StoreError> {
		Ok(self.ports.read().await.iter().filter(|p| p.active).cloned().collect())
	}

	async fn list_active_rules_by_priority(&self) -> Result<Vec<BlockRule>, StoreError> {
		let mut rules: Vec<BlockRule> = self.rules.read().await.iter().filter(|r| r.active).cloned().collect();
		rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.created_at.cmp(&a.created_at)));
		Ok(rules)
	}

	async fn increment_domain_hit(&self, id: EntityId) -> Result<(), StoreError> {
		let mut domains = self.domains.write().await;
		let domain = domains.iter_mut().find(|d| d.id == id).ok_or(StoreError::NotFound(id.0))?;
		domain.hit_count += 1;
		Ok(())
	}

	async fn increment_ip_hit(&self, id: EntityId) -> Result<(), StoreError> {
		let mut ips = self.ips.write().await;
		let ip = ips.iter_mut().find(|i| i.id == id).ok_or(StoreError::NotFound(id.0))?;
		ip.hit_count += 1;
		Ok(())
	}

	async fn increment_port_hit(&self, id: EntityId) -> Result<(), StoreError> {
		let mut ports = self.ports.write().await;
		let port = ports.iter_mut().find(|p| p.id == id).ok_or(StoreError::NotFound(id.0))?;
		port.hit_count += 1;
		Ok(())
	}

	async fn increment_rule_hit(&self, id: EntityId) -> Result<(), StoreError> {
		let mut rules = self.rules.write().await;
		let rule = rules.iter_mut().find(|r| r.id == id).ok_or(StoreError::NotFound(id.0))?;
		rule.hit_count += 1;
		Ok(())
	}

	async fn upsert_domain_stats(&self, hostname: &str, bytes: u64, blocked: bool) -> Result<(), StoreError> {
		let mut stats = self.domain_stats.write().await;
		let now = Utc::now();
		let entry = stats.entry(hostname.to_string()).or_insert_with(|| DomainStats {
			hostname: hostname.to_string(),
			request_count: 0,
			blocked_count: 0,
			total_bytes: 0,
			first_seen: now,
			last_seen: now,
		});
		entry.request_count += 1;
		entry.total_bytes += bytes;
		if blocked {
			entry.blocked_count += 1;
		}
		entry.last_seen = now;
		Ok(())
	}

	async fn append_proxy_request(&self, row: ProxyRequest) -> Result<EntityId, StoreError> {
		let id = EntityId(self.next_request_id.fetch_add(1, Ordering::Relaxed));
		self.requests.write().await.push(row);
		Ok(id)
	}
}
