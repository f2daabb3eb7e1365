//! The `Broadcaster` abstraction (§6) — the real-time event bus boundary.
//! The WebSocket wire format and session fan-out are out of scope (§1); the
//! core only needs `publish(group, event)`. `ChannelBroadcaster` is a direct
//! analogue of the original's Django Channels `channel_layer.group_send`,
//! built on a `tokio::sync::broadcast` channel per group.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::ProxyRequestListView;

/// The well-known group the dashboard subscribes to for live request rows.
pub const DASHBOARD_GROUP: &str = "dashboard";

/// Events published to a broadcast group. Only `NewRequest` exists today;
/// the `type` tag matches the original's `{"type": "new_request", ...}`
/// message shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
	NewRequest { request: ProxyRequestListView },
}

impl BroadcastEvent {
	/// Renders the wire form an out-of-process WebSocket bridge would
	/// forward verbatim to dashboard clients.
	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
	/// Publishes `event` to `group`. Failure (no subscribers, channel
	/// closed) is the caller's to swallow per §4.6 — this still returns a
	/// `Result` so callers can log at debug level if they want to.
	async fn publish(&self, group: &str, event: BroadcastEvent) -> Result<(), crate::error::ProxyError>;
}

/// In-process fan-out over `tokio::sync::broadcast`, one channel per group,
/// created lazily on first publish or subscribe.
pub struct ChannelBroadcaster {
	groups: RwLock<HashMap<String, broadcast::Sender<BroadcastEvent>>>,
	capacity: usize,
}

impl ChannelBroadcaster {
	pub fn new(capacity: usize) -> ChannelBroadcaster {
		ChannelBroadcaster {
			groups: RwLock::new(HashMap::new()),
			capacity,
		}
	}

	/// Subscribes to `group`, creating its channel if this is the first
	/// subscriber. Intended for an out-of-process consumer (e.g. a
	/// WebSocket bridge) wired up outside the core.
	pub fn subscribe(&self, group: &str) -> broadcast::Receiver<BroadcastEvent> {
		let mut groups = self.groups.write().expect("broadcaster lock poisoned");
		groups
			.entry(group.to_string())
			.or_insert_with(|| broadcast::channel(self.capacity).0)
			.subscribe()
	}
}

#[async_trait]
impl Broadcaster for ChannelBroadcaster {
	async fn publish(&self, group: &str, event: BroadcastEvent) -> Result<(), crate::error::ProxyError> {
		let sender = {
			let groups = self.groups.read().expect("broadcaster lock poisoned");
			groups.get(group).cloned()
		};
		let Some(sender) = sender else {
			// No one has subscribed to this group yet; nothing to do.
			return Ok(());
		};
		// send() only errors when there are zero receivers, which is not a
		// failure worth surfacing — it just means nobody is listening.
		let _ = sender.send(event);
		Ok(())
	}
}
