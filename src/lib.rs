//! proxysentry: a forwarding HTTP/HTTPS proxy with layered policy
//! enforcement and asynchronous telemetry. See `main.rs` for the runnable
//! entrypoint; this crate root exposes the pieces so integration tests can
//! drive the acceptor directly.

pub mod acceptor;
pub mod blocked_page;
pub mod broadcaster;
pub mod config;
pub mod connection;
pub mod error;
pub mod matchers;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod snapshot;
pub mod store;
pub mod telemetry;
