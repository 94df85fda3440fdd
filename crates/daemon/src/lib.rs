//! Passim daemon
//!
//! Serves locally published files over HTTPS to peers on the same LAN,
//! advertises their content hashes via an external mDNS discovery daemon,
//! and redirects loopback clients to peers holding content this host lacks.

pub mod audit;
pub mod avahi;
pub mod browser;
pub mod config;
pub mod control;
pub mod events;
pub mod http;
pub mod lookup;
pub mod metered;
pub mod resolver;
pub mod service;
pub mod tls;

/// Daemon version, surfaced on the control plane and the index page.
pub fn daemon_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
