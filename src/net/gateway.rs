//! Admission gate
//!
//! Decides whether a raw connection may proceed to the handshake:
//! - loopback hosts always pass
//! - a host that reconnects inside the throttle window while it still holds
//!   a connection is refused
//! - banned hosts are refused
//! - a host may hold at most `max_connections_per_host` sessions
//!
//! Rejection is a policy decision; the caller drops the socket without
//! speaking the protocol.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::AdmissionConfig;

/// Per-host bookkeeping, removed once the host holds no connections
#[derive(Debug, Clone, Copy)]
struct HostRecord {
    connections: u32,
    last_entry: Instant,
}

/// Per-host connection counting and reconnect throttling
pub struct AdmissionGate {
    hosts: DashMap<String, HostRecord>,
    banned: RwLock<HashSet<String>>,
    max_connections_per_host: u32,
    throttle_window: Duration,
}

impl AdmissionGate {
    pub fn new(max_connections_per_host: u32, throttle_window: Duration) -> Self {
        Self {
            hosts: DashMap::new(),
            banned: RwLock::new(HashSet::new()),
            max_connections_per_host,
            throttle_window,
        }
    }

    /// Build a gate from the `[admission]` configuration table
    pub fn from_config(config: &AdmissionConfig) -> Self {
        let gate = Self::new(
            config.max_connections_per_host,
            Duration::from_millis(config.throttle_window_ms),
        );
        for host in &config.banned_hosts {
            gate.ban(host);
        }
        gate
    }

    /// Try to admit a connection from `host`
    pub fn enter(&self, host: &str) -> bool {
        self.enter_at(host, Instant::now())
    }

    /// Admission check against an explicit clock reading
    pub fn enter_at(&self, host: &str, now: Instant) -> bool {
        if is_loopback(host) {
            return true;
        }
        let host = normalize(host);

        match self.hosts.entry(host.clone()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                let since_last = now.saturating_duration_since(record.last_entry);
                if since_last < self.throttle_window && record.connections >= 1 {
                    warn!(host = %host, since_last_ms = since_last.as_millis() as u64, "Host throttled");
                    return false;
                }
                if self.is_banned(&host) {
                    warn!(host = %host, "Banned host refused");
                    return false;
                }
                if record.connections >= self.max_connections_per_host {
                    warn!(
                        host = %host,
                        connections = record.connections,
                        max = self.max_connections_per_host,
                        "Connection limit reached for host"
                    );
                    return false;
                }
                record.connections += 1;
                record.last_entry = now;
                debug!(host = %host, connections = record.connections, "Host admitted");
                true
            }
            Entry::Vacant(vacant) => {
                if self.is_banned(&host) {
                    warn!(host = %host, "Banned host refused");
                    return false;
                }
                vacant.insert(HostRecord {
                    connections: 1,
                    last_entry: now,
                });
                debug!(host = %host, connections = 1, "Host admitted");
                true
            }
        }
    }

    /// Release one connection held by `host`; unknown hosts are ignored
    pub fn exit(&self, host: &str) {
        if is_loopback(host) {
            return;
        }
        if let Entry::Occupied(mut occupied) = self.hosts.entry(normalize(host)) {
            if occupied.get().connections <= 1 {
                occupied.remove();
            } else {
                occupied.get_mut().connections -= 1;
            }
        }
    }

    /// Active connections currently held by `host`
    pub fn connections(&self, host: &str) -> u32 {
        self.hosts
            .get(&normalize(host))
            .map(|record| record.connections)
            .unwrap_or(0)
    }

    pub fn ban(&self, host: &str) {
        self.banned.write().insert(normalize(host));
    }

    pub fn unban(&self, host: &str) -> bool {
        self.banned.write().remove(&normalize(host))
    }

    pub fn is_banned(&self, host: &str) -> bool {
        self.banned.read().contains(&normalize(host))
    }

    /// Hosts with at least one admitted connection
    pub fn tracked_hosts(&self) -> usize {
        self.hosts.len()
    }
}

fn normalize(host: &str) -> String {
    host.trim().to_lowercase()
}

/// Loopback hosts bypass every admission rule
pub fn is_loopback(host: &str) -> bool {
    let host = host.trim();
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}
