use std::net::SocketAddr;

use tracing::{debug, info, warn};

/// Information about a single backend server.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Backend server address (IP:port).
    pub address: SocketAddr,
    /// Weight assigned for balancing decisions.
    pub weight: u32,
    /// Count of requests currently in flight to this backend.
    pub active_requests: u32,
}

impl BackendInfo {
    pub fn new(address: SocketAddr, weight: u32) -> Self {
        Self { address, weight, active_requests: 0 }
    }
}

/// Ordered backend registry shared by the proxy core and every policy.
///
/// Order is the configuration order; lookups are by address. `active_requests`
/// totals the number of requests sent to a backend and not yet finished, so
/// after a clean shutdown the sum over all backends is zero.
#[derive(Debug, Default)]
pub struct BackendPool {
    backends: Vec<BackendInfo>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-replaces the backend set, resetting in-flight counts.
    pub fn set(&mut self, backends: &[(SocketAddr, u32)]) {
        self.backends.clear();
        self.backends.reserve(backends.len());
        info!("setting {} backends", backends.len());
        for &(address, weight) in backends {
            if weight == 0 {
                warn!(%address, "backend added with zero weight; some policies will never select it");
            }
            self.backends.push(BackendInfo::new(address, weight));
        }
    }

    /// Adds a backend, or updates its weight if the address is already known.
    /// The in-flight count is not reset on a weight change.
    pub fn add(&mut self, address: SocketAddr, weight: u32) {
        if weight == 0 {
            warn!(%address, "backend added with zero weight; some policies will never select it");
        }
        match self.get_mut(address) {
            Some(existing) => {
                info!(%address, old_weight = existing.weight, new_weight = weight, "backend weight updated");
                existing.weight = weight;
            }
            None => {
                info!(%address, weight, "backend added");
                self.backends.push(BackendInfo::new(address, weight));
            }
        }
    }

    pub fn get(&self, address: SocketAddr) -> Option<&BackendInfo> {
        self.backends.iter().find(|b| b.address == address)
    }

    pub fn get_mut(&mut self, address: SocketAddr) -> Option<&mut BackendInfo> {
        self.backends.iter_mut().find(|b| b.address == address)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BackendInfo> {
        self.backends.iter()
    }

    pub fn as_slice(&self) -> &[BackendInfo] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Marks one more request in flight to `address`.
    pub fn inc_active(&mut self, address: SocketAddr) {
        match self.get_mut(address) {
            Some(info) => {
                info.active_requests += 1;
                debug!(%address, active = info.active_requests, "request sent");
            }
            None => warn!(%address, "request sent to unknown backend"),
        }
    }

    /// Marks one request to `address` as finished, flooring at zero.
    pub fn dec_active(&mut self, address: SocketAddr) {
        match self.get_mut(address) {
            Some(info) => {
                if info.active_requests > 0 {
                    info.active_requests -= 1;
                } else {
                    warn!(%address, "active request count would go negative; leaving at zero");
                }
                debug!(%address, active = info.active_requests, "request finished");
            }
            None => warn!(%address, "request finished for unknown backend"),
        }
    }

    /// Total requests in flight across all backends.
    pub fn total_active(&self) -> u64 {
        self.backends.iter().map(|b| u64::from(b.active_requests)).sum()
    }
}
