use std::collections::BTreeMap;
use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::Rng;
use tracing::{debug, info, warn};

use super::hash64;
use crate::proxy::backend::BackendPool;

/// Ketama-style consistent hashing over a ring of virtual nodes.
///
/// Each positive-weight backend is hashed onto the ring at a number of points
/// proportional to its weight share; a request key walks clockwise to the
/// first point at or past its own hash. Adding or removing one backend only
/// remaps the keys that landed on its points.
#[derive(Debug)]
pub struct RingHash {
    min_ring_size: u64,
    max_ring_size: u64,
    hashes_per_host: u32,
    ring: BTreeMap<u64, SocketAddr>,
    rng: SmallRng,
}

impl RingHash {
    pub fn new(min_ring_size: u64, max_ring_size: u64, hashes_per_host: u32, rng: SmallRng) -> Self {
        Self { min_ring_size, max_ring_size, hashes_per_host, ring: BTreeMap::new(), rng }
    }

    /// Rebuilds the ring from scratch; called on every backend-set change.
    pub fn rebuild(&mut self, pool: &BackendPool) {
        self.ring.clear();

        if pool.is_empty() {
            warn!("no backends available, ring left empty");
            return;
        }

        let mut total_weight = 0.0f64;
        let mut positive = 0u64;
        for backend in pool.iter() {
            if backend.weight > 0 {
                total_weight += f64::from(backend.weight);
                positive += 1;
            }
        }
        if positive == 0 {
            warn!("all backends have zero weight, ring left empty");
            return;
        }

        let desired = positive * u64::from(self.hashes_per_host);
        let target = desired.clamp(self.min_ring_size, self.max_ring_size);

        for backend in pool.iter() {
            if backend.weight == 0 {
                continue;
            }
            let fraction = f64::from(backend.weight) / total_weight;
            let hashes = ((target as f64 * fraction).round() as u64).max(1);
            for k in 0..hashes {
                let key = format!("{}_{}", backend.address, k);
                let point = hash64(&key);
                // Collisions are vanishingly rare; the later insertion simply
                // overwrites, which keeps the mapping consistent.
                if let Some(previous) = self.ring.insert(point, backend.address) {
                    if previous != backend.address {
                        warn!(point, %previous, current = %backend.address, "ring point collision");
                    }
                }
            }
        }

        info!(
            virtual_nodes = self.ring.len(),
            target, positive, "hash ring rebuilt"
        );
    }

    pub fn choose(&mut self, pool: &BackendPool, l7_id: u64) -> Option<SocketAddr> {
        if self.ring.is_empty() {
            // Degraded mode: pick uniformly among positive-weight backends.
            let eligible: Vec<_> =
                pool.iter().filter(|b| b.weight > 0).map(|b| b.address).collect();
            if eligible.is_empty() {
                warn!("ring empty and no eligible backend for fallback");
                return None;
            }
            warn!("ring empty, falling back to a random backend");
            return Some(eligible[self.rng.gen_range(0..eligible.len())]);
        }

        let request_hash = hash64(&l7_id.to_string());
        let chosen = self
            .ring
            .range(request_hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, address)| *address);
        debug!(l7_id, request_hash, ?chosen, "ring lookup");
        chosen
    }
}
