//! Backend selection policies.
//!
//! Realized as an enum with per-variant state rather than trait objects; the
//! hot path is `choose`, `record_latency`, and the in-flight notifications on
//! a single known variant. Every policy that uses randomness draws from a
//! runtime-provided stream so runs replay exactly under a fixed seed.

mod least_request;
mod maglev;
mod peak_ewma;
mod random;
mod ring_hash;
mod round_robin;

pub use least_request::LeastRequest;
pub use maglev::Maglev;
pub use peak_ewma::{EwmaMetric, PeakEwma};
pub use random::Random;
pub use ring_hash::RingHash;
pub use round_robin::RoundRobin;

use std::hash::{BuildHasher, Hasher};
use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::Rng;

use crate::config::{Algorithm, BalancerConfig};
use crate::proxy::backend::BackendPool;

/// Stable 64-bit string hash shared by the hash-based policies and the
/// request key. Fixed seeds keep the mapping identical across runs.
pub(crate) fn hash64(key: &str) -> u64 {
    let state = ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    );
    let mut hasher = state.build_hasher();
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// Bounded attempts at drawing two distinct indices for power-of-two-choices.
const MAX_PICK_ATTEMPTS: u32 = 10;

/// Draws two indices in `[0, n)`, distinct when possible. After the attempt
/// budget is exhausted the pair may collapse to a single pick.
pub(crate) fn pick_two(rng: &mut SmallRng, n: usize) -> (usize, usize) {
    let first = rng.gen_range(0..n);
    let mut second = first;
    let mut attempts = 0;
    while second == first && n > 1 && attempts < MAX_PICK_ATTEMPTS {
        second = rng.gen_range(0..n);
        attempts += 1;
    }
    (first, second)
}

#[derive(Debug)]
enum Policy {
    RoundRobin(RoundRobin),
    LeastRequest(LeastRequest),
    Random(Random),
    RingHash(RingHash),
    Maglev(Maglev),
    PeakEwma(PeakEwma),
}

/// Backend registry plus the active selection policy.
///
/// The proxy core drives this through five calls: backend-set changes,
/// `choose` once per request, `record_latency` once per response, and the
/// sent/finished pair that keeps in-flight accounting balanced.
#[derive(Debug)]
pub struct Balancer {
    pool: BackendPool,
    policy: Policy,
    sent_total: u64,
    finished_total: u64,
}

impl Balancer {
    pub fn new(config: &BalancerConfig, rng: SmallRng, now_ns: i64) -> Self {
        let policy = match config.algorithm {
            Algorithm::RoundRobin => Policy::RoundRobin(RoundRobin::new()),
            Algorithm::LeastRequest => {
                Policy::LeastRequest(LeastRequest::new(config.active_request_bias, rng))
            }
            Algorithm::Random => Policy::Random(Random::new(rng)),
            Algorithm::RingHash => Policy::RingHash(RingHash::new(
                config.min_ring_size,
                config.max_ring_size,
                config.hashes_per_host,
                rng,
            )),
            Algorithm::Maglev => Policy::Maglev(Maglev::new(config.table_size, rng)),
            Algorithm::PeakEwma => {
                Policy::PeakEwma(PeakEwma::new(config.decay_time.as_nanos() as i64, rng, now_ns))
            }
        };
        Self { pool: BackendPool::new(), policy, sent_total: 0, finished_total: 0 }
    }

    /// Bulk-replaces the backend set and rebuilds policy state.
    pub fn set_backends(&mut self, backends: &[(SocketAddr, u32)], now_ns: i64) {
        self.pool.set(backends);
        self.rebuild(now_ns);
    }

    /// Adds or re-weights a single backend and rebuilds policy state.
    pub fn add_backend(&mut self, address: SocketAddr, weight: u32, now_ns: i64) {
        self.pool.add(address, weight);
        self.rebuild(now_ns);
    }

    fn rebuild(&mut self, now_ns: i64) {
        match &mut self.policy {
            Policy::RoundRobin(p) => p.rebuild(&self.pool),
            Policy::LeastRequest(p) => p.rebuild(&self.pool),
            Policy::Random(_) => {}
            Policy::RingHash(p) => p.rebuild(&self.pool),
            Policy::Maglev(p) => p.rebuild(&self.pool),
            Policy::PeakEwma(p) => p.rebuild(&self.pool, now_ns),
        }
    }

    /// Picks a backend for one request, or `None` when the policy cannot.
    pub fn choose(&mut self, l7_id: u64, now_ns: i64) -> Option<SocketAddr> {
        match &mut self.policy {
            Policy::RoundRobin(p) => p.choose(&self.pool),
            Policy::LeastRequest(p) => p.choose(&self.pool),
            Policy::Random(p) => p.choose(&self.pool),
            Policy::RingHash(p) => p.choose(&self.pool, l7_id),
            Policy::Maglev(p) => p.choose(&self.pool, l7_id),
            Policy::PeakEwma(p) => p.choose(&self.pool, now_ns),
        }
    }

    /// Feeds an observed round trip back to the policy.
    pub fn record_latency(&mut self, address: SocketAddr, rtt_ns: i64, now_ns: i64) {
        if let Policy::PeakEwma(p) = &mut self.policy {
            p.record_latency(address, rtt_ns, now_ns);
        }
    }

    /// A request was handed to the transport for `address` (possibly still
    /// waiting on a connect).
    pub fn notify_sent(&mut self, address: SocketAddr) {
        self.sent_total += 1;
        self.pool.inc_active(address);
        if let Policy::PeakEwma(p) = &mut self.policy {
            p.on_sent(address);
        }
    }

    /// The request to `address` finished: a response arrived, or the socket
    /// it rode on is gone.
    pub fn notify_finished(&mut self, address: SocketAddr) {
        self.finished_total += 1;
        self.pool.dec_active(address);
        if let Policy::PeakEwma(p) = &mut self.policy {
            p.on_finished(address);
        }
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total
    }

    pub fn finished_total(&self) -> u64 {
        self.finished_total
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use rand::SeedableRng;

    pub fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    pub fn addr(last: u8) -> SocketAddr {
        format!("10.1.0.{last}:9000").parse().unwrap()
    }

    pub fn pool(weights: &[u32]) -> BackendPool {
        let mut pool = BackendPool::new();
        let list: Vec<_> = weights
            .iter()
            .enumerate()
            .map(|(i, &w)| (addr(i as u8 + 1), w))
            .collect();
        pool.set(&list);
        pool
    }
}
