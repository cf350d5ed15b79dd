use std::collections::HashMap;
use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::Rng;
use tracing::{debug, warn};

use super::pick_two;
use crate::proxy::backend::BackendPool;

/// Fallback latency charged while a backend has no usable cost estimate.
const DEFAULT_PENALTY_NS: f64 = 1e9;

/// Peak-sensitive EWMA latency state for one backend.
///
/// The cost estimate decays exponentially toward recent observations. A sample
/// above the current estimate zeroes the cost first, which pushes the next
/// load query into the penalty branch; the two behaviors are deliberately
/// coupled so a latency spike immediately makes the backend look expensive.
#[derive(Debug, Clone)]
pub struct EwmaMetric {
    stamp_ns: i64,
    pending: u32,
    cost_ns: f64,
    decay_ns: f64,
    penalty_ns: f64,
}

impl EwmaMetric {
    pub fn new(decay_ns: i64, now_ns: i64) -> Self {
        Self {
            stamp_ns: now_ns,
            pending: 0,
            cost_ns: 0.0,
            decay_ns: decay_ns.max(1) as f64,
            penalty_ns: DEFAULT_PENALTY_NS,
        }
    }

    /// Folds a round-trip observation into the cost estimate.
    pub fn observe(&mut self, rtt_ns: i64, now_ns: i64) {
        let elapsed = (now_ns - self.stamp_ns).max(0) as f64;
        self.stamp_ns = now_ns;

        if rtt_ns as f64 > self.cost_ns && self.cost_ns > f64::EPSILON {
            // Peak reset: forget the old average so the spike dominates.
            self.cost_ns = 0.0;
        }

        let w = (-elapsed / self.decay_ns).exp();
        self.cost_ns = self.cost_ns * w + rtt_ns as f64 * (1.0 - w);
    }

    /// Current load score; higher means more loaded or more latent.
    pub fn load(&mut self, now_ns: i64) -> f64 {
        let elapsed = (now_ns - self.stamp_ns).max(0);
        if elapsed > 0 {
            let w = (-(elapsed as f64) / self.decay_ns).exp();
            self.cost_ns *= w;
            self.stamp_ns = now_ns;
        }

        let score = if self.cost_ns <= f64::EPSILON && self.pending > 0 {
            self.penalty_ns + f64::from(self.pending)
        } else {
            self.cost_ns * (f64::from(self.pending) + 1.0)
        };
        score.max(0.0)
    }

    pub fn increment_pending(&mut self) {
        self.pending += 1;
    }

    pub fn decrement_pending(&mut self) {
        if self.pending > 0 {
            self.pending -= 1;
        } else {
            warn!("pending request count would go negative; leaving at zero");
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn cost_ns(&self) -> f64 {
        self.cost_ns
    }
}

/// Power-of-two-choices on the peak-EWMA load score.
#[derive(Debug)]
pub struct PeakEwma {
    decay_ns: i64,
    metrics: HashMap<SocketAddr, EwmaMetric>,
    rng: SmallRng,
}

impl PeakEwma {
    pub fn new(decay_ns: i64, rng: SmallRng, _now_ns: i64) -> Self {
        Self { decay_ns: decay_ns.max(1), metrics: HashMap::new(), rng }
    }

    /// Syncs the metric map with the backend set. Metrics for addresses that
    /// survive the change keep their state; re-added addresses keep theirs
    /// too, so a flapping backend does not reset its history.
    pub fn rebuild(&mut self, pool: &BackendPool, now_ns: i64) {
        self.metrics.retain(|address, _| pool.get(*address).is_some());
        for backend in pool.iter() {
            self.metrics
                .entry(backend.address)
                .or_insert_with(|| EwmaMetric::new(self.decay_ns, now_ns));
        }
        debug!(backends = self.metrics.len(), "peak ewma metric map rebuilt");
    }

    pub fn choose(&mut self, pool: &BackendPool, now_ns: i64) -> Option<SocketAddr> {
        let backends = pool.as_slice();
        if backends.is_empty() {
            warn!("no backends available");
            return None;
        }
        if backends.len() == 1 {
            return Some(backends[0].address);
        }

        let (first, second) = pick_two(&mut self.rng, backends.len());
        if first == second {
            return Some(backends[first].address);
        }

        let load_first = self.load_of(backends[first].address, now_ns);
        let load_second = self.load_of(backends[second].address, now_ns);
        let chosen = if load_first < load_second {
            first
        } else if load_second < load_first {
            second
        } else if self.rng.gen_bool(0.5) {
            first
        } else {
            second
        };
        debug!(
            first = %backends[first].address,
            load_first,
            second = %backends[second].address,
            load_second,
            chosen = %backends[chosen].address,
            "p2c on load"
        );
        Some(backends[chosen].address)
    }

    fn load_of(&mut self, address: SocketAddr, now_ns: i64) -> f64 {
        match self.metrics.get_mut(&address) {
            Some(metric) => metric.load(now_ns),
            None => {
                warn!(%address, "no metric for backend; treating as fully loaded");
                f64::MAX
            }
        }
    }

    pub fn record_latency(&mut self, address: SocketAddr, rtt_ns: i64, now_ns: i64) {
        match self.metrics.get_mut(&address) {
            Some(metric) => metric.observe(rtt_ns, now_ns),
            None => warn!(%address, "latency observed for unknown backend"),
        }
    }

    pub fn on_sent(&mut self, address: SocketAddr) {
        match self.metrics.get_mut(&address) {
            Some(metric) => metric.increment_pending(),
            None => warn!(%address, "request sent to backend without a metric"),
        }
    }

    pub fn on_finished(&mut self, address: SocketAddr) {
        match self.metrics.get_mut(&address) {
            Some(metric) => metric.decrement_pending(),
            None => warn!(%address, "request finished for backend without a metric"),
        }
    }

    #[cfg(test)]
    pub(crate) fn metric(&self, address: SocketAddr) -> Option<&EwmaMetric> {
        self.metrics.get(&address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::test_util::{addr, pool, rng};

    const MS: i64 = 1_000_000;
    const DECAY: i64 = 10_000 * MS;

    #[test]
    fn test_steady_rtt_holds_a_stable_estimate() {
        // A sample above the estimate resets it first, so a constant RTT
        // holds the estimate at rtt * (1 - w) for the observation cadence
        // rather than converging to the full RTT.
        let mut metric = EwmaMetric::new(DECAY, 0);
        let mut now = 0;
        let mut previous = 0.0;
        for i in 0..50 {
            now += 100 * MS;
            metric.observe(5 * MS, now);
            if i > 0 {
                assert!((metric.cost_ns() - previous).abs() < 1.0);
            }
            previous = metric.cost_ns();
        }
        assert!(previous > 0.0 && previous < 5.0 * MS as f64);
    }

    #[test]
    fn test_lower_sample_blends_without_reset() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        // A long gap makes (1 - w) large, so the first sample lands close to
        // its full value and sits above the next, smaller one.
        metric.observe(5 * MS, 3 * DECAY);
        let settled = metric.cost_ns();
        assert!(settled > 4.7 * MS as f64, "settled {settled}");
        metric.observe(MS, 6 * DECAY);
        let blended = metric.cost_ns();
        assert!(blended > MS as f64 && blended < 1.5 * MS as f64, "blended {blended}");
    }

    #[test]
    fn test_peak_resets_cost_before_update() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        metric.observe(5 * MS, 3 * DECAY);
        let settled = metric.cost_ns();
        // A sample barely above the estimate discards it entirely; the new
        // cost is just the spike's (1 - w) share, far below a plain blend.
        metric.observe(6 * MS, 3 * DECAY + 100 * MS);
        let after_peak = metric.cost_ns();
        assert!(after_peak > 0.0);
        assert!(after_peak < settled / 10.0, "after {after_peak} settled {settled}");
    }

    #[test]
    fn test_load_penalty_branch_when_cost_zero_and_pending() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        metric.increment_pending();
        metric.increment_pending();
        let load = metric.load(0);
        assert_eq!(load, DEFAULT_PENALTY_NS + 2.0);
    }

    #[test]
    fn test_load_scales_with_pending() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        metric.observe(5 * MS, 100 * MS);
        let idle = metric.load(100 * MS);
        assert!(idle > 0.0);
        metric.increment_pending();
        let busy = metric.load(100 * MS);
        assert!((busy - 2.0 * idle).abs() < 1e-6, "idle {idle} busy {busy}");
    }

    #[test]
    fn test_load_decays_over_time() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        metric.observe(5 * MS, 100 * MS);
        let fresh = metric.load(100 * MS);
        let mut cooled = metric.clone();
        let later = cooled.load(100 * MS + DECAY * 3);
        assert!(fresh > 0.0);
        assert!(later < fresh / 10.0, "fresh {fresh} later {later}");
    }

    #[test]
    fn test_decrement_pending_floors_at_zero() {
        let mut metric = EwmaMetric::new(DECAY, 0);
        metric.decrement_pending();
        assert_eq!(metric.pending(), 0);
    }

    #[test]
    fn test_p2c_prefers_lower_latency_backend() {
        let pool = pool(&[1, 1]);
        let mut ewma = PeakEwma::new(DECAY, rng(), 0);
        ewma.rebuild(&pool, 0);
        let mut now = 0;
        for _ in 0..50 {
            now += 100 * MS;
            ewma.record_latency(addr(1), 5 * MS, now);
            ewma.record_latency(addr(2), 50 * MS, now);
        }
        let mut fast = 0;
        for _ in 0..200 {
            if ewma.choose(&pool, now) == Some(addr(1)) {
                fast += 1;
            }
        }
        assert!(fast > 180, "fast picked {fast}/200");
    }

    #[test]
    fn test_set_backends_preserves_surviving_metrics() {
        let mut p = pool(&[1, 1]);
        let mut ewma = PeakEwma::new(DECAY, rng(), 0);
        ewma.rebuild(&p, 0);
        ewma.record_latency(addr(1), 5 * MS, 0);
        let cost = ewma.metric(addr(1)).unwrap().cost_ns();
        assert!(cost > 0.0);

        // Replace the set: addr(1) survives, addr(2) is dropped, addr(3) is new.
        p.set(&[(addr(1), 1), (addr(3), 1)]);
        ewma.rebuild(&p, 1_000 * MS);
        assert_eq!(ewma.metric(addr(1)).unwrap().cost_ns(), cost);
        assert!(ewma.metric(addr(2)).is_none());
        assert_eq!(ewma.metric(addr(3)).unwrap().cost_ns(), 0.0);
    }
}
