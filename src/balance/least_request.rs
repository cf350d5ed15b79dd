use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::Rng;
use tracing::{debug, warn};

use super::pick_two;
use crate::proxy::backend::BackendPool;

/// Least-request selection.
///
/// With equal weights this is plain power-of-two-choices on the in-flight
/// count. With unequal weights each backend gets an effective weight of
/// `weight / (active + 1)^bias` and a cumulative weighted draw picks among
/// them, so loaded backends fade without ever starving completely.
#[derive(Debug)]
pub struct LeastRequest {
    weights_equal: bool,
    bias: f64,
    rng: SmallRng,
}

impl LeastRequest {
    pub fn new(bias: f64, rng: SmallRng) -> Self {
        Self { weights_equal: true, bias, rng }
    }

    /// Re-derives the equal-weights flag; called on every backend-set change.
    pub fn rebuild(&mut self, pool: &BackendPool) {
        let backends = pool.as_slice();
        self.weights_equal = match backends.split_first() {
            None => true,
            Some((first, rest)) => rest.iter().all(|b| b.weight == first.weight),
        };
        debug!(weights_equal = self.weights_equal, "least request mode");
    }

    pub fn choose(&mut self, pool: &BackendPool) -> Option<SocketAddr> {
        let backends = pool.as_slice();
        if backends.is_empty() {
            warn!("no backends available");
            return None;
        }

        if self.weights_equal {
            if backends.len() == 1 {
                return Some(backends[0].address);
            }
            let (first, second) = pick_two(&mut self.rng, backends.len());
            if first == second {
                return Some(backends[first].address);
            }
            let chosen = self.lower_active(pool, first, second);
            Some(backends[chosen].address)
        } else {
            self.choose_weighted(pool)
        }
    }

    /// P2C comparison on in-flight counts; ties break on a fresh uniform bit.
    fn lower_active(&mut self, pool: &BackendPool, first: usize, second: usize) -> usize {
        let backends = pool.as_slice();
        let active_first = backends[first].active_requests;
        let active_second = backends[second].active_requests;
        if active_first < active_second {
            first
        } else if active_second < active_first {
            second
        } else if self.rng.gen_bool(0.5) {
            first
        } else {
            second
        }
    }

    fn choose_weighted(&mut self, pool: &BackendPool) -> Option<SocketAddr> {
        let backends = pool.as_slice();
        let mut effective = vec![0.0f64; backends.len()];
        let mut eligible = Vec::with_capacity(backends.len());
        let mut total = 0.0f64;

        for (i, backend) in backends.iter().enumerate() {
            if backend.weight == 0 {
                continue;
            }
            let denominator = (f64::from(backend.active_requests) + 1.0).powf(self.bias);
            let weight = if denominator > f64::EPSILON {
                f64::from(backend.weight) / denominator
            } else {
                f64::from(backend.weight)
            };
            effective[i] = weight.max(0.0);
            total += effective[i];
            eligible.push(i);
        }

        if eligible.is_empty() {
            warn!("no backend with positive weight");
            return None;
        }

        // Every effective weight has decayed to nothing; fall back to P2C
        // over the eligible indices.
        if total <= f64::EPSILON {
            if eligible.len() == 1 {
                return Some(backends[eligible[0]].address);
            }
            let (first, second) = pick_two(&mut self.rng, eligible.len());
            if first == second {
                return Some(backends[eligible[first]].address);
            }
            let chosen = self.lower_active(pool, eligible[first], eligible[second]);
            return Some(backends[chosen].address);
        }

        let pick = self.rng.gen_range(0.0..total);
        let mut cumulative = 0.0;
        for &i in &eligible {
            cumulative += effective[i];
            if pick <= cumulative {
                return Some(backends[i].address);
            }
        }
        // Floating point slack can leave the pick marginally past the last
        // cumulative sum.
        eligible.last().map(|&i| backends[i].address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::test_util::{addr, pool, rng};
    use std::collections::HashMap;

    #[test]
    fn test_p2c_prefers_less_loaded() {
        let mut pool = pool(&[1, 1]);
        pool.inc_active(addr(1));
        pool.inc_active(addr(1));
        let mut lr = LeastRequest::new(1.0, rng());
        lr.rebuild(&pool);
        for _ in 0..50 {
            assert_eq!(lr.choose(&pool), Some(addr(2)));
        }
    }

    #[test]
    fn test_p2c_balances_when_idle() {
        let pool = pool(&[1, 1, 1, 1]);
        let mut lr = LeastRequest::new(1.0, rng());
        lr.rebuild(&pool);
        let mut counts: HashMap<SocketAddr, u32> = HashMap::new();
        for _ in 0..4000 {
            *counts.entry(lr.choose(&pool).unwrap()).or_default() += 1;
        }
        for backend in pool.iter() {
            let share = counts[&backend.address] as f64 / 4000.0;
            assert!((share - 0.25).abs() < 0.05, "share {share} for {}", backend.address);
        }
    }

    #[test]
    fn test_weighted_mode_respects_weights() {
        let pool = pool(&[3, 1]);
        let mut lr = LeastRequest::new(1.0, rng());
        lr.rebuild(&pool);
        assert!(!lr.weights_equal);
        let mut heavy = 0;
        for _ in 0..4000 {
            if lr.choose(&pool) == Some(addr(1)) {
                heavy += 1;
            }
        }
        let share = heavy as f64 / 4000.0;
        assert!((share - 0.75).abs() < 0.05, "heavy share {share}");
    }

    #[test]
    fn test_weighted_mode_penalizes_in_flight() {
        let mut pool = pool(&[1, 2]);
        // Load the heavy backend until its effective weight drops below the
        // idle one: 2 / (7 + 1)^1 = 0.25 < 1.
        for _ in 0..7 {
            pool.inc_active(addr(2));
        }
        let mut lr = LeastRequest::new(1.0, rng());
        lr.rebuild(&pool);
        let mut idle = 0;
        for _ in 0..4000 {
            if lr.choose(&pool) == Some(addr(1)) {
                idle += 1;
            }
        }
        let share = idle as f64 / 4000.0;
        assert!((share - 0.8).abs() < 0.05, "idle share {share}");
    }

    #[test]
    fn test_weighted_mode_skips_zero_weight() {
        let pool = pool(&[0, 5]);
        let mut lr = LeastRequest::new(1.0, rng());
        lr.rebuild(&pool);
        for _ in 0..50 {
            assert_eq!(lr.choose(&pool), Some(addr(2)));
        }
    }

    #[test]
    fn test_empty_pool_fails() {
        let pool = pool(&[]);
        let mut lr = LeastRequest::new(1.0, rng());
        lr.rebuild(&pool);
        assert_eq!(lr.choose(&pool), None);
    }
}
