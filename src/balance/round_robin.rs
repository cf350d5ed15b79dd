use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::proxy::backend::BackendPool;

/// Nginx-style smooth weighted round-robin.
///
/// Walks the backend list with a sliding weight marker so that a backend of
/// weight `w` receives `w` picks per `max_weight / gcd_weight` cycle without
/// bursting them back to back.
#[derive(Debug, Default)]
pub struct RoundRobin {
    index: usize,
    current_weight: i64,
    max_weight: u32,
    gcd_weight: u32,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the weight markers; called on every backend-set change.
    pub fn rebuild(&mut self, pool: &BackendPool) {
        if pool.is_empty() {
            *self = Self::new();
            debug!("round robin state reset, no backends");
            return;
        }

        let mut max_weight = 0u32;
        let mut gcd_weight = 0u32;
        let mut positive = 0u32;
        for backend in pool.iter() {
            if backend.weight > 0 {
                positive += 1;
                max_weight = max_weight.max(backend.weight);
                gcd_weight =
                    if gcd_weight == 0 { backend.weight } else { gcd(gcd_weight, backend.weight) };
            }
        }

        if positive == 0 {
            warn!("all backends have zero weight");
            max_weight = 0;
            gcd_weight = 0;
        } else if gcd_weight == 0 {
            // Cannot happen with positive weights present; keep the selection
            // loop safe anyway.
            warn!("gcd computed as zero despite positive weights, falling back to 1");
            gcd_weight = 1;
        }

        self.max_weight = max_weight;
        self.gcd_weight = gcd_weight;
        // Start one before the first backend so the next pick lands on it.
        self.index = pool.len() - 1;
        self.current_weight = 0;
        debug!(max_weight, gcd_weight, backends = pool.len(), positive, "round robin state rebuilt");
    }

    pub fn choose(&mut self, pool: &BackendPool) -> Option<SocketAddr> {
        if pool.is_empty() {
            warn!("no backends available");
            return None;
        }

        if self.max_weight == 0 {
            // All weights are zero. Handing out the first backend anyway is
            // questionable for a weighted algorithm, but it keeps a lone
            // misconfigured backend reachable.
            warn!("no backend with positive weight, falling back to the first backend");
            return Some(pool.as_slice()[0].address);
        }

        let backends = pool.as_slice();
        loop {
            self.index = (self.index + 1) % backends.len();
            if self.index == 0 {
                self.current_weight -= i64::from(self.gcd_weight);
                if self.current_weight <= 0 {
                    self.current_weight = i64::from(self.max_weight);
                }
            }
            let backend = &backends[self.index];
            if backend.weight > 0 && i64::from(backend.weight) >= self.current_weight {
                return Some(backend.address);
            }
        }
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::test_util::{addr, pool};
    use std::collections::HashMap;

    fn take(rr: &mut RoundRobin, pool: &BackendPool, n: usize) -> Vec<SocketAddr> {
        (0..n).map(|_| rr.choose(pool).unwrap()).collect()
    }

    #[test]
    fn test_equal_weights_cycle_in_order() {
        let pool = pool(&[1, 1, 1]);
        let mut rr = RoundRobin::new();
        rr.rebuild(&pool);
        let picks = take(&mut rr, &pool, 6);
        assert_eq!(picks, vec![addr(1), addr(2), addr(3), addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn test_weighted_shares_match_weights() {
        let pool = pool(&[5, 1, 1]);
        let mut rr = RoundRobin::new();
        rr.rebuild(&pool);
        let mut counts: HashMap<SocketAddr, u32> = HashMap::new();
        // Ten full cycles of sum(weights) picks.
        for pick in take(&mut rr, &pool, 70) {
            *counts.entry(pick).or_default() += 1;
        }
        assert_eq!(counts[&addr(1)], 50);
        assert_eq!(counts[&addr(2)], 10);
        assert_eq!(counts[&addr(3)], 10);
    }

    #[test]
    fn test_marker_walk_sequence() {
        let pool = pool(&[2, 1, 1]);
        let mut rr = RoundRobin::new();
        rr.rebuild(&pool);
        // The marker starts at max_weight, so the heavy backend is drained
        // first, then the others as the marker steps down by the gcd.
        let picks = take(&mut rr, &pool, 8);
        let cycle = vec![addr(1), addr(1), addr(2), addr(3)];
        assert_eq!(picks[..4], cycle[..]);
        assert_eq!(picks[4..], cycle[..]);
    }

    #[test]
    fn test_zero_weight_backends_are_skipped() {
        let pool = pool(&[1, 0, 1]);
        let mut rr = RoundRobin::new();
        rr.rebuild(&pool);
        for pick in take(&mut rr, &pool, 10) {
            assert_ne!(pick, addr(2));
        }
    }

    #[test]
    fn test_all_zero_weights_falls_back_to_first() {
        let pool = pool(&[0, 0]);
        let mut rr = RoundRobin::new();
        rr.rebuild(&pool);
        assert_eq!(rr.choose(&pool), Some(addr(1)));
    }

    #[test]
    fn test_empty_pool_fails() {
        let pool = pool(&[]);
        let mut rr = RoundRobin::new();
        rr.rebuild(&pool);
        assert_eq!(rr.choose(&pool), None);
    }
}
