use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::Rng;
use tracing::{debug, error, info, warn};

use super::hash64;
use crate::proxy::backend::BackendPool;

/// Maglev permutation-table hashing.
///
/// Each positive-weight backend derives an `(offset, skip)` permutation of the
/// table slots from its address; backends take turns claiming their next free
/// slot, with a running score giving heavier backends proportionally more
/// turns. Lookup is a single modulo into the finished table.
#[derive(Debug)]
pub struct Maglev {
    table_size: u64,
    table: Vec<Option<SocketAddr>>,
    built: bool,
    rng: SmallRng,
}

struct BuildEntry {
    address: SocketAddr,
    weight: u32,
    offset: u64,
    skip: u64,
    next: u64,
    score: f64,
    claimed: u64,
}

impl Maglev {
    pub fn new(table_size: u64, rng: SmallRng) -> Self {
        Self { table_size, table: Vec::new(), built: false, rng }
    }

    /// Rebuilds the lookup table; called on every backend-set change.
    pub fn rebuild(&mut self, pool: &BackendPool) {
        self.built = false;
        self.table.clear();

        if pool.is_empty() {
            warn!("no backends available, lookup table not built");
            return;
        }
        if !is_prime(self.table_size) {
            warn!(
                table_size = self.table_size,
                "table size is not prime; slot distribution will be less even"
            );
        }

        let mut entries = Vec::with_capacity(pool.len());
        let mut max_weight = 0u32;
        for backend in pool.iter() {
            if backend.weight == 0 {
                debug!(address = %backend.address, "skipping zero-weight backend");
                continue;
            }
            max_weight = max_weight.max(backend.weight);
            let base = backend.address.to_string();
            let offset = hash64(&base) % self.table_size;
            let skip = if self.table_size > 1 {
                hash64(&format!("{base}_skip")) % (self.table_size - 1) + 1
            } else {
                1
            };
            entries.push(BuildEntry {
                address: backend.address,
                weight: backend.weight,
                offset,
                skip,
                next: 0,
                score: 0.0,
                claimed: 0,
            });
        }

        if entries.is_empty() {
            warn!("no backend with positive weight, lookup table not built");
            return;
        }
        if entries.len() as u64 > self.table_size {
            warn!(
                backends = entries.len(),
                table_size = self.table_size,
                "more backends than table slots; some backends will get none"
            );
        }

        // Deterministic fill order regardless of registry order.
        entries.sort_by(|a, b| {
            (a.offset, a.skip, a.address.to_string()).cmp(&(b.offset, b.skip, b.address.to_string()))
        });

        let size = self.table_size as usize;
        self.table = vec![None; size];
        let mut filled = 0u64;
        let mut pass = 1u64;

        'fill: while filled < self.table_size {
            for entry in entries.iter_mut() {
                // Weighted turn-taking: a backend skips this pass while its
                // accumulated score is ahead of pass * weight.
                if (pass as f64) * f64::from(entry.weight) < entry.score {
                    continue;
                }
                entry.score += f64::from(max_weight);

                let mut slot = ((entry.offset + entry.skip.wrapping_mul(entry.next))
                    % self.table_size) as usize;
                while self.table[slot].is_some() {
                    entry.next += 1;
                    slot = ((entry.offset + entry.skip.wrapping_mul(entry.next))
                        % self.table_size) as usize;
                }
                self.table[slot] = Some(entry.address);
                entry.next += 1;
                entry.claimed += 1;
                filled += 1;
                if filled == self.table_size {
                    break 'fill;
                }
            }
            pass += 1;
            if pass > self.table_size * 2 {
                error!(
                    pass,
                    filled,
                    table_size = self.table_size,
                    "table fill exceeded the pass budget; invalidating table"
                );
                self.table.clear();
                return;
            }
        }

        let min_claimed = entries.iter().map(|e| e.claimed).min().unwrap_or(0);
        let max_claimed = entries.iter().map(|e| e.claimed).max().unwrap_or(0);
        info!(
            table_size = self.table_size,
            backends = entries.len(),
            min_slots = min_claimed,
            max_slots = max_claimed,
            "maglev table built"
        );
        self.built = true;
    }

    pub fn choose(&mut self, pool: &BackendPool, l7_id: u64) -> Option<SocketAddr> {
        if !self.built || self.table.is_empty() {
            // Degraded mode: pick pseudorandomly among positive-weight
            // backends until the table can be built.
            let eligible: Vec<_> =
                pool.iter().filter(|b| b.weight > 0).map(|b| b.address).collect();
            if eligible.is_empty() {
                warn!("lookup table not built and no eligible fallback backend");
                return None;
            }
            warn!("lookup table not built, falling back to a random backend");
            return Some(eligible[self.rng.gen_range(0..eligible.len())]);
        }

        let request_hash = hash64(&l7_id.to_string());
        let index = (request_hash % self.table_size) as usize;
        match self.table[index] {
            Some(address) => Some(address),
            None => {
                error!(index, "lookup table slot is unassigned; table build was inconsistent");
                None
            }
        }
    }
}

fn is_prime(n: u64) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5u64;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::test_util::{addr, pool, rng};
    use std::collections::HashMap;

    fn slot_counts(maglev: &Maglev) -> HashMap<SocketAddr, u64> {
        let mut counts = HashMap::new();
        for slot in maglev.table.iter().flatten() {
            *counts.entry(*slot).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_is_prime() {
        assert!(is_prime(2));
        assert!(is_prime(65537));
        assert!(is_prime(251));
        assert!(!is_prime(1));
        assert!(!is_prime(65536));
    }

    #[test]
    fn test_equal_weights_fill_evenly() {
        // 10 backends into a prime table: slot counts differ by at most 1.
        let pool = pool(&[1; 10]);
        let mut maglev = Maglev::new(251, rng());
        maglev.rebuild(&pool);
        assert!(maglev.built);
        let counts = slot_counts(&maglev);
        assert_eq!(counts.len(), 10);
        let min = counts.values().min().unwrap();
        let max = counts.values().max().unwrap();
        assert!(max - min <= 1, "min={min} max={max}");
    }

    #[test]
    fn test_weights_skew_slot_shares() {
        let pool = pool(&[3, 1]);
        let mut maglev = Maglev::new(251, rng());
        maglev.rebuild(&pool);
        let counts = slot_counts(&maglev);
        let heavy = counts[&addr(1)] as f64;
        let light = counts[&addr(2)] as f64;
        let ratio = heavy / light;
        assert!((ratio - 3.0).abs() < 0.5, "ratio {ratio}");
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let pool = pool(&[1, 1, 1]);
        let mut maglev = Maglev::new(251, rng());
        maglev.rebuild(&pool);
        for id in [0u64, 5, 1234, u64::MAX] {
            let first = maglev.choose(&pool, id);
            assert!(first.is_some());
            assert_eq!(maglev.choose(&pool, id), first);
        }
    }

    #[test]
    fn test_removing_one_backend_bounds_disruption() {
        let before_pool = pool(&[1, 1, 1, 1, 1]);
        let mut maglev = Maglev::new(251, rng());
        maglev.rebuild(&before_pool);
        let before = maglev.table.clone();

        let after_pool = pool(&[1, 1, 1, 1]);
        maglev.rebuild(&after_pool);
        let after = maglev.table.clone();

        let changed = before
            .iter()
            .zip(&after)
            .filter(|(b, a)| b != a)
            .count() as f64;
        // The removed backend held ~T/5 slots; other movement stays small.
        assert!(changed / 251.0 < 0.45, "changed fraction {}", changed / 251.0);
    }

    #[test]
    fn test_unbuilt_table_falls_back_to_eligible_backend() {
        let pool = pool(&[0, 1]);
        let mut maglev = Maglev::new(251, rng());
        // Never rebuilt: table is unbuilt, only the positive-weight backend
        // can be handed out.
        for _ in 0..20 {
            assert_eq!(maglev.choose(&pool, 9), Some(addr(2)));
        }
    }

    #[test]
    fn test_all_zero_weights_cannot_build() {
        let pool = pool(&[0, 0]);
        let mut maglev = Maglev::new(251, rng());
        maglev.rebuild(&pool);
        assert!(!maglev.built);
        assert_eq!(maglev.choose(&pool, 1), None);
    }
}
