use std::net::SocketAddr;

use rand::rngs::SmallRng;
use rand::Rng;
use tracing::warn;

use crate::proxy::backend::BackendPool;

/// Uniform random selection. Ignores weights and in-flight counts.
#[derive(Debug)]
pub struct Random {
    rng: SmallRng,
}

impl Random {
    pub fn new(rng: SmallRng) -> Self {
        Self { rng }
    }

    pub fn choose(&mut self, pool: &BackendPool) -> Option<SocketAddr> {
        let backends = pool.as_slice();
        if backends.is_empty() {
            warn!("no backends available");
            return None;
        }
        let index = self.rng.gen_range(0..backends.len());
        Some(backends[index].address)
    }
}
