use std::net::SocketAddr;

use tracing::info;

use crate::proxy::ProxyCounters;

/// Order statistics over a set of round-trip samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySummary {
    pub count: usize,
    pub min_ns: i64,
    pub mean_ns: i64,
    pub p50_ns: i64,
    pub p99_ns: i64,
    pub max_ns: i64,
}

impl LatencySummary {
    pub fn from_samples(samples: &[i64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let sum: i128 = sorted.iter().map(|&v| i128::from(v)).sum();
        Self {
            count: sorted.len(),
            min_ns: sorted[0],
            mean_ns: (sum / sorted.len() as i128) as i64,
            p50_ns: percentile(&sorted, 0.50),
            p99_ns: percentile(&sorted, 0.99),
            max_ns: *sorted.last().unwrap(),
        }
    }
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[i64], q: f64) -> i64 {
    let rank = (q * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Selector accounting after shutdown.
#[derive(Debug, Clone, Copy)]
pub struct BalancerTotals {
    /// notify_sent calls over the run.
    pub sent: u64,
    /// notify_finished calls over the run.
    pub finished: u64,
    /// Sum of in-flight counts left in the registry; zero after a clean run.
    pub residual_active: u64,
}

/// Everything a finished run reports back to the driver and the test suite.
#[derive(Debug)]
pub struct RunReport {
    pub requests_sent: u64,
    pub responses: u64,
    pub echo_mismatches: u64,
    pub latency: LatencySummary,
    pub per_client_latencies_ns: Vec<Vec<i64>>,
    pub per_server: Vec<(SocketAddr, u64)>,
    pub proxy: ProxyCounters,
    pub balancer: BalancerTotals,
}

impl RunReport {
    pub fn log_summary(&self) {
        info!(
            requests = self.requests_sent,
            responses = self.responses,
            echo_mismatches = self.echo_mismatches,
            "client totals"
        );
        info!(
            count = self.latency.count,
            min_ms = %format_ms(self.latency.min_ns),
            mean_ms = %format_ms(self.latency.mean_ns),
            p50_ms = %format_ms(self.latency.p50_ns),
            p99_ms = %format_ms(self.latency.p99_ns),
            max_ms = %format_ms(self.latency.max_ns),
            "client latency"
        );
        for (address, served) in &self.per_server {
            info!(%address, served, "backend share");
        }
        info!(
            connections = self.proxy.connections,
            requests = self.proxy.requests,
            forwarded = self.proxy.forwarded,
            responses = self.proxy.responses,
            dropped = self.proxy.dropped,
            "proxy counters"
        );
        info!(
            sent = self.balancer.sent,
            finished = self.balancer.finished,
            residual_active = self.balancer.residual_active,
            "balancer accounting"
        );
    }
}

fn format_ms(ns: i64) -> String {
    format!("{:.3}", ns as f64 / 1e6)
}
