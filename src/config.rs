use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::Result as LbResult;

/// Main scenario configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub simulation: SimulationConfig,
    pub workload: WorkloadConfig,
    pub balancer: BalancerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Virtual time at which the run stops.
    #[serde(with = "duration_serde")]
    pub stop_time: Duration,
    /// Base seed for every random stream in the run.
    pub seed: u64,
    /// One-way delay of every simulated link.
    #[serde(with = "duration_serde")]
    pub link_delay: Duration,
    /// Per-socket transmit window in bytes; sends beyond it report short and
    /// trigger backpressure.
    pub send_window: usize,
    /// Virtual IP the balancer listens on.
    pub vip: Ipv4Addr,
    /// Port the balancer listens on.
    pub lb_port: u16,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            stop_time: Duration::from_secs(15),
            seed: 1,
            link_delay: Duration::ZERO,
            send_window: 64 * 1024,
            vip: Ipv4Addr::new(10, 255, 0, 1),
            lb_port: 80,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Number of client nodes.
    pub clients: u32,
    /// Number of backend server nodes.
    pub servers: u32,
    /// Requests each client sends.
    pub request_count: u32,
    /// Interval between a client's requests.
    #[serde(with = "duration_serde")]
    pub request_interval: Duration,
    /// Payload size of each request in bytes.
    pub request_size: u32,
    /// Per-server weights; missing entries default to 1.
    pub weights: Vec<u32>,
    /// Per-server processing delays; missing entries default to zero.
    #[serde(with = "duration_vec_serde")]
    pub server_delays: Vec<Duration>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            clients: 10,
            servers: 10,
            request_count: 100,
            request_interval: Duration::from_millis(100),
            request_size: 64,
            weights: Vec::new(),
            server_delays: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    LeastRequest,
    Random,
    RingHash,
    Maglev,
    PeakEwma,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub algorithm: Algorithm,
    /// Least-request: penalty exponent applied to in-flight counts (>= 0).
    pub active_request_bias: f64,
    /// Ring hash: bounds on the number of virtual nodes.
    pub min_ring_size: u64,
    pub max_ring_size: u64,
    /// Ring hash: baseline virtual nodes per positive-weight backend.
    pub hashes_per_host: u32,
    /// Maglev: lookup table size, prime recommended.
    pub table_size: u64,
    /// Peak-EWMA: latency decay window (>= 1ms).
    #[serde(with = "duration_serde")]
    pub decay_time: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            active_request_bias: 1.0,
            min_ring_size: 1024,
            max_ring_size: 8 * 1024 * 1024,
            hashes_per_host: 100,
            table_size: 65537,
            decay_time: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> LbResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate simulation config
        if self.simulation.lb_port == 0 {
            anyhow::bail!("Balancer port cannot be zero");
        }
        if self.simulation.send_window == 0 {
            anyhow::bail!("Send window cannot be zero");
        }

        // Validate workload config
        if self.workload.clients == 0 {
            anyhow::bail!("Client count cannot be zero");
        }
        if self.workload.servers == 0 {
            anyhow::bail!("Server count cannot be zero");
        }
        if self.workload.request_count > 1 && self.workload.request_interval.is_zero() {
            anyhow::bail!("Request interval cannot be zero when sending multiple requests");
        }
        if self.workload.weights.len() > self.workload.servers as usize {
            anyhow::bail!(
                "Weights list ({}) is longer than the server count ({})",
                self.workload.weights.len(),
                self.workload.servers
            );
        }
        if self.workload.server_delays.len() > self.workload.servers as usize {
            anyhow::bail!(
                "Server delays list ({}) is longer than the server count ({})",
                self.workload.server_delays.len(),
                self.workload.servers
            );
        }

        // Validate balancer config
        if !(self.balancer.active_request_bias >= 0.0 && self.balancer.active_request_bias.is_finite())
        {
            anyhow::bail!("active_request_bias must be finite and >= 0");
        }
        if self.balancer.min_ring_size == 0 || self.balancer.max_ring_size == 0 {
            anyhow::bail!("Ring sizes must be at least 1");
        }
        if self.balancer.min_ring_size > self.balancer.max_ring_size {
            anyhow::bail!(
                "min_ring_size ({}) cannot exceed max_ring_size ({})",
                self.balancer.min_ring_size,
                self.balancer.max_ring_size
            );
        }
        if self.balancer.table_size == 0 {
            anyhow::bail!("Maglev table_size must be at least 1");
        }
        if self.balancer.decay_time < Duration::from_millis(1) {
            anyhow::bail!("decay_time must be at least 1ms");
        }

        Ok(())
    }

    /// Weight of server `index`, defaulting to 1 past the configured list.
    pub fn server_weight(&self, index: usize) -> u32 {
        self.workload.weights.get(index).copied().unwrap_or(1)
    }

    /// Processing delay of server `index`, defaulting to zero past the
    /// configured list.
    pub fn server_delay(&self, index: usize) -> Duration {
        self.workload.server_delays.get(index).copied().unwrap_or(Duration::ZERO)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod duration_vec_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(durations.iter().map(super::format_duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = Vec::<String>::deserialize(deserializer)?;
        entries
            .iter()
            .map(|s| super::parse_duration(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

fn format_duration(duration: &Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 || nanos % 1_000_000_000 == 0 {
        format!("{}s", duration.as_secs())
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", duration.as_millis())
    } else if nanos % 1_000 == 0 {
        format!("{}us", duration.as_micros())
    } else {
        format!("{}ns", nanos)
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (number, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("Invalid duration value: '{}'", s))?;
    if !(value >= 0.0 && value.is_finite()) {
        return Err(format!("Duration must be non-negative and finite: '{}'", s));
    }
    let nanos = match unit {
        "ns" => value,
        "us" => value * 1e3,
        "ms" => value * 1e6,
        "s" => value * 1e9,
        "m" => value * 60.0 * 1e9,
        "h" => value * 3600.0 * 1e9,
        _ => return Err(format!("Unknown duration unit: '{}'", unit)),
    };
    Ok(Duration::from_nanos(nanos.round() as u64))
}
