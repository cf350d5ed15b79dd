//! End-to-end scenarios: whole simulated runs through the proxy engine,
//! checking latency behavior, per-backend shares, and in-flight accounting.

use std::time::Duration;

use l7lb::config::{Algorithm, Config};
use l7lb::driver::{run_scenario, server_addr, Simulation};
use l7lb::report::RunReport;

const MS: i64 = 1_000_000;

fn base_config(algorithm: Algorithm) -> Config {
    let mut config = Config::default();
    config.balancer.algorithm = algorithm;
    config.simulation.seed = 11;
    config
}

fn assert_balanced_accounting(report: &RunReport) {
    assert_eq!(
        report.balancer.sent, report.balancer.finished,
        "every notify_sent must be matched by exactly one notify_finished"
    );
    assert_eq!(report.balancer.residual_active, 0, "in-flight counts must drain to zero");
}

#[test]
fn test_single_backend_hundred_requests_peak_ewma() {
    let mut config = base_config(Algorithm::PeakEwma);
    config.workload.clients = 1;
    config.workload.servers = 1;
    config.workload.request_count = 100;
    config.workload.server_delays = vec![Duration::from_millis(5)];

    let report = run_scenario(&config).unwrap();

    assert_eq!(report.requests_sent, 100);
    assert_eq!(report.responses, 100);
    assert_eq!(report.echo_mismatches, 0);
    assert_eq!(report.per_server[0].1, 100);
    // The only delay in the path is the 5ms processing time.
    assert!(report.latency.min_ns >= 5 * MS, "min {}ns", report.latency.min_ns);
    assert!(report.latency.min_ns < 6 * MS, "min {}ns", report.latency.min_ns);
    assert!(report.latency.p50_ns < 6 * MS, "p50 {}ns", report.latency.p50_ns);
    assert_balanced_accounting(&report);
}

/// Ten backends, one of them ten times slower. Peak-EWMA should starve the
/// slow backend after warm-up and keep the mean close to the fast tier.
fn slow_backend_config(algorithm: Algorithm) -> Config {
    let mut config = base_config(algorithm);
    config.workload.clients = 10;
    config.workload.servers = 10;
    config.workload.request_count = 100;
    config.workload.request_interval = Duration::from_millis(100);
    config.workload.server_delays = vec![
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(5),
        Duration::from_millis(50),
    ];
    config
}

#[test]
fn test_peak_ewma_starves_the_slow_backend() {
    let report = run_scenario(&slow_backend_config(Algorithm::PeakEwma)).unwrap();

    assert_eq!(report.responses, 1000);
    assert_eq!(report.echo_mismatches, 0);
    let slow_share = report.per_server[9].1;
    // A fair split would give the slow backend 100 requests.
    assert!(slow_share < 60, "slow backend served {slow_share} of 1000");
    assert!(
        report.latency.mean_ns < 8 * MS,
        "mean {}ns should approach the fast tier",
        report.latency.mean_ns
    );
    assert_balanced_accounting(&report);
}

#[test]
fn test_wrr_splits_evenly_and_pays_for_the_slow_backend() {
    let report = run_scenario(&slow_backend_config(Algorithm::RoundRobin)).unwrap();

    assert_eq!(report.responses, 1000);
    // Equal weights: the deterministic marker walk gives everyone the same
    // share, slow backend included.
    for (address, served) in &report.per_server {
        assert!(
            (90..=110).contains(served),
            "backend {address} served {served}, expected about 100"
        );
    }
    // 10% of requests hit the 50ms backend: mean sits near 9.5ms.
    assert!(
        report.latency.mean_ns > 8 * MS,
        "mean {}ns should show the slow tier's cost",
        report.latency.mean_ns
    );
    assert_balanced_accounting(&report);

    let ewma = run_scenario(&slow_backend_config(Algorithm::PeakEwma)).unwrap();
    assert!(
        ewma.latency.mean_ns < report.latency.mean_ns,
        "peak ewma ({}ns) should beat wrr ({}ns) on the same workload",
        ewma.latency.mean_ns,
        report.latency.mean_ns
    );
}

#[test]
fn test_universal_properties_hold_for_every_algorithm() {
    for algorithm in [
        Algorithm::RoundRobin,
        Algorithm::LeastRequest,
        Algorithm::Random,
        Algorithm::RingHash,
        Algorithm::Maglev,
        Algorithm::PeakEwma,
    ] {
        let mut config = slow_backend_config(algorithm);
        config.workload.clients = 4;
        config.workload.request_count = 50;
        let report = run_scenario(&config).unwrap();

        assert_eq!(report.requests_sent, 200, "{algorithm:?}");
        assert_eq!(report.responses, 200, "{algorithm:?}: no request may be lost");
        assert_eq!(report.echo_mismatches, 0, "{algorithm:?}: headers must echo intact");
        assert_eq!(report.proxy.requests, 200, "{algorithm:?}");
        assert_eq!(report.proxy.forwarded, 200, "{algorithm:?}");
        assert_eq!(report.proxy.dropped, 0, "{algorithm:?}");
        assert_balanced_accounting(&report);
    }
}

#[test]
fn test_hash_policies_pin_request_keys_to_backends() {
    for algorithm in [Algorithm::RingHash, Algorithm::Maglev] {
        let mut config = base_config(algorithm);
        config.workload.clients = 3;
        config.workload.servers = 5;
        config.workload.request_count = 60;
        config.workload.request_interval = Duration::from_millis(10);
        config.workload.server_delays = vec![Duration::from_millis(2); 5];

        let report = run_scenario(&config).unwrap();
        assert_eq!(report.responses, 180, "{algorithm:?}");
        // Uniform random keys across 180 requests reach several backends.
        let nonempty = report.per_server.iter().filter(|(_, served)| *served > 0).count();
        assert!(nonempty >= 3, "{algorithm:?}: only {nonempty} backends used");
        assert_balanced_accounting(&report);
    }
}

#[test]
fn test_backend_killed_mid_run_settles_accounting_and_reconnects() {
    let mut config = base_config(Algorithm::LeastRequest);
    config.workload.clients = 1;
    config.workload.servers = 1;
    config.workload.request_count = 50;
    config.workload.request_interval = Duration::from_millis(20);
    // Processing is slow enough that several requests pile up in flight.
    config.workload.server_delays = vec![Duration::from_millis(200)];
    config.simulation.stop_time = Duration::from_secs(10);

    let mut sim = Simulation::new(&config).unwrap();
    sim.start();

    // Requests go out at 0, 20, ..., 80ms; none are answered before 200ms.
    sim.run_until(90 * MS);
    let backend = server_addr(0);
    let active = sim.proxy().balancer().pool().get(backend).unwrap().active_requests;
    assert_eq!(active, 5, "five requests should be in flight");

    // Kill the backend's sockets; the listener stays up.
    sim.fail_server(0);
    sim.run_until(95 * MS);
    let active = sim.proxy().balancer().pool().get(backend).unwrap().active_requests;
    assert_eq!(active, 0, "failure must drain the in-flight count");
    let served_at_failure = sim.servers()[0].served();

    // The next request reconnects and the backend serves again.
    sim.run_until(10_000 * MS);
    assert!(
        sim.servers()[0].served() > served_at_failure,
        "backend should serve requests on a fresh connection"
    );
    assert!(sim.clients()[0].responses() > 0);

    let report = sim.finish();
    // The five killed requests never produced responses.
    assert_eq!(report.responses, report.requests_sent - 5);
    assert_balanced_accounting(&report);
}

#[test]
fn test_backpressure_survives_tiny_send_windows() {
    let mut config = base_config(Algorithm::RoundRobin);
    config.workload.clients = 2;
    config.workload.servers = 2;
    config.workload.request_count = 20;
    config.workload.request_interval = Duration::from_millis(10);
    config.workload.request_size = 2048;
    config.workload.server_delays = vec![Duration::from_millis(1); 2];
    config.simulation.send_window = 512;
    config.simulation.link_delay = Duration::from_micros(50);

    let report = run_scenario(&config).unwrap();
    // Short sends pause and resume reads, but nothing is lost or reordered.
    assert_eq!(report.responses, 40);
    assert_eq!(report.echo_mismatches, 0);
    assert_balanced_accounting(&report);
}

#[test]
fn test_fixed_seed_replays_identically() {
    let config = slow_backend_config(Algorithm::PeakEwma);
    let first = run_scenario(&config).unwrap();
    let second = run_scenario(&config).unwrap();
    assert_eq!(first.per_server, second.per_server);
    assert_eq!(first.latency.mean_ns, second.latency.mean_ns);
    assert_eq!(first.balancer.sent, second.balancer.sent);
}
