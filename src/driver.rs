//! Scenario wiring: builds the topology from a [`Config`], runs the event
//! loop to the stop time, then shuts the proxy down and collects the report.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::info;

use crate::apps::{ClientApp, ServerApp};
use crate::balance::Balancer;
use crate::config::Config;
use crate::error::Result;
use crate::net::{AppEvent, Network};
use crate::proxy::ProxyEngine;
use crate::report::{BalancerTotals, LatencySummary, RunReport};
use crate::sim::{AppId, Application, Ctx, Event, EventQueue, RngStreams};

const PROXY_APP: AppId = 0;
const SERVER_PORT: u16 = 9000;

/// Address assigned to backend server `index`.
pub fn server_addr(index: usize) -> SocketAddr {
    let ip = Ipv4Addr::new(10, 1, (index / 250) as u8, (index % 250 + 1) as u8);
    SocketAddr::new(IpAddr::V4(ip), SERVER_PORT)
}

fn client_ip(index: usize) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, (index / 250) as u8, (index % 250 + 1) as u8))
}

/// One fully wired simulated run.
///
/// The stepping API (`run_until`, `fail_server`, component accessors) exists
/// so tests can intervene mid-run; [`run_scenario`] is the plain whole-run
/// entry point.
pub struct Simulation {
    queue: EventQueue,
    net: Network,
    proxy: ProxyEngine,
    servers: Vec<ServerApp>,
    clients: Vec<ClientApp>,
    stop_ns: i64,
}

impl Simulation {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let queue = EventQueue::new();
        let net = Network::new(
            config.simulation.link_delay.as_nanos() as i64,
            config.simulation.send_window,
        );
        let streams = RngStreams::new(config.simulation.seed);
        let vip = SocketAddr::new(IpAddr::V4(config.simulation.vip), config.simulation.lb_port);

        let server_count = config.workload.servers as usize;
        let backends: Vec<(SocketAddr, u32)> = (0..server_count)
            .map(|i| (server_addr(i), config.server_weight(i)))
            .collect();

        let mut balancer = Balancer::new(&config.balancer, streams.stream(0), 0);
        balancer.set_backends(&backends, 0);
        let proxy = ProxyEngine::new(vip, balancer);

        let servers: Vec<ServerApp> = (0..server_count)
            .map(|i| ServerApp::new(server_addr(i), config.server_delay(i).as_nanos() as i64))
            .collect();

        let clients: Vec<ClientApp> = (0..config.workload.clients as usize)
            .map(|i| {
                ClientApp::new(
                    client_ip(i),
                    vip,
                    config.workload.request_count,
                    config.workload.request_interval.as_nanos() as i64,
                    config.workload.request_size,
                    streams.stream(100 + i as u64),
                )
            })
            .collect();

        info!(
            clients = clients.len(),
            servers = servers.len(),
            algorithm = ?config.balancer.algorithm,
            %vip,
            "simulation wired"
        );

        Ok(Self {
            queue,
            net,
            proxy,
            servers,
            clients,
            stop_ns: config.simulation.stop_time.as_nanos() as i64,
        })
    }

    /// Brings up the proxy, the servers, and the clients at time zero.
    pub fn start(&mut self) {
        let mut ctx = Ctx { net: &mut self.net, queue: &mut self.queue, app: PROXY_APP };
        self.proxy.start(&mut ctx);

        for (i, server) in self.servers.iter_mut().enumerate() {
            let mut ctx = Ctx { net: &mut self.net, queue: &mut self.queue, app: PROXY_APP + 1 + i };
            server.start(&mut ctx);
        }
        let server_count = self.servers.len();
        for (i, client) in self.clients.iter_mut().enumerate() {
            let mut ctx = Ctx {
                net: &mut self.net,
                queue: &mut self.queue,
                app: PROXY_APP + 1 + server_count + i,
            };
            client.start(&mut ctx);
        }
    }

    /// Processes events up to and including `stop_ns`.
    pub fn run_until(&mut self, stop_ns: i64) {
        while let Some(at) = self.queue.peek_time() {
            if at > stop_ns {
                break;
            }
            let Some((_, event)) = self.queue.pop() else {
                break;
            };
            match event {
                Event::Timer { app, token } => self.dispatch(app, AppEvent::Timer { token }),
                Event::Net(net_event) => {
                    for (app, app_event) in self.net.process(net_event) {
                        self.dispatch(app, app_event);
                    }
                }
            }
        }
    }

    /// Runs to the configured stop time.
    pub fn run(&mut self) {
        let stop = self.stop_ns;
        self.run_until(stop);
    }

    fn dispatch(&mut self, app: AppId, event: AppEvent) {
        let server_count = self.servers.len();
        let mut ctx = Ctx { net: &mut self.net, queue: &mut self.queue, app };
        if app == PROXY_APP {
            self.proxy.handle(&mut ctx, event);
        } else if app <= server_count {
            self.servers[app - 1].handle(&mut ctx, event);
        } else {
            self.clients[app - 1 - server_count].handle(&mut ctx, event);
        }
    }

    /// Fault hook: hard-fails every live connection of backend `index`. The
    /// server keeps listening, so later requests can reconnect.
    pub fn fail_server(&mut self, index: usize) {
        let app = PROXY_APP + 1 + index;
        for socket in self.net.sockets_owned_by(app) {
            self.net.abort(socket, &mut self.queue);
        }
    }

    pub fn now_ns(&self) -> i64 {
        self.queue.now_ns()
    }

    pub fn proxy(&self) -> &ProxyEngine {
        &self.proxy
    }

    pub fn servers(&self) -> &[ServerApp] {
        &self.servers
    }

    pub fn clients(&self) -> &[ClientApp] {
        &self.clients
    }

    /// Shuts the proxy down and assembles the run report.
    pub fn finish(mut self) -> RunReport {
        let mut ctx = Ctx { net: &mut self.net, queue: &mut self.queue, app: PROXY_APP };
        self.proxy.shutdown(&mut ctx);

        let per_client_latencies_ns: Vec<Vec<i64>> =
            self.clients.iter().map(|c| c.latencies_ns().to_vec()).collect();
        let merged: Vec<i64> = per_client_latencies_ns.iter().flatten().copied().collect();
        let balancer = self.proxy.balancer();

        RunReport {
            requests_sent: self.clients.iter().map(|c| u64::from(c.requests_sent())).sum(),
            responses: self.clients.iter().map(|c| c.responses()).sum(),
            echo_mismatches: self.clients.iter().map(|c| c.echo_mismatches()).sum(),
            latency: LatencySummary::from_samples(&merged),
            per_client_latencies_ns,
            per_server: self.servers.iter().map(|s| (s.addr(), s.served())).collect(),
            proxy: self.proxy.counters(),
            balancer: BalancerTotals {
                sent: balancer.sent_total(),
                finished: balancer.finished_total(),
                residual_active: balancer.pool().total_active(),
            },
        }
    }
}

/// Runs a whole scenario from configuration to report.
pub fn run_scenario(config: &Config) -> Result<RunReport> {
    let mut sim = Simulation::new(config)?;
    sim.start();
    sim.run();
    Ok(sim.finish())
}
