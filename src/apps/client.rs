use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use rand::rngs::SmallRng;
use rand::Rng;
use tracing::{debug, warn};

use crate::frame::{FrameBuffer, FrameHeader};
use crate::net::{AppEvent, SocketId};
use crate::sim::{Application, Ctx};

const TOKEN_SEND: u64 = 0;

/// Latency-measuring request generator.
///
/// Connects to the balancer, then sends a fixed number of framed requests at
/// a fixed interval. Each request carries a fresh uniform L7 identifier and
/// the send timestamp; responses are matched by sequence number and checked
/// for an exact header echo.
#[derive(Debug)]
pub struct ClientApp {
    local_ip: IpAddr,
    vip: SocketAddr,
    request_count: u32,
    interval_ns: i64,
    request_size: u32,
    rng: SmallRng,

    socket: Option<SocketId>,
    next_seq: u32,
    sent: HashMap<u32, (i64, u64)>,
    rx: FrameBuffer,

    latencies_ns: Vec<i64>,
    responses: u64,
    echo_mismatches: u64,
    failed: bool,
}

impl ClientApp {
    pub fn new(
        local_ip: IpAddr,
        vip: SocketAddr,
        request_count: u32,
        interval_ns: i64,
        request_size: u32,
        rng: SmallRng,
    ) -> Self {
        Self {
            local_ip,
            vip,
            request_count,
            interval_ns,
            request_size,
            rng,
            socket: None,
            next_seq: 0,
            sent: HashMap::new(),
            rx: FrameBuffer::new(),
            latencies_ns: Vec::new(),
            responses: 0,
            echo_mismatches: 0,
            failed: false,
        }
    }

    /// Starts the connect; requests flow once it completes.
    pub fn start(&mut self, ctx: &mut Ctx<'_>) {
        if self.request_count == 0 {
            return;
        }
        self.socket = Some(ctx.net.connect(ctx.app, self.local_ip, self.vip, ctx.queue));
    }

    fn send_request(&mut self, ctx: &mut Ctx<'_>) {
        let Some(socket) = self.socket else {
            return;
        };
        if !ctx.net.is_ok(socket) {
            warn!(socket = %socket, "cannot send request, connection is down");
            self.failed = true;
            return;
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let l7_id: u64 = self.rng.gen();
        let now = ctx.now_ns();
        let header = FrameHeader {
            seq,
            timestamp_ns: now,
            payload_len: self.request_size,
            l7_id,
        };
        let payload = vec![0u8; self.request_size as usize];
        self.sent.insert(seq, (now, l7_id));
        debug!(seq, l7_id, "sending request");
        let sent = ctx.net.send(socket, header.to_frame(&payload), ctx.queue);
        if sent < 0 {
            warn!(socket = %socket, seq, "request send failed");
        }

        if seq < self.request_count {
            ctx.schedule(self.interval_ns, TOKEN_SEND);
        }
    }

    fn on_readable(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        while let Some(chunk) = ctx.net.recv(socket) {
            self.rx.extend(&chunk);
        }
        while let Some((header, _)) = self.rx.next_frame() {
            let now = ctx.now_ns();
            self.responses += 1;
            match self.sent.remove(&header.seq) {
                Some((sent_at, l7_id)) => {
                    self.latencies_ns.push(now - sent_at);
                    // The response must carry the request header back intact.
                    if header.l7_id != l7_id || header.timestamp_ns != sent_at {
                        warn!(seq = header.seq, "response header does not echo the request");
                        self.echo_mismatches += 1;
                    }
                }
                None => {
                    warn!(seq = header.seq, "response for unknown sequence number");
                    self.echo_mismatches += 1;
                }
            }
        }
    }

    /// Round trips observed at the client, in nanoseconds.
    pub fn latencies_ns(&self) -> &[i64] {
        &self.latencies_ns
    }

    pub fn responses(&self) -> u64 {
        self.responses
    }

    pub fn requests_sent(&self) -> u32 {
        self.next_seq
    }

    pub fn echo_mismatches(&self) -> u64 {
        self.echo_mismatches
    }

    pub fn failed(&self) -> bool {
        self.failed
    }
}

impl Application for ClientApp {
    fn handle(&mut self, ctx: &mut Ctx<'_>, event: AppEvent) {
        match event {
            AppEvent::ConnectOk { .. } => self.send_request(ctx),
            AppEvent::ConnectFail { socket } => {
                warn!(socket = %socket, vip = %self.vip, "connect to balancer failed");
                self.failed = true;
            }
            AppEvent::Timer { token: TOKEN_SEND } => self.send_request(ctx),
            AppEvent::Readable { socket } => self.on_readable(ctx, socket),
            AppEvent::PeerClosed { socket } | AppEvent::Failed { socket, .. } => {
                warn!(socket = %socket, "connection to balancer lost");
                self.failed = true;
            }
            _ => {}
        }
    }
}
