use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::frame::{FrameBuffer, FrameHeader};
use crate::net::{AppEvent, SocketId};
use crate::sim::{Application, Ctx};

/// Echo server with a configurable processing delay.
///
/// Reassembles framed requests and answers each one after `delay_ns` with the
/// request header and an empty payload, the wire contract clients and the
/// balancer rely on for round-trip measurement.
#[derive(Debug)]
pub struct ServerApp {
    addr: SocketAddr,
    delay_ns: i64,
    rx: HashMap<SocketId, FrameBuffer>,
    deferred: HashMap<u64, (SocketId, FrameHeader)>,
    next_token: u64,
    served: u64,
}

impl ServerApp {
    pub fn new(addr: SocketAddr, delay_ns: i64) -> Self {
        Self {
            addr,
            delay_ns,
            rx: HashMap::new(),
            deferred: HashMap::new(),
            next_token: 0,
            served: 0,
        }
    }

    pub fn start(&mut self, ctx: &mut Ctx<'_>) {
        ctx.net.listen(self.addr, ctx.app);
        info!(addr = %self.addr, delay_ns = self.delay_ns, "server listening");
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests this server has accepted for processing.
    pub fn served(&self) -> u64 {
        self.served
    }

    fn on_readable(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        let Some(buffer) = self.rx.get_mut(&socket) else {
            debug!(socket = %socket, "read for unknown connection; ignoring");
            return;
        };
        while let Some(chunk) = ctx.net.recv(socket) {
            buffer.extend(&chunk);
        }
        while let Some((header, _)) = self
            .rx
            .get_mut(&socket)
            .and_then(|buffer| buffer.next_frame())
        {
            self.served += 1;
            debug!(seq = header.seq, delay_ns = self.delay_ns, "processing request");
            if self.delay_ns == 0 {
                self.reply(ctx, socket, header);
            } else {
                let token = self.next_token;
                self.next_token += 1;
                self.deferred.insert(token, (socket, header));
                ctx.schedule(self.delay_ns, token);
            }
        }
    }

    fn reply(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, header: FrameHeader) {
        if !ctx.net.is_ok(socket) {
            warn!(socket = %socket, seq = header.seq, "dropping reply, connection is gone");
            return;
        }
        let mut response = header;
        response.payload_len = 0;
        let sent = ctx.net.send(socket, response.to_frame(&[]), ctx.queue);
        if sent < 0 {
            warn!(socket = %socket, seq = header.seq, "reply send failed");
        }
    }

    fn on_gone(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        self.rx.remove(&socket);
        ctx.net.close(socket, ctx.queue);
    }
}

impl Application for ServerApp {
    fn handle(&mut self, ctx: &mut Ctx<'_>, event: AppEvent) {
        match event {
            AppEvent::Accepted { socket, peer } => {
                debug!(socket = %socket, %peer, "accepted connection");
                self.rx.insert(socket, FrameBuffer::new());
            }
            AppEvent::Readable { socket } => self.on_readable(ctx, socket),
            AppEvent::Timer { token } => {
                if let Some((socket, header)) = self.deferred.remove(&token) {
                    self.reply(ctx, socket, header);
                }
            }
            AppEvent::PeerClosed { socket } => {
                debug!(socket = %socket, "peer closed");
                self.on_gone(ctx, socket);
            }
            AppEvent::Failed { socket, errno } => {
                warn!(socket = %socket, ?errno, "connection failed");
                self.on_gone(ctx, socket);
            }
            _ => {}
        }
    }
}
