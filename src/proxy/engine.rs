//! The L7 proxy core.
//!
//! Accepts client connections, reassembles framed requests, routes each
//! request to a backend chosen by the balancer, opens or reuses one backend
//! connection per (client, backend) pair, relays responses back, measures
//! round trips, and keeps the balancer's in-flight accounting exact through
//! every close, error, and shutdown path.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::balance::Balancer;
use crate::frame::{FrameBuffer, FrameHeader};
use crate::net::{AppEvent, SockErr, SocketId};
use crate::sim::{Application, Ctx};

/// Request parked on a backend socket whose connect has not completed yet.
#[derive(Debug)]
struct PendingForward {
    client: SocketId,
    frame: Bytes,
    backend: SocketAddr,
}

/// Counters the driver reports after a run.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProxyCounters {
    /// Client connections accepted.
    pub connections: u64,
    /// Full request messages reassembled from clients.
    pub requests: u64,
    /// Requests handed to a backend socket (or parked on a connect).
    pub forwarded: u64,
    /// Full response messages relayed back to clients.
    pub responses: u64,
    /// Requests dropped because no backend was chosen.
    pub dropped: u64,
}

/// Connection-oriented proxy engine driven entirely by transport callbacks.
#[derive(Debug)]
pub struct ProxyEngine {
    listen_addr: SocketAddr,
    balancer: Balancer,

    /// Reassembly buffer per client socket; presence marks a live client.
    client_rx: HashMap<SocketId, FrameBuffer>,
    /// Reassembly buffer per connected backend socket.
    backend_rx: HashMap<SocketId, FrameBuffer>,
    /// Per-client map of backend address to the one socket serving it.
    client_backends: HashMap<SocketId, HashMap<SocketAddr, SocketId>>,
    /// Reverse map: the client a backend socket belongs to.
    backend_client: HashMap<SocketId, SocketId>,
    /// Requests waiting on a backend connect, keyed by the new socket.
    pending: HashMap<SocketId, PendingForward>,
    /// Send time per (backend socket, seq), for RTT measurement.
    send_times: HashMap<(SocketId, u32), i64>,

    counters: ProxyCounters,
}

impl ProxyEngine {
    pub fn new(listen_addr: SocketAddr, balancer: Balancer) -> Self {
        Self {
            listen_addr,
            balancer,
            client_rx: HashMap::new(),
            backend_rx: HashMap::new(),
            client_backends: HashMap::new(),
            backend_client: HashMap::new(),
            pending: HashMap::new(),
            send_times: HashMap::new(),
            counters: ProxyCounters::default(),
        }
    }

    /// Opens the listening endpoint.
    pub fn start(&mut self, ctx: &mut Ctx<'_>) {
        ctx.net.listen(self.listen_addr, ctx.app);
        info!(addr = %self.listen_addr, "proxy listening");
        if self.balancer.pool().is_empty() {
            warn!("starting with no backends configured");
        }
    }

    /// Stops accepting, tears down every connection, and settles accounting.
    /// Balancer state stays readable afterwards.
    pub fn shutdown(&mut self, ctx: &mut Ctx<'_>) {
        ctx.net.unlisten(self.listen_addr);

        let clients: Vec<_> = self.client_backends.keys().copied().collect();
        info!(clients = clients.len(), "shutting down, cleaning client connections");
        for client in clients {
            self.cleanup_client(ctx, client);
        }

        // Anything still parked here lost its client without passing through
        // client cleanup; settle its accounting before dropping it.
        let orphans: Vec<_> = self.pending.keys().copied().collect();
        for socket in orphans {
            warn!(socket = %socket, "pending connect orphaned at shutdown");
            self.cleanup_backend(ctx, socket);
        }

        debug_assert!(self.send_times.is_empty());
        debug_assert!(self.backend_client.is_empty());
    }

    pub fn counters(&self) -> ProxyCounters {
        self.counters
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn balancer_mut(&mut self) -> &mut Balancer {
        &mut self.balancer
    }

    fn on_accept(&mut self, socket: SocketId, peer: SocketAddr) {
        info!(socket = %socket, %peer, "accepted client connection");
        self.counters.connections += 1;
        self.client_rx.insert(socket, FrameBuffer::new());
        self.client_backends.insert(socket, HashMap::new());
    }

    fn on_client_readable(&mut self, ctx: &mut Ctx<'_>, client: SocketId) {
        let Some(buffer) = self.client_rx.get_mut(&client) else {
            debug!(socket = %client, "read for client with no buffer, likely closed; ignoring");
            return;
        };
        while let Some(chunk) = ctx.net.recv(client) {
            buffer.extend(&chunk);
        }

        while let Some((header, frame)) = self
            .client_rx
            .get_mut(&client)
            .and_then(|buffer| buffer.next_frame())
        {
            self.counters.requests += 1;
            debug!(socket = %client, seq = header.seq, l7_id = header.l7_id, "full request reassembled");
            self.forward_request(ctx, client, header, frame);
        }

        let errno = ctx.net.errno(client);
        if !matches!(errno, SockErr::Ok | SockErr::WouldBlock | SockErr::Shutdown | SockErr::NotConnected)
        {
            warn!(socket = %client, ?errno, "error reading from client");
            self.cleanup_client(ctx, client);
        }
    }

    /// Routes one reassembled request: pick a backend, then reuse the
    /// client's connection to it or open a new one.
    fn forward_request(
        &mut self,
        ctx: &mut Ctx<'_>,
        client: SocketId,
        header: FrameHeader,
        frame: Bytes,
    ) {
        let now = ctx.now_ns();
        let Some(backend) = self.balancer.choose(header.l7_id, now) else {
            warn!(seq = header.seq, l7_id = header.l7_id, "no backend chosen, dropping request");
            self.counters.dropped += 1;
            return;
        };
        debug!(seq = header.seq, l7_id = header.l7_id, %backend, "request assigned to backend");

        if !self.client_backends.contains_key(&client) {
            warn!(socket = %client, seq = header.seq, "client vanished during forwarding, dropping request");
            self.counters.dropped += 1;
            return;
        }

        // Reuse the existing connection when it is still healthy; a dead
        // entry is swept here and replaced by a fresh connect.
        let existing = self.client_backends[&client].get(&backend).copied();
        if let Some(socket) = existing {
            if ctx.net.is_ok(socket) {
                self.counters.forwarded += 1;
                self.balancer.notify_sent(backend);
                self.send_times.insert((socket, header.seq), now);
                self.send_to_backend(ctx, socket, &frame);
                return;
            }
            debug!(socket = %socket, %backend, "stale backend socket found, replacing");
            self.cleanup_backend(ctx, socket);
        }

        info!(%backend, socket = %client, seq = header.seq, "opening new backend connection");
        let local_ip = self.listen_addr.ip();
        let socket = ctx.net.connect(ctx.app, local_ip, backend, ctx.queue);

        // Count the request in flight for the whole connect duration; a
        // failed connect reverses it through notify_finished.
        self.counters.forwarded += 1;
        self.balancer.notify_sent(backend);
        self.pending.insert(socket, PendingForward { client, frame, backend });
        self.backend_client.insert(socket, client);
        if let Some(map) = self.client_backends.get_mut(&client) {
            map.insert(backend, socket);
        }
    }

    fn on_backend_connected(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        let Some(pending) = self.pending.remove(&socket) else {
            warn!(socket = %socket, "backend connected with no pending request; closing");
            self.cleanup_backend(ctx, socket);
            return;
        };
        info!(socket = %socket, backend = %pending.backend, "backend connection established");

        if !self.client_rx.contains_key(&pending.client) || !ctx.net.is_ok(pending.client) {
            warn!(
                client = %pending.client,
                backend = %pending.backend,
                "client gone before backend connected, dropping request"
            );
            self.balancer.notify_finished(pending.backend);
            self.cleanup_backend(ctx, socket);
            return;
        }

        self.backend_rx.insert(socket, FrameBuffer::new());
        if let Some(header) = FrameHeader::peek(&pending.frame) {
            self.send_times.insert((socket, header.seq), ctx.now_ns());
        }
        self.send_to_backend(ctx, socket, &pending.frame);
    }

    fn on_backend_connect_failed(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        match self.pending.get(&socket) {
            Some(pending) => {
                warn!(
                    socket = %socket,
                    backend = %pending.backend,
                    errno = ?ctx.net.errno(socket),
                    "backend connect failed, dropping request"
                );
            }
            None => {
                warn!(socket = %socket, "backend connect failed with no pending request");
            }
        }
        self.cleanup_backend(ctx, socket);
    }

    fn on_backend_readable(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        let Some(client) = self.backend_client.get(&socket).copied() else {
            debug!(socket = %socket, "read from backend with no client, likely closing; ignoring");
            return;
        };
        if !ctx.net.is_ok(client) {
            debug!(socket = %socket, client = %client, "client dead, cleaning backend");
            self.cleanup_backend(ctx, socket);
            return;
        }
        if !self.backend_rx.contains_key(&socket) {
            warn!(socket = %socket, "backend has no rx buffer; state inconsistency, cleaning up");
            self.cleanup_backend(ctx, socket);
            return;
        }

        while let Some(chunk) = ctx.net.recv(socket) {
            if let Some(buffer) = self.backend_rx.get_mut(&socket) {
                buffer.extend(&chunk);
            }
        }

        let backend = ctx.net.peer_addr(socket);
        while let Some((header, frame)) = self
            .backend_rx
            .get_mut(&socket)
            .and_then(|buffer| buffer.next_frame())
        {
            let now = ctx.now_ns();
            match self.send_times.remove(&(socket, header.seq)) {
                Some(sent_at) => {
                    if let Some(backend) = backend {
                        let rtt = now - sent_at;
                        debug!(seq = header.seq, %backend, rtt_ns = rtt, "response round trip measured");
                        self.balancer.record_latency(backend, rtt, now);
                    }
                }
                None => {
                    warn!(socket = %socket, seq = header.seq, "no send time recorded for response");
                }
            }
            if let Some(backend) = backend {
                self.balancer.notify_finished(backend);
            }
            self.counters.responses += 1;
            self.send_to_client(ctx, client, &frame);
        }

        let errno = ctx.net.errno(socket);
        if !matches!(errno, SockErr::Ok | SockErr::WouldBlock | SockErr::Shutdown | SockErr::NotConnected)
        {
            warn!(socket = %socket, ?errno, "error reading from backend");
            self.cleanup_backend(ctx, socket);
        }
    }

    fn send_to_backend(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, frame: &Bytes) {
        let backend = ctx.net.peer_addr(socket);
        if !ctx.net.is_ok(socket) {
            warn!(socket = %socket, ?backend, "backend socket not ready for send");
            // Settle this request by hand, then let cleanup settle the rest
            // of the socket's outstanding entries exactly once each.
            if let Some(header) = FrameHeader::peek(frame) {
                self.send_times.remove(&(socket, header.seq));
            }
            if let Some(backend) = backend {
                self.balancer.notify_finished(backend);
            }
            self.cleanup_backend(ctx, socket);
            return;
        }

        let sent = ctx.net.send(socket, frame.clone(), ctx.queue);
        if sent < 0 {
            warn!(socket = %socket, errno = ?ctx.net.errno(socket), "send to backend failed");
            if let Some(header) = FrameHeader::peek(frame) {
                self.send_times.remove(&(socket, header.seq));
            }
            if let Some(backend) = backend {
                self.balancer.notify_finished(backend);
            }
        } else if (sent as usize) < frame.len() {
            // Backend transmit window is saturated: stop pulling bytes from
            // the originating client until the window drains.
            warn!(socket = %socket, sent, total = frame.len(), "short send to backend, pausing client reads");
            if let Some(client) = self.backend_client.get(&socket).copied() {
                if ctx.net.is_ok(client) {
                    ctx.net.set_read_interest(client, false, ctx.queue);
                }
            }
        }
    }

    fn send_to_client(&mut self, ctx: &mut Ctx<'_>, client: SocketId, frame: &Bytes) {
        if !ctx.net.is_ok(client) {
            warn!(socket = %client, "dropping response for dead client socket");
            return;
        }

        let sent = ctx.net.send(client, frame.clone(), ctx.queue);
        if sent < 0 {
            warn!(socket = %client, errno = ?ctx.net.errno(client), "send to client failed");
        } else if (sent as usize) < frame.len() {
            // Client transmit window is saturated: pause every backend that
            // feeds this client.
            warn!(socket = %client, sent, total = frame.len(), "short send to client, pausing backend reads");
            if let Some(map) = self.client_backends.get(&client) {
                for socket in map.values().copied().collect::<Vec<_>>() {
                    if ctx.net.is_ok(socket) {
                        ctx.net.set_read_interest(socket, false, ctx.queue);
                    }
                }
            }
        }
    }

    /// Writability came back on one side; resume reads on the opposite side.
    fn on_writable(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        if let Some(client) = self.backend_client.get(&socket).copied() {
            if ctx.net.is_ok(client) {
                debug!(backend = %socket, client = %client, "backend drained, resuming client reads");
                ctx.net.set_read_interest(client, true, ctx.queue);
            }
            return;
        }
        if let Some(map) = self.client_backends.get(&socket) {
            debug!(client = %socket, "client drained, resuming backend reads");
            for backend_socket in map.values().copied().collect::<Vec<_>>() {
                if ctx.net.is_ok(backend_socket) {
                    ctx.net.set_read_interest(backend_socket, true, ctx.queue);
                }
            }
        }
    }

    fn on_client_gone(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, reason: &str) {
        info!(socket = %socket, reason, "client connection ended");
        self.cleanup_client(ctx, socket);
    }

    fn on_backend_gone(&mut self, ctx: &mut Ctx<'_>, socket: SocketId, reason: &str) {
        let backend = ctx.net.peer_addr(socket);
        info!(socket = %socket, ?backend, reason, "backend connection ended");
        self.cleanup_backend(ctx, socket);
    }

    /// Tears down a client and everything hanging off it: its backend
    /// sockets, its pending connects, and its reassembly buffer.
    fn cleanup_client(&mut self, ctx: &mut Ctx<'_>, client: SocketId) {
        if let Some(map) = self.client_backends.remove(&client) {
            for socket in map.into_values() {
                self.cleanup_backend(ctx, socket);
            }
        }
        self.client_rx.remove(&client);

        // Pending connects can reference a client without appearing in its
        // backend map if the map entry was swept earlier; settle them too.
        let orphaned: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| p.client == client)
            .map(|(socket, _)| *socket)
            .collect();
        for socket in orphaned {
            warn!(socket = %socket, client = %client, "dropping pending connect for closed client");
            self.cleanup_backend(ctx, socket);
        }

        ctx.net.close(client, ctx.queue);
    }

    /// Tears down one backend socket and settles its accounting: one finish
    /// per outstanding send-time entry, plus one for a parked pending
    /// request. The owning client is left alone.
    fn cleanup_backend(&mut self, ctx: &mut Ctx<'_>, socket: SocketId) {
        let mut backend_addr = ctx.net.peer_addr(socket);

        if let Some(client) = self.backend_client.remove(&socket) {
            if let Some(map) = self.client_backends.get_mut(&client) {
                map.retain(|addr, sock| {
                    if *sock == socket {
                        backend_addr.get_or_insert(*addr);
                        false
                    } else {
                        true
                    }
                });
            }
        }
        self.backend_rx.remove(&socket);

        if let Some(pending) = self.pending.remove(&socket) {
            self.balancer.notify_finished(pending.backend);
        }

        let outstanding: Vec<_> = self
            .send_times
            .keys()
            .filter(|(sock, _)| *sock == socket)
            .copied()
            .collect();
        for key in outstanding {
            self.send_times.remove(&key);
            match backend_addr {
                Some(addr) => self.balancer.notify_finished(addr),
                None => warn!(socket = %socket, seq = key.1, "cannot settle request, backend address unknown"),
            }
        }

        ctx.net.close(socket, ctx.queue);
    }

    fn is_client(&self, socket: SocketId) -> bool {
        self.client_rx.contains_key(&socket) || self.client_backends.contains_key(&socket)
    }

    fn is_backend(&self, socket: SocketId) -> bool {
        self.backend_client.contains_key(&socket) || self.pending.contains_key(&socket)
    }
}

impl Application for ProxyEngine {
    fn handle(&mut self, ctx: &mut Ctx<'_>, event: AppEvent) {
        match event {
            AppEvent::Accepted { socket, peer } => self.on_accept(socket, peer),
            AppEvent::Readable { socket } => {
                if self.is_client(socket) {
                    self.on_client_readable(ctx, socket);
                } else if self.is_backend(socket) {
                    self.on_backend_readable(ctx, socket);
                } else {
                    debug!(socket = %socket, "readable for unknown socket; ignoring");
                }
            }
            AppEvent::Writable { socket, .. } => self.on_writable(ctx, socket),
            AppEvent::ConnectOk { socket } => self.on_backend_connected(ctx, socket),
            AppEvent::ConnectFail { socket } => self.on_backend_connect_failed(ctx, socket),
            AppEvent::PeerClosed { socket } => {
                if self.is_client(socket) {
                    self.on_client_gone(ctx, socket, "peer closed");
                } else if self.is_backend(socket) {
                    self.on_backend_gone(ctx, socket, "peer closed");
                }
            }
            AppEvent::Failed { socket, errno } => {
                if self.is_client(socket) {
                    warn!(socket = %socket, ?errno, "client socket failed");
                    self.on_client_gone(ctx, socket, "error");
                } else if self.is_backend(socket) {
                    warn!(socket = %socket, ?errno, "backend socket failed");
                    self.on_backend_gone(ctx, socket, "error");
                }
            }
            AppEvent::Timer { .. } => {}
        }
    }
}
