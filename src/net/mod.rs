//! In-memory byte-stream transport.
//!
//! Models reliable, ordered, connection-oriented sockets on top of the event
//! queue: connects complete after one link delay, sent bytes arrive after one
//! link delay, and a bounded transmit window provides the backpressure signal
//! the proxy couples across its two halves. Retransmission and loss are out of
//! scope; the stream is reliable by construction.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::sim::{AppId, Event, EventQueue};

/// Stable integer identity of a socket, usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Socket error codes surfaced to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockErr {
    Ok,
    WouldBlock,
    NotConnected,
    Shutdown,
    ConnRefused,
    ConnReset,
}

/// Transport-internal events carried on the simulation queue.
#[derive(Debug)]
pub enum NetEvent {
    /// A connection attempt reaches its destination.
    ConnectArrive { socket: SocketId },
    /// A chunk sent by `from` arrives at `to`.
    Deliver { to: SocketId, from: SocketId, chunk: Bytes },
    /// Graceful close notification arriving at `socket`.
    Fin { socket: SocketId },
    /// Hard failure surfaced on `socket`.
    Abort { socket: SocketId },
    /// Re-check read readiness after read interest was re-enabled.
    Poll { socket: SocketId },
}

/// Callbacks delivered to the application owning a socket.
#[derive(Debug)]
pub enum AppEvent {
    Accepted { socket: SocketId, peer: SocketAddr },
    Readable { socket: SocketId },
    Writable { socket: SocketId, available: usize },
    ConnectOk { socket: SocketId },
    ConnectFail { socket: SocketId },
    PeerClosed { socket: SocketId },
    Failed { socket: SocketId, errno: SockErr },
    Timer { token: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockState {
    Connecting,
    Established,
    Closed,
    Failed,
}

#[derive(Debug)]
struct SocketEntry {
    owner: AppId,
    local: SocketAddr,
    peer_addr: SocketAddr,
    peer: Option<SocketId>,
    state: SockState,
    fail_reason: SockErr,
    rx: VecDeque<Bytes>,
    read_enabled: bool,
    tx_used: usize,
    tx_blocked: bool,
}

/// The shared transport. Owns every socket; applications refer to sockets by
/// [`SocketId`] only.
#[derive(Debug)]
pub struct Network {
    sockets: Vec<SocketEntry>,
    listeners: HashMap<SocketAddr, AppId>,
    link_delay_ns: i64,
    tx_window: usize,
    next_ephemeral: u16,
}

impl Network {
    pub fn new(link_delay_ns: i64, tx_window: usize) -> Self {
        Self {
            sockets: Vec::new(),
            listeners: HashMap::new(),
            link_delay_ns,
            tx_window,
            next_ephemeral: 49152,
        }
    }

    /// Registers `app` as the acceptor for connections to `addr`.
    pub fn listen(&mut self, addr: SocketAddr, app: AppId) {
        debug!(%addr, app, "listening");
        self.listeners.insert(addr, app);
    }

    /// Stops accepting connections on `addr`. Later connect attempts fail
    /// with `ConnRefused`; established sockets are unaffected.
    pub fn unlisten(&mut self, addr: SocketAddr) {
        self.listeners.remove(&addr);
    }

    /// Starts a non-blocking connect from `local_ip` to `peer`. The outcome
    /// arrives later as `ConnectOk` or `ConnectFail`.
    pub fn connect(
        &mut self,
        owner: AppId,
        local_ip: IpAddr,
        peer: SocketAddr,
        queue: &mut EventQueue,
    ) -> SocketId {
        let local = SocketAddr::new(local_ip, self.next_ephemeral);
        self.next_ephemeral = self.next_ephemeral.wrapping_add(1).max(49152);
        let id = SocketId(self.sockets.len() as u32);
        self.sockets.push(SocketEntry {
            owner,
            local,
            peer_addr: peer,
            peer: None,
            state: SockState::Connecting,
            fail_reason: SockErr::Ok,
            rx: VecDeque::new(),
            read_enabled: true,
            tx_used: 0,
            tx_blocked: false,
        });
        queue.schedule(self.link_delay_ns, Event::Net(NetEvent::ConnectArrive { socket: id }));
        trace!(socket = %id, %peer, "connect started");
        id
    }

    /// Queues `chunk` for delivery to the peer.
    ///
    /// Returns a negative value on error, otherwise the number of bytes that
    /// fit the free transmit window. The surplus is still queued (the stream
    /// is reliable); a short return is the congestion signal and a `Writable`
    /// callback follows once the window frees up.
    pub fn send(&mut self, socket: SocketId, chunk: Bytes, queue: &mut EventQueue) -> i64 {
        let delay = self.link_delay_ns;
        let window = self.tx_window;
        let Some(entry) = self.sockets.get_mut(socket.0 as usize) else {
            return -1;
        };
        if entry.state != SockState::Established {
            return -1;
        }
        let Some(peer) = entry.peer else {
            return -1;
        };
        let len = chunk.len();
        let free = window.saturating_sub(entry.tx_used);
        let accepted = len.min(free);
        entry.tx_used += len;
        if accepted < len {
            entry.tx_blocked = true;
        }
        queue.schedule(delay, Event::Net(NetEvent::Deliver { to: peer, from: socket, chunk }));
        accepted as i64
    }

    /// Drains one received chunk, or `None` when nothing is pending.
    pub fn recv(&mut self, socket: SocketId) -> Option<Bytes> {
        self.sockets.get_mut(socket.0 as usize)?.rx.pop_front()
    }

    /// Closes the socket. Idempotent; the peer observes a graceful close one
    /// link delay later.
    pub fn close(&mut self, socket: SocketId, queue: &mut EventQueue) {
        let delay = self.link_delay_ns;
        let Some(entry) = self.sockets.get_mut(socket.0 as usize) else {
            return;
        };
        if matches!(entry.state, SockState::Closed | SockState::Failed) {
            return;
        }
        let peer = entry.peer;
        entry.state = SockState::Closed;
        entry.rx.clear();
        trace!(socket = %socket, "closed");
        if let Some(peer) = peer {
            queue.schedule(delay, Event::Net(NetEvent::Fin { socket: peer }));
        }
    }

    /// Fault hook: hard-fails the connection. Both endpoints observe an error,
    /// the far end one link delay later.
    pub fn abort(&mut self, socket: SocketId, queue: &mut EventQueue) {
        let delay = self.link_delay_ns;
        let peer = self.sockets.get(socket.0 as usize).and_then(|e| e.peer);
        queue.schedule(0, Event::Net(NetEvent::Abort { socket }));
        if let Some(peer) = peer {
            queue.schedule(delay, Event::Net(NetEvent::Abort { socket: peer }));
        }
    }

    /// Enables or disables readable callbacks for the socket. Re-enabling
    /// schedules a poll so buffered data is picked up again.
    pub fn set_read_interest(&mut self, socket: SocketId, enabled: bool, queue: &mut EventQueue) {
        let Some(entry) = self.sockets.get_mut(socket.0 as usize) else {
            return;
        };
        let was_enabled = entry.read_enabled;
        entry.read_enabled = enabled;
        if enabled && !was_enabled {
            queue.schedule(0, Event::Net(NetEvent::Poll { socket }));
        }
    }

    /// Remote address of the socket. Known for the socket's whole lifetime,
    /// including after errors.
    pub fn peer_addr(&self, socket: SocketId) -> Option<SocketAddr> {
        self.sockets.get(socket.0 as usize).map(|e| e.peer_addr)
    }

    pub fn local_addr(&self, socket: SocketId) -> Option<SocketAddr> {
        self.sockets.get(socket.0 as usize).map(|e| e.local)
    }

    /// Terminal error state of the socket.
    pub fn errno(&self, socket: SocketId) -> SockErr {
        match self.sockets.get(socket.0 as usize) {
            None => SockErr::NotConnected,
            Some(entry) => match entry.state {
                SockState::Connecting => SockErr::NotConnected,
                SockState::Established => SockErr::Ok,
                SockState::Closed => SockErr::Shutdown,
                SockState::Failed => entry.fail_reason,
            },
        }
    }

    /// Whether the socket is established and error-free.
    pub fn is_ok(&self, socket: SocketId) -> bool {
        self.sockets
            .get(socket.0 as usize)
            .is_some_and(|e| e.state == SockState::Established)
    }

    /// Live sockets (connecting or established) owned by `app`.
    pub fn sockets_owned_by(&self, app: AppId) -> Vec<SocketId> {
        self.sockets
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.owner == app
                    && matches!(e.state, SockState::Connecting | SockState::Established)
            })
            .map(|(i, _)| SocketId(i as u32))
            .collect()
    }

    /// Applies a transport event, returning the application callbacks it
    /// produced in delivery order.
    pub fn process(&mut self, event: NetEvent) -> Vec<(AppId, AppEvent)> {
        let mut out = Vec::new();
        match event {
            NetEvent::ConnectArrive { socket } => {
                let Some(entry) = self.sockets.get(socket.0 as usize) else {
                    return out;
                };
                if entry.state != SockState::Connecting {
                    return out;
                }
                let target = entry.peer_addr;
                let connector_local = entry.local;
                let connector_owner = entry.owner;
                match self.listeners.get(&target).copied() {
                    Some(listener_app) => {
                        let accepted = SocketId(self.sockets.len() as u32);
                        self.sockets.push(SocketEntry {
                            owner: listener_app,
                            local: target,
                            peer_addr: connector_local,
                            peer: Some(socket),
                            state: SockState::Established,
                            fail_reason: SockErr::Ok,
                            rx: VecDeque::new(),
                            read_enabled: true,
                            tx_used: 0,
                            tx_blocked: false,
                        });
                        let entry = &mut self.sockets[socket.0 as usize];
                        entry.peer = Some(accepted);
                        entry.state = SockState::Established;
                        out.push((
                            listener_app,
                            AppEvent::Accepted { socket: accepted, peer: connector_local },
                        ));
                        out.push((connector_owner, AppEvent::ConnectOk { socket }));
                    }
                    None => {
                        debug!(socket = %socket, %target, "connection refused, no listener");
                        let entry = &mut self.sockets[socket.0 as usize];
                        entry.state = SockState::Failed;
                        entry.fail_reason = SockErr::ConnRefused;
                        out.push((connector_owner, AppEvent::ConnectFail { socket }));
                    }
                }
            }
            NetEvent::Deliver { to, from, chunk } => {
                let len = chunk.len();
                let window = self.tx_window;
                // Credit the sender's transmit window first so a Writable
                // callback can precede the peer's Readable at this instant.
                if let Some(sender) = self.sockets.get_mut(from.0 as usize) {
                    sender.tx_used = sender.tx_used.saturating_sub(len);
                    if sender.tx_blocked
                        && sender.tx_used < window
                        && sender.state == SockState::Established
                    {
                        sender.tx_blocked = false;
                        let available = window - sender.tx_used;
                        out.push((sender.owner, AppEvent::Writable { socket: from, available }));
                    }
                }
                if let Some(entry) = self.sockets.get_mut(to.0 as usize) {
                    if entry.state == SockState::Established {
                        entry.rx.push_back(chunk);
                        if entry.read_enabled {
                            out.push((entry.owner, AppEvent::Readable { socket: to }));
                        }
                    }
                }
            }
            NetEvent::Fin { socket } => {
                if let Some(entry) = self.sockets.get_mut(socket.0 as usize) {
                    if entry.state == SockState::Established {
                        entry.state = SockState::Closed;
                        out.push((entry.owner, AppEvent::PeerClosed { socket }));
                    }
                }
            }
            NetEvent::Abort { socket } => {
                if let Some(entry) = self.sockets.get_mut(socket.0 as usize) {
                    if matches!(entry.state, SockState::Connecting | SockState::Established) {
                        entry.state = SockState::Failed;
                        entry.fail_reason = SockErr::ConnReset;
                        warn!(socket = %socket, "connection aborted");
                        out.push((
                            entry.owner,
                            AppEvent::Failed { socket, errno: SockErr::ConnReset },
                        ));
                    }
                }
            }
            NetEvent::Poll { socket } => {
                if let Some(entry) = self.sockets.get(socket.0 as usize) {
                    if entry.state == SockState::Established
                        && entry.read_enabled
                        && !entry.rx.is_empty()
                    {
                        out.push((entry.owner, AppEvent::Readable { socket }));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
    }

    fn pump(net: &mut Network, queue: &mut EventQueue) -> Vec<(AppId, AppEvent)> {
        let mut out = Vec::new();
        while let Some((_, event)) = queue.pop() {
            if let Event::Net(net_event) = event {
                out.extend(net.process(net_event));
            }
        }
        out
    }

    #[test]
    fn test_connect_accept_and_round_trip() {
        let mut queue = EventQueue::new();
        let mut net = Network::new(1_000, 64 * 1024);
        let server = addr(2, 9000);
        net.listen(server, 1);

        let sock = net.connect(0, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), server, &mut queue);
        let events = pump(&mut net, &mut queue);
        let accepted = events
            .iter()
            .find_map(|(app, e)| match e {
                AppEvent::Accepted { socket, .. } if *app == 1 => Some(*socket),
                _ => None,
            })
            .expect("accept callback");
        assert!(events
            .iter()
            .any(|(app, e)| *app == 0 && matches!(e, AppEvent::ConnectOk { socket } if *socket == sock)));
        assert!(net.is_ok(sock));
        assert_eq!(net.peer_addr(accepted), net.local_addr(sock));

        let sent = net.send(sock, Bytes::from_static(b"ping"), &mut queue);
        assert_eq!(sent, 4);
        let events = pump(&mut net, &mut queue);
        assert!(events
            .iter()
            .any(|(app, e)| *app == 1 && matches!(e, AppEvent::Readable { socket } if *socket == accepted)));
        assert_eq!(net.recv(accepted).as_deref(), Some(&b"ping"[..]));
        assert_eq!(net.recv(accepted), None);
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let mut queue = EventQueue::new();
        let mut net = Network::new(1_000, 64 * 1024);
        let sock = net.connect(0, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), addr(9, 80), &mut queue);
        let events = pump(&mut net, &mut queue);
        assert!(events
            .iter()
            .any(|(app, e)| *app == 0 && matches!(e, AppEvent::ConnectFail { socket } if *socket == sock)));
        assert_eq!(net.errno(sock), SockErr::ConnRefused);
        assert!(!net.is_ok(sock));
    }

    #[test]
    fn test_short_send_then_writable_when_window_frees() {
        let mut queue = EventQueue::new();
        let mut net = Network::new(1_000, 8);
        let server = addr(2, 9000);
        net.listen(server, 1);
        let sock = net.connect(0, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), server, &mut queue);
        pump(&mut net, &mut queue);

        // 12 bytes into an 8-byte window: 8 accepted, surplus still queued.
        let sent = net.send(sock, Bytes::from_static(b"0123456789ab"), &mut queue);
        assert_eq!(sent, 8);
        let events = pump(&mut net, &mut queue);
        assert!(events
            .iter()
            .any(|(app, e)| *app == 0 && matches!(e, AppEvent::Writable { socket, .. } if *socket == sock)));
        // The full chunk was delivered despite the short send.
        let accepted = net.sockets_owned_by(1)[0];
        assert_eq!(net.recv(accepted).map(|c| c.len()), Some(12));
    }

    #[test]
    fn test_close_notifies_peer() {
        let mut queue = EventQueue::new();
        let mut net = Network::new(1_000, 64 * 1024);
        let server = addr(2, 9000);
        net.listen(server, 1);
        let sock = net.connect(0, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), server, &mut queue);
        pump(&mut net, &mut queue);
        let accepted = net.sockets_owned_by(1)[0];

        net.close(sock, &mut queue);
        net.close(sock, &mut queue); // idempotent
        let events = pump(&mut net, &mut queue);
        assert!(events
            .iter()
            .any(|(app, e)| *app == 1 && matches!(e, AppEvent::PeerClosed { socket } if *socket == accepted)));
        assert_eq!(net.errno(sock), SockErr::Shutdown);
    }

    #[test]
    fn test_abort_fails_both_ends() {
        let mut queue = EventQueue::new();
        let mut net = Network::new(1_000, 64 * 1024);
        let server = addr(2, 9000);
        net.listen(server, 1);
        let sock = net.connect(0, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), server, &mut queue);
        pump(&mut net, &mut queue);
        let accepted = net.sockets_owned_by(1)[0];

        net.abort(accepted, &mut queue);
        let events = pump(&mut net, &mut queue);
        assert!(events
            .iter()
            .any(|(app, e)| *app == 1 && matches!(e, AppEvent::Failed { socket, .. } if *socket == accepted)));
        assert!(events
            .iter()
            .any(|(app, e)| *app == 0 && matches!(e, AppEvent::Failed { socket, .. } if *socket == sock)));
        assert_eq!(net.errno(sock), SockErr::ConnReset);
    }

    #[test]
    fn test_read_interest_suppresses_and_poll_recovers() {
        let mut queue = EventQueue::new();
        let mut net = Network::new(1_000, 64 * 1024);
        let server = addr(2, 9000);
        net.listen(server, 1);
        let sock = net.connect(0, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), server, &mut queue);
        pump(&mut net, &mut queue);
        let accepted = net.sockets_owned_by(1)[0];

        net.set_read_interest(accepted, false, &mut queue);
        net.send(sock, Bytes::from_static(b"quiet"), &mut queue);
        let events = pump(&mut net, &mut queue);
        assert!(!events
            .iter()
            .any(|(_, e)| matches!(e, AppEvent::Readable { socket } if *socket == accepted)));

        net.set_read_interest(accepted, true, &mut queue);
        let events = pump(&mut net, &mut queue);
        assert!(events
            .iter()
            .any(|(app, e)| *app == 1 && matches!(e, AppEvent::Readable { socket } if *socket == accepted)));
        assert_eq!(net.recv(accepted).as_deref(), Some(&b"quiet"[..]));
    }
}
