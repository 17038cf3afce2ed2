//! Stack adapter owning the smoltcp interface, device, and socket set.
//!
//! smoltcp exposes no accept callback the way lwIP does, so `poll` plays
//! that role here. Each poll drives the interface, then walks the server
//! slots: listeners that reached `Established` move onto the unclaimed
//! queue and their port is re-armed, aborted listeners go back to listen,
//! unclaimed connections the peer gave up on are discarded, and drained
//! closes are released.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info, warn};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::Device;
use smoltcp::socket::tcp;
use smoltcp::time::Instant;
use smoltcp::wire::{
    EthernetAddress, HardwareAddress, IpAddress, IpCidr, IpListenEndpoint, Ipv4Address,
};

use crate::config::{NetConfig, MAX_SERVER_SOCKETS, SERVER_RX_BUFFER, SERVER_TX_BUFFER};
use crate::slots::{SlotState, SlotTable, SocketId};

/// A port the shim keeps a listener armed on.
struct Binding {
    addr: Option<Ipv4Address>,
    port: u16,
    /// Set once a re-arm attempt ran out of slots, so the pause is logged once
    starved: bool,
}

/// Network stack adapter, generic over the underlying device.
pub struct NetStack<D: Device> {
    device: D,
    iface: Interface,
    sockets: SocketSet<'static>,
    slots: SlotTable,
    /// Accepted connections in arrival order, until claimed or discarded
    unclaimed: VecDeque<SocketId>,
    /// Ports that should have a listener armed
    bindings: Vec<Binding>,
    /// Timestamp of the last poll
    now_ms: i64,
}

impl<D: Device> NetStack<D> {
    /// Build the interface and socket set around the given device.
    pub fn new(mut device: D, config: NetConfig, now_ms: i64) -> Result<Self, &'static str> {
        let NetConfig {
            mac,
            addr,
            prefix_len,
            gateway,
        } = config;

        if prefix_len > 32 {
            return Err("invalid prefix length");
        }

        let hw_addr = HardwareAddress::Ethernet(EthernetAddress(mac));

        // Seed for TCP ISN generation. MAC, IP, and boot time combined so
        // two nodes on the same segment do not share sequence spaces.
        let seed = {
            let mac_part = (mac[0] as u64) << 40
                | (mac[1] as u64) << 32
                | (mac[2] as u64) << 24
                | (mac[3] as u64) << 16
                | (mac[4] as u64) << 8
                | (mac[5] as u64);
            let o = addr.octets();
            let ip_part = (o[0] as u64) << 24
                | (o[1] as u64) << 16
                | (o[2] as u64) << 8
                | (o[3] as u64);
            mac_part ^ (ip_part << 16) ^ now_ms as u64
        };

        let mut iface_config = Config::new(hw_addr);
        iface_config.random_seed = seed;

        let mut iface = Interface::new(iface_config, &mut device, Instant::from_millis(now_ms));

        iface.update_ip_addrs(|addrs| {
            addrs.push(IpCidr::new(IpAddress::Ipv4(addr), prefix_len)).ok();
        });

        if let Some(gw) = gateway {
            iface.routes_mut().add_default_ipv4_route(gw).ok();
        }

        Ok(Self {
            device,
            iface,
            sockets: SocketSet::new(Vec::new()),
            slots: SlotTable::new(),
            unclaimed: VecDeque::new(),
            bindings: Vec::new(),
            now_ms,
        })
    }

    /// Drive the device and sockets, then service the server slots.
    /// Call frequently from the application loop.
    pub fn poll(&mut self, now_ms: i64) {
        self.now_ms = now_ms;
        let timestamp = Instant::from_millis(now_ms);

        self.iface.poll(timestamp, &mut self.device, &mut self.sockets);

        self.service_slots();
    }

    /// Timestamp of the most recent poll.
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    // =========================================================================
    // LISTENER MANAGEMENT
    // =========================================================================

    /// Register a listening port and arm its first socket.
    pub(crate) fn listen(
        &mut self,
        addr: Option<Ipv4Address>,
        port: u16,
    ) -> Result<(), &'static str> {
        if port == 0 {
            return Err("invalid port");
        }
        if self.bindings.iter().any(|b| b.port == port) {
            return Err("port already bound");
        }

        self.arm(addr, port)?;
        self.bindings.push(Binding {
            addr,
            port,
            starved: false,
        });
        info!("listening on TCP port {}", port);
        Ok(())
    }

    /// Drop a listening port. Accepted connections stay claimable.
    pub(crate) fn unlisten(&mut self, port: u16) {
        let Some(pos) = self.bindings.iter().position(|b| b.port == port) else {
            return;
        };
        self.bindings.remove(pos);

        for id in 0..MAX_SERVER_SOCKETS as SocketId {
            let is_listener = self
                .slots
                .get(id)
                .map_or(false, |s| s.state == SlotState::Listening && s.port == port);
            if is_listener {
                self.release(id);
            }
        }
        info!("closed TCP port {}", port);
    }

    /// State of the listening socket for a port; `Closed` when none is armed.
    pub(crate) fn listener_state(&self, port: u16) -> tcp::State {
        for slot in self.slots.iter() {
            if slot.state == SlotState::Listening && slot.port == port {
                if let Some(handle) = slot.handle {
                    return self.sockets.get::<tcp::Socket>(handle).state();
                }
            }
        }
        tcp::State::Closed
    }

    /// Whether an accepted connection on `port` is waiting to be claimed.
    pub(crate) fn has_pending(&self, port: u16) -> bool {
        self.unclaimed
            .iter()
            .any(|&id| self.slots.get(id).map_or(false, |s| s.port == port))
    }

    /// Claim the oldest unclaimed connection on `port`.
    pub(crate) fn claim(&mut self, port: u16) -> Option<SocketId> {
        let pos = self
            .unclaimed
            .iter()
            .position(|&id| self.slots.get(id).map_or(false, |s| s.port == port))?;
        let id = self.unclaimed.remove(pos)?;
        if let Some(slot) = self.slots.get_mut(id) {
            slot.state = SlotState::Claimed;
        }
        debug!("claimed connection (socket {})", id);
        Some(id)
    }

    /// Create a listening socket for a port and fill a free slot with it.
    fn arm(&mut self, addr: Option<Ipv4Address>, port: u16) -> Result<SocketId, &'static str> {
        let id = self
            .slots
            .allocate()
            .ok_or("no free server socket slots")?;

        let rx_buffer = tcp::SocketBuffer::new(vec![0u8; SERVER_RX_BUFFER]);
        let tx_buffer = tcp::SocketBuffer::new(vec![0u8; SERVER_TX_BUFFER]);
        let mut socket = tcp::Socket::new(rx_buffer, tx_buffer);

        let endpoint = IpListenEndpoint {
            addr: addr.map(IpAddress::Ipv4),
            port,
        };
        socket
            .listen(endpoint)
            .map_err(|_| "failed to listen on port")?;

        let handle = self.sockets.add(socket);
        if let Some(slot) = self.slots.get_mut(id) {
            slot.handle = Some(handle);
            slot.addr = addr;
            slot.port = port;
            slot.state = SlotState::Listening;
        }
        Ok(id)
    }

    /// Make sure every binding has a listener armed, retrying ports that
    /// previously ran out of slots.
    fn arm_bindings(&mut self) {
        for i in 0..self.bindings.len() {
            let (addr, port) = (self.bindings[i].addr, self.bindings[i].port);
            let armed = self
                .slots
                .iter()
                .any(|slot| slot.state == SlotState::Listening && slot.port == port);
            if armed {
                self.bindings[i].starved = false;
                continue;
            }
            match self.arm(addr, port) {
                Ok(_) => self.bindings[i].starved = false,
                Err(_) => {
                    if !self.bindings[i].starved {
                        self.bindings[i].starved = true;
                        warn!("no free socket slot for port {}, accepting paused", port);
                    }
                }
            }
        }
    }

    /// Walk the slot table and advance slot lifecycles. This is where
    /// accepted connections are detected and queued.
    fn service_slots(&mut self) {
        for id in 0..MAX_SERVER_SOCKETS as SocketId {
            let (handle, state) = match self.slots.get(id) {
                Some(slot) if slot.state != SlotState::Free => match slot.handle {
                    Some(h) => (h, slot.state),
                    None => continue,
                },
                _ => continue,
            };
            let sock_state = self.sockets.get::<tcp::Socket>(handle).state();

            match state {
                SlotState::Listening => match sock_state {
                    tcp::State::Established => self.accept(id, handle),
                    tcp::State::Closed | tcp::State::TimeWait => self.relisten(id, handle),
                    _ => {}
                },
                SlotState::Pending => {
                    if matches!(sock_state, tcp::State::Closed | tcp::State::TimeWait) {
                        debug!("unclaimed connection dropped by peer (socket {})", id);
                        self.unclaimed.retain(|&q| q != id);
                        self.release(id);
                    }
                }
                SlotState::Closing => {
                    if matches!(sock_state, tcp::State::Closed | tcp::State::TimeWait) {
                        self.release(id);
                    }
                }
                SlotState::Claimed | SlotState::Free => {}
            }
        }

        self.arm_bindings();
    }

    /// Move an established listener socket onto the unclaimed queue.
    fn accept(&mut self, id: SocketId, handle: SocketHandle) {
        if let Some(remote) = self.sockets.get::<tcp::Socket>(handle).remote_endpoint() {
            let IpAddress::Ipv4(ip) = remote.addr;
            let port = self.slots.get(id).map_or(0, |s| s.port);
            info!("connection from {}:{} on port {}", ip, remote.port, port);
        }
        if let Some(slot) = self.slots.get_mut(id) {
            slot.state = SlotState::Pending;
        }
        self.unclaimed.push_back(id);
    }

    /// A handshake fell through; put the same socket back into listen.
    fn relisten(&mut self, id: SocketId, handle: SocketHandle) {
        let (addr, port) = match self.slots.get(id) {
            Some(slot) => (slot.addr, slot.port),
            None => return,
        };
        let endpoint = IpListenEndpoint {
            addr: addr.map(IpAddress::Ipv4),
            port,
        };
        if self
            .sockets
            .get_mut::<tcp::Socket>(handle)
            .listen(endpoint)
            .is_err()
        {
            // Socket still draining (TimeWait). Free the slot and let
            // arm_bindings bring the port back up on a fresh one.
            self.release(id);
        }
    }

    /// Remove a slot's socket from the set and free the slot.
    fn release(&mut self, id: SocketId) {
        if let Some(slot) = self.slots.get(id) {
            if let Some(handle) = slot.handle {
                self.sockets.remove(handle);
            }
        }
        self.slots.release(id);
    }

    fn handle_of(&self, id: SocketId) -> Option<SocketHandle> {
        self.slots.get(id).and_then(|s| s.handle)
    }

    // =========================================================================
    // PER-SOCKET OPERATIONS (used by the client facade)
    // =========================================================================

    /// Queue data on a claimed connection.
    pub(crate) fn send_on(&mut self, id: SocketId, data: &[u8]) -> Result<usize, &'static str> {
        let handle = self.handle_of(id).ok_or("invalid socket id")?;

        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        if !socket.may_send() {
            return Err("socket cannot send");
        }
        let sent = socket.send_slice(data).map_err(|_| "failed to send data")?;

        // Poll to transmit
        let timestamp = Instant::from_millis(self.now_ms);
        self.iface.poll(timestamp, &mut self.device, &mut self.sockets);

        Ok(sent)
    }

    /// Receive from a claimed connection (non-blocking).
    pub(crate) fn recv_on(&mut self, id: SocketId, buf: &mut [u8]) -> Result<usize, &'static str> {
        // Poll to pick up pending segments
        let timestamp = Instant::from_millis(self.now_ms);
        self.iface.poll(timestamp, &mut self.device, &mut self.sockets);

        let handle = self.handle_of(id).ok_or("invalid socket id")?;
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);

        if !socket.may_recv() {
            if socket.state() == tcp::State::CloseWait || socket.state() == tcp::State::Closed {
                return Err("connection closed by peer");
            }
            return Ok(0);
        }

        match socket.recv_slice(buf) {
            Ok(len) => Ok(len),
            Err(_) => Ok(0),
        }
    }

    /// Bytes buffered for reading on a claimed connection.
    pub(crate) fn recv_available_on(&self, id: SocketId) -> usize {
        match self.handle_of(id) {
            Some(handle) => {
                let socket = self.sockets.get::<tcp::Socket>(handle);
                if socket.may_recv() {
                    socket.recv_queue()
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// Whether the send half of a claimed connection is open.
    pub(crate) fn may_send_on(&self, id: SocketId) -> bool {
        match self.handle_of(id) {
            Some(handle) => self.sockets.get::<tcp::Socket>(handle).may_send(),
            None => false,
        }
    }

    /// Whether a claimed connection is still alive.
    pub(crate) fn connected_on(&self, id: SocketId) -> bool {
        match self.handle_of(id) {
            Some(handle) => !matches!(
                self.sockets.get::<tcp::Socket>(handle).state(),
                tcp::State::Closed | tcp::State::TimeWait | tcp::State::Listen
            ),
            None => false,
        }
    }

    /// Remote endpoint of a claimed connection.
    pub(crate) fn remote_endpoint_on(&self, id: SocketId) -> Option<(Ipv4Address, u16)> {
        let handle = self.handle_of(id)?;
        let remote = self.sockets.get::<tcp::Socket>(handle).remote_endpoint()?;
        let IpAddress::Ipv4(ip) = remote.addr;
        Some((ip, remote.port))
    }

    /// Toggle Nagle batching on a claimed connection.
    pub(crate) fn set_nagle_on(&mut self, id: SocketId, nagle_enabled: bool) {
        if let Some(handle) = self.handle_of(id) {
            self.sockets
                .get_mut::<tcp::Socket>(handle)
                .set_nagle_enabled(nagle_enabled);
        }
    }

    /// Close a claimed connection gracefully. The slot is recycled once the
    /// FIN exchange drains.
    pub(crate) fn close_on(&mut self, id: SocketId) {
        let Some(handle) = self.handle_of(id) else {
            return;
        };
        self.sockets.get_mut::<tcp::Socket>(handle).close();

        // Poll to process the close
        let timestamp = Instant::from_millis(self.now_ms);
        self.iface.poll(timestamp, &mut self.device, &mut self.sockets);

        if let Some(slot) = self.slots.get_mut(id) {
            slot.state = SlotState::Closing;
        }
    }

    /// Abort a claimed connection and free its slot immediately.
    pub(crate) fn discard(&mut self, id: SocketId) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        if slot.state != SlotState::Claimed {
            return;
        }
        debug!("discarding client (socket {})", id);
        if let Some(handle) = slot.handle {
            self.sockets.get_mut::<tcp::Socket>(handle).abort();

            // Flush the reset before the socket goes away
            let timestamp = Instant::from_millis(self.now_ms);
            self.iface.poll(timestamp, &mut self.device, &mut self.sockets);
        }
        self.release(id);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use smoltcp::phy::{Loopback, Medium};
    use smoltcp::wire::IpEndpoint;

    use super::*;
    use crate::lock::Spinlock;
    use crate::server::WifiServer;

    const MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const ADDR: Ipv4Address = Ipv4Address::new(127, 0, 0, 1);
    const PORT: u16 = 4200;

    fn stack() -> Spinlock<NetStack<Loopback>> {
        let device = Loopback::new(Medium::Ethernet);
        let config = NetConfig {
            mac: MAC,
            addr: ADDR,
            prefix_len: 8,
            gateway: None,
        };
        Spinlock::new(NetStack::new(device, config, 0).unwrap())
    }

    fn pump(stack: &Spinlock<NetStack<Loopback>>, clock: &mut i64, iters: usize) {
        for _ in 0..iters {
            *clock += 10;
            stack.lock().poll(*clock);
        }
    }

    struct Peer {
        handle: SocketHandle,
    }

    fn peer_connect(stack: &Spinlock<NetStack<Loopback>>, local_port: u16, dst_port: u16) -> Peer {
        let mut guard = stack.lock();
        let net = &mut *guard;

        let rx_buffer = tcp::SocketBuffer::new(vec![0u8; 1024]);
        let tx_buffer = tcp::SocketBuffer::new(vec![0u8; 1024]);
        let socket = tcp::Socket::new(rx_buffer, tx_buffer);
        let handle = net.sockets.add(socket);

        net.sockets
            .get_mut::<tcp::Socket>(handle)
            .connect(
                net.iface.context(),
                IpEndpoint::new(IpAddress::Ipv4(ADDR), dst_port),
                local_port,
            )
            .unwrap();
        Peer { handle }
    }

    fn peer_state(stack: &Spinlock<NetStack<Loopback>>, peer: &Peer) -> tcp::State {
        stack.lock().sockets.get::<tcp::Socket>(peer.handle).state()
    }

    fn peer_send(stack: &Spinlock<NetStack<Loopback>>, peer: &Peer, data: &[u8]) {
        stack
            .lock()
            .sockets
            .get_mut::<tcp::Socket>(peer.handle)
            .send_slice(data)
            .unwrap();
    }

    fn peer_recv(stack: &Spinlock<NetStack<Loopback>>, peer: &Peer, buf: &mut [u8]) -> usize {
        let mut guard = stack.lock();
        let socket = guard.sockets.get_mut::<tcp::Socket>(peer.handle);
        if socket.can_recv() {
            socket.recv_slice(buf).unwrap()
        } else {
            0
        }
    }

    fn peer_abort(stack: &Spinlock<NetStack<Loopback>>, peer: &Peer) {
        stack
            .lock()
            .sockets
            .get_mut::<tcp::Socket>(peer.handle)
            .abort();
    }

    #[test]
    fn accept_and_echo() {
        let stack = stack();
        let mut clock = 0i64;

        let mut server = WifiServer::new(&stack, PORT);
        server.begin().unwrap();
        assert_eq!(server.status(), tcp::State::Listen);
        assert!(!server.has_client());

        let peer = peer_connect(&stack, 49100, PORT);
        pump(&stack, &mut clock, 20);

        assert!(server.has_client());
        let mut client = server.available().expect("pending connection");
        assert!(server.available().is_none());
        assert!(client.connected());
        let (ip, port) = client.remote().unwrap();
        assert_eq!(ip, ADDR);
        assert_eq!(port, 49100);

        peer_send(&stack, &peer, b"ping");
        pump(&stack, &mut clock, 10);
        assert_eq!(client.available(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        assert_eq!(client.write(b"pong").unwrap(), 4);
        pump(&stack, &mut clock, 10);
        let mut buf = [0u8; 16];
        assert_eq!(peer_recv(&stack, &peer, &mut buf), 4);
        assert_eq!(&buf[..4], b"pong");
    }

    #[test]
    fn backlog_claims_in_arrival_order() {
        let stack = stack();
        let mut clock = 0i64;

        let mut server = WifiServer::new(&stack, PORT);
        server.begin().unwrap();

        let _peer_a = peer_connect(&stack, 49001, PORT);
        pump(&stack, &mut clock, 20);
        let _peer_b = peer_connect(&stack, 49002, PORT);
        pump(&stack, &mut clock, 20);

        assert!(server.has_client());
        let first = server.available().unwrap();
        assert_eq!(first.remote().unwrap().1, 49001);
        let second = server.available().unwrap();
        assert_eq!(second.remote().unwrap().1, 49002);
        assert!(server.available().is_none());
    }

    #[test]
    fn stop_keeps_accepted_connections() {
        let stack = stack();
        let mut clock = 0i64;

        let mut server = WifiServer::new(&stack, PORT);
        server.begin().unwrap();

        let _peer = peer_connect(&stack, 49200, PORT);
        pump(&stack, &mut clock, 20);
        assert!(server.has_client());

        server.stop();
        assert_eq!(server.status(), tcp::State::Closed);

        // The accepted connection survives the listener teardown
        assert!(server.has_client());
        let client = server.available().unwrap();
        assert!(client.connected());

        // New connection attempts are refused
        let peer2 = peer_connect(&stack, 49201, PORT);
        pump(&stack, &mut clock, 40);
        assert!(!server.has_client());
        assert_eq!(peer_state(&stack, &peer2), tcp::State::Closed);
    }

    #[test]
    fn begin_with_port_rebinds() {
        let stack = stack();
        let mut clock = 0i64;

        let mut server = WifiServer::new(&stack, PORT);
        server.begin().unwrap();
        server.begin_with_port(PORT + 1).unwrap();
        assert_eq!(server.port(), PORT + 1);
        assert_eq!(server.status(), tcp::State::Listen);
        assert_eq!(stack.lock().listener_state(PORT), tcp::State::Closed);

        let _peer = peer_connect(&stack, 49300, PORT + 1);
        pump(&stack, &mut clock, 20);
        assert!(server.has_client());
    }

    #[test]
    fn dropped_client_resets_connection_and_frees_slot() {
        let stack = stack();
        let mut clock = 0i64;

        let mut server = WifiServer::new(&stack, PORT);
        server.begin().unwrap();

        let peer = peer_connect(&stack, 49400, PORT);
        pump(&stack, &mut clock, 20);

        let client = server.available().unwrap();
        let id = client.id();
        drop(client);

        {
            let net = stack.lock();
            assert_eq!(net.slots.get(id).unwrap().state, SlotState::Free);
        }

        // Peer observes the reset
        pump(&stack, &mut clock, 10);
        assert_eq!(peer_state(&stack, &peer), tcp::State::Closed);
    }

    #[test]
    fn unclaimed_connection_discarded_on_peer_reset() {
        let stack = stack();
        let mut clock = 0i64;

        let mut server = WifiServer::new(&stack, PORT);
        server.begin().unwrap();

        let peer = peer_connect(&stack, 49500, PORT);
        pump(&stack, &mut clock, 20);
        assert!(server.has_client());

        peer_abort(&stack, &peer);
        pump(&stack, &mut clock, 20);
        assert!(!server.has_client());
    }

    #[test]
    fn no_delay_applied_at_claim_time() {
        let stack = stack();
        let mut clock = 0i64;

        let mut server = WifiServer::new(&stack, PORT);
        server.set_no_delay(true);
        assert!(server.get_no_delay());
        server.begin().unwrap();

        let _peer = peer_connect(&stack, 49600, PORT);
        pump(&stack, &mut clock, 20);

        let client = server.available().unwrap();
        let net = stack.lock();
        let handle = net.slots.get(client.id()).unwrap().handle.unwrap();
        assert!(!net.sockets.get::<tcp::Socket>(handle).nagle_enabled());
    }

    #[test]
    fn slot_exhaustion_pauses_accepting() {
        let stack = stack();
        let mut clock = 0i64;

        let mut server = WifiServer::new(&stack, PORT);
        server.begin().unwrap();

        for i in 0..MAX_SERVER_SOCKETS as u16 {
            let _ = peer_connect(&stack, 49700 + i, PORT);
            pump(&stack, &mut clock, 20);
        }

        // Every slot holds a pending connection; no listener can be armed
        assert_eq!(server.status(), tcp::State::Closed);

        // Claiming alone does not free a slot, dropping the client does
        let client = server.available().unwrap();
        drop(client);
        pump(&stack, &mut clock, 5);
        assert_eq!(server.status(), tcp::State::Listen);
    }

    #[test]
    fn double_bind_is_rejected() {
        let stack = stack();

        let mut first = WifiServer::new(&stack, PORT);
        first.begin().unwrap();
        let mut second = WifiServer::new(&stack, PORT);
        assert!(second.begin().is_err());
    }
}
