//! Server shim configuration constants and interface settings.

use smoltcp::wire::Ipv4Address;

/// Maximum number of server socket slots. Listeners and accepted
/// connections (claimed or not) all draw from this pool.
pub const MAX_SERVER_SOCKETS: usize = 8;

/// Receive buffer size for each server socket.
pub const SERVER_RX_BUFFER: usize = 2048;

/// Transmit buffer size for each server socket.
pub const SERVER_TX_BUFFER: usize = 1024;

/// Default network prefix length.
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Crate-wide default for Nagle suppression on claimed connections.
/// Servers override it per instance via `set_no_delay`.
pub const DEFAULT_NO_DELAY: bool = false;

/// Interface settings handed to the stack adapter.
pub struct NetConfig {
    pub mac: [u8; 6],
    pub addr: Ipv4Address,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Address>,
}

impl NetConfig {
    pub fn new(mac: [u8; 6], addr: Ipv4Address) -> Self {
        Self {
            mac,
            addr,
            prefix_len: DEFAULT_PREFIX_LEN,
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Address) -> Self {
        self.gateway = Some(gateway);
        self
    }
}
