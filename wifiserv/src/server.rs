//! Arduino-style TCP server facade.
//!
//! `WifiServer` mirrors the classic Wi-Fi shield server object: `begin`
//! binds and listens, `has_client`/`available` poll for accepted
//! connections, `close`/`stop` tear the listener down. All protocol work
//! happens in the stack adapter; this type only tracks the bound endpoint
//! and the per-server no-delay override.

use smoltcp::phy::Device;
use smoltcp::socket::tcp;
use smoltcp::wire::Ipv4Address;

use crate::client::WifiClient;
use crate::config::DEFAULT_NO_DELAY;
use crate::lock::Spinlock;
use crate::stack::NetStack;

/// TCP server bound to a local port on the shared stack.
pub struct WifiServer<'a, D: Device> {
    stack: &'a Spinlock<NetStack<D>>,
    addr: Option<Ipv4Address>,
    port: u16,
    bound: bool,
    /// Per-server override of [`DEFAULT_NO_DELAY`], applied at claim time
    no_delay: Option<bool>,
}

impl<'a, D: Device> WifiServer<'a, D> {
    /// Create a server that will listen on all local addresses.
    pub fn new(stack: &'a Spinlock<NetStack<D>>, port: u16) -> Self {
        Self {
            stack,
            addr: None,
            port,
            bound: false,
            no_delay: None,
        }
    }

    /// Create a server restricted to one local address.
    pub fn with_addr(stack: &'a Spinlock<NetStack<D>>, addr: Ipv4Address, port: u16) -> Self {
        Self {
            stack,
            addr: Some(addr),
            port,
            bound: false,
            no_delay: None,
        }
    }

    /// Bind and listen on the configured port. Any previous listener of
    /// this server is closed first.
    pub fn begin(&mut self) -> Result<(), &'static str> {
        self.begin_with_port(self.port)
    }

    /// Bind and listen on a new port.
    pub fn begin_with_port(&mut self, port: u16) -> Result<(), &'static str> {
        self.close();
        self.port = port;
        self.stack.lock().listen(self.addr, port)?;
        self.bound = true;
        Ok(())
    }

    /// Whether an accepted connection is waiting to be claimed.
    pub fn has_client(&self) -> bool {
        self.stack.lock().has_pending(self.port)
    }

    /// Claim the oldest unclaimed connection, if any.
    pub fn available(&self) -> Option<WifiClient<'a, D>> {
        let mut stack = self.stack.lock();
        let id = stack.claim(self.port)?;
        stack.set_nagle_on(id, !self.get_no_delay());
        drop(stack);
        Some(WifiClient::claimed(self.stack, id))
    }

    /// State of the listening socket; `Closed` when not bound.
    pub fn status(&self) -> tcp::State {
        if !self.bound {
            return tcp::State::Closed;
        }
        self.stack.lock().listener_state(self.port)
    }

    /// Stop listening. Connections already accepted stay claimable.
    pub fn close(&mut self) {
        if self.bound {
            self.stack.lock().unlisten(self.port);
            self.bound = false;
        }
    }

    /// Alias of [`close`](Self::close), kept for Arduino API parity.
    pub fn stop(&mut self) {
        self.close();
    }

    /// Override the crate default Nagle suppression for connections claimed
    /// from this server.
    pub fn set_no_delay(&mut self, no_delay: bool) {
        self.no_delay = Some(no_delay);
    }

    pub fn get_no_delay(&self) -> bool {
        self.no_delay.unwrap_or(DEFAULT_NO_DELAY)
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl<D: Device> Drop for WifiServer<'_, D> {
    fn drop(&mut self) {
        self.close();
    }
}
