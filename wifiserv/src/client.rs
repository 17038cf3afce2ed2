//! Claimed connection handle.

use embedded_io::{ErrorKind, ErrorType, Read, ReadReady, Write, WriteReady};
use smoltcp::phy::Device;
use smoltcp::wire::Ipv4Address;

use crate::lock::Spinlock;
use crate::slots::SocketId;
use crate::stack::NetStack;

/// Error surfaced through the `embedded-io` impls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The connection is closed or was reset by the peer
    Closed,
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> ErrorKind {
        match self {
            IoError::Closed => ErrorKind::NotConnected,
        }
    }
}

/// A TCP connection claimed from a `WifiServer`.
///
/// Dropping the handle without calling [`stop`](Self::stop) aborts the
/// connection and releases its socket slot.
pub struct WifiClient<'a, D: Device> {
    stack: &'a Spinlock<NetStack<D>>,
    id: SocketId,
    released: bool,
}

impl<'a, D: Device> WifiClient<'a, D> {
    pub(crate) fn claimed(stack: &'a Spinlock<NetStack<D>>, id: SocketId) -> Self {
        Self {
            stack,
            id,
            released: false,
        }
    }

    /// Socket slot id, stable for the lifetime of the connection.
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// True while the connection is alive, including a peer half-close with
    /// data still buffered.
    pub fn connected(&self) -> bool {
        self.stack.lock().connected_on(self.id)
    }

    /// Number of bytes buffered for reading.
    pub fn available(&self) -> usize {
        self.stack.lock().recv_available_on(self.id)
    }

    /// Read into `buf`, returning the number of bytes copied. `Ok(0)` when
    /// nothing is buffered yet.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, &'static str> {
        self.stack.lock().recv_on(self.id, buf)
    }

    /// Queue `data` for transmission, returning the number of bytes the
    /// socket accepted.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, &'static str> {
        self.stack.lock().send_on(self.id, data)
    }

    /// Remote address and port.
    pub fn remote(&self) -> Option<(Ipv4Address, u16)> {
        self.stack.lock().remote_endpoint_on(self.id)
    }

    /// Override Nagle batching for this connection.
    pub fn set_no_delay(&mut self, no_delay: bool) {
        self.stack.lock().set_nagle_on(self.id, !no_delay);
    }

    /// Close gracefully. The socket slot is recycled once the FIN exchange
    /// drains.
    pub fn stop(&mut self) {
        if !self.released {
            self.stack.lock().close_on(self.id);
            self.released = true;
        }
    }

    /// Abort the connection immediately with a reset.
    pub fn abort(&mut self) {
        if !self.released {
            self.stack.lock().discard(self.id);
            self.released = true;
        }
    }
}

impl<D: Device> Drop for WifiClient<'_, D> {
    fn drop(&mut self) {
        if !self.released {
            self.stack.lock().discard(self.id);
        }
    }
}

impl<D: Device> ErrorType for WifiClient<'_, D> {
    type Error = IoError;
}

impl<D: Device> Read for WifiClient<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.stack
            .lock()
            .recv_on(self.id, buf)
            .map_err(|_| IoError::Closed)
    }
}

impl<D: Device> Write for WifiClient<'_, D> {
    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        self.stack
            .lock()
            .send_on(self.id, data)
            .map_err(|_| IoError::Closed)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        // Transmission is driven by the stack poll; nothing extra to do
        Ok(())
    }
}

impl<D: Device> ReadReady for WifiClient<'_, D> {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.stack.lock().recv_available_on(self.id) > 0)
    }
}

impl<D: Device> WriteReady for WifiClient<'_, D> {
    fn write_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.stack.lock().may_send_on(self.id))
    }
}
