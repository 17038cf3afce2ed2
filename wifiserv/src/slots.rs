//! Server socket slot table.
//!
//! Fixed bookkeeping for the sockets the shim owns on the stack: listening
//! sockets, accepted-but-unclaimed connections, and connections claimed by a
//! `WifiClient`. Claim order is kept by the stack adapter's queue; the table
//! only tracks slot lifecycle.

use smoltcp::iface::SocketHandle;
use smoltcp::wire::Ipv4Address;

use crate::config::MAX_SERVER_SOCKETS;

/// Identifier for a server socket slot.
pub type SocketId = u8;

/// Slot lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotState {
    /// Slot is free
    Free,
    /// Socket is listening for a connection
    Listening,
    /// Connection established, waiting to be claimed by `available`
    Pending,
    /// Connection claimed by a `WifiClient`
    Claimed,
    /// Socket is draining a close
    Closing,
}

/// A server socket slot.
pub struct ServerSlot {
    pub handle: Option<SocketHandle>,
    /// Local address the listener was bound to; `None` means wildcard
    pub addr: Option<Ipv4Address>,
    pub port: u16,
    pub state: SlotState,
}

impl ServerSlot {
    pub const fn new() -> Self {
        Self {
            handle: None,
            addr: None,
            port: 0,
            state: SlotState::Free,
        }
    }
}

/// Table of server socket slots.
pub struct SlotTable {
    slots: [ServerSlot; MAX_SERVER_SOCKETS],
}

impl SlotTable {
    pub const fn new() -> Self {
        Self {
            slots: [
                ServerSlot::new(),
                ServerSlot::new(),
                ServerSlot::new(),
                ServerSlot::new(),
                ServerSlot::new(),
                ServerSlot::new(),
                ServerSlot::new(),
                ServerSlot::new(),
            ],
        }
    }

    /// First free slot id, if any. The caller fills the slot.
    pub fn allocate(&self) -> Option<SocketId> {
        self.slots
            .iter()
            .position(|slot| slot.state == SlotState::Free)
            .map(|i| i as SocketId)
    }

    /// Get slot by id
    pub fn get(&self, id: SocketId) -> Option<&ServerSlot> {
        self.slots.get(id as usize)
    }

    /// Get mutable slot by id
    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut ServerSlot> {
        self.slots.get_mut(id as usize)
    }

    /// Clear a slot back to `Free`.
    pub fn release(&mut self, id: SocketId) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            slot.handle = None;
            slot.addr = None;
            slot.port = 0;
            slot.state = SlotState::Free;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerSlot> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_skips_occupied_slots() {
        let mut table = SlotTable::new();
        let id = table.allocate().unwrap();
        assert_eq!(id, 0);
        table.get_mut(id).unwrap().state = SlotState::Listening;

        assert_eq!(table.allocate().unwrap(), 1);

        table.release(id);
        assert_eq!(table.allocate().unwrap(), 0);
    }

    #[test]
    fn release_clears_slot() {
        let mut table = SlotTable::new();
        let id = table.allocate().unwrap();
        {
            let slot = table.get_mut(id).unwrap();
            slot.port = 80;
            slot.state = SlotState::Claimed;
        }
        table.release(id);

        let slot = table.get(id).unwrap();
        assert_eq!(slot.state, SlotState::Free);
        assert_eq!(slot.port, 0);
        assert!(slot.handle.is_none());
        assert!(slot.addr.is_none());
    }

    #[test]
    fn table_exhausts_at_capacity() {
        let mut table = SlotTable::new();
        for _ in 0..MAX_SERVER_SOCKETS {
            let id = table.allocate().unwrap();
            table.get_mut(id).unwrap().state = SlotState::Pending;
        }
        assert!(table.allocate().is_none());
    }
}
