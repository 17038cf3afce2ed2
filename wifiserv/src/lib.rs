//! Arduino-compatible TCP server shim over smoltcp.
//!
//! The TCP state machine, retransmission, flow control, and buffering all
//! live in [smoltcp]; this crate only adapts its handle-based API to the
//! object-oriented, single-threaded polling surface of the classic Wi-Fi
//! shield library: `begin`, `has_client`, `available`, `close`/`stop`.
//!
//! The crate is generic over `smoltcp::phy::Device`, so any Wi-Fi or
//! Ethernet driver with a smoltcp binding works underneath.
//!
//! ## Example
//!
//! ```rust,ignore
//! use wifiserv::{NetConfig, NetStack, Spinlock, WifiServer};
//!
//! let config = NetConfig::new(mac, addr);
//! let stack = Spinlock::new(NetStack::new(device, config, now_ms())?);
//!
//! let mut server = WifiServer::new(&stack, 80);
//! server.begin()?;
//!
//! loop {
//!     stack.lock().poll(now_ms());
//!     if let Some(mut client) = server.available() {
//!         // read and write through the client handle
//!     }
//! }
//! ```
//!
//! [smoltcp]: https://docs.rs/smoltcp

#![no_std]

extern crate alloc;

mod client;
mod config;
mod lock;
mod server;
mod slots;
mod stack;

pub use client::{IoError, WifiClient};
pub use config::{
    NetConfig, DEFAULT_NO_DELAY, DEFAULT_PREFIX_LEN, MAX_SERVER_SOCKETS, SERVER_RX_BUFFER,
    SERVER_TX_BUFFER,
};
pub use lock::{Spinlock, SpinlockGuard};
pub use server::WifiServer;
pub use slots::{SlotState, SocketId};
pub use stack::NetStack;
