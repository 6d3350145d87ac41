//! Generic netlink (nl80211) protocol engine
//!
//! Layering, bottom up:
//! - `structures`: repr(C) wire headers, protocol constants, alignment math
//! - `attr`: typed TLV attribute codec, nested containers
//! - `message`: message pack/unpack and multi-part stream parsing
//! - `socket`: RAII AF_NETLINK socket and the `NetlinkIo` seam
//! - `transport`: sequence-correlated request/response, sync and async
//! - `monitor`: multicast broadcast read loop with a validation gate
//! - `proxy`: session orchestration (family resolution, callbacks)
//! - `client`: high-level queries for callers outside this module

pub mod attr;
pub mod client;
pub mod message;
pub mod monitor;
pub mod proxy;
pub mod socket;
pub mod structures;
pub mod transport;

#[cfg(test)]
pub mod testutil;

pub use attr::NlAttr;
pub use client::Nl80211Client;
pub use message::{GenericNetlinkMsg, MessageError, ParsedFrame};
pub use monitor::{BroadcastCallback, BroadcastMonitor, MonitorState};
pub use proxy::Nl80211Proxy;
pub use socket::{NetlinkIo, NetlinkIoFactory, NetlinkSocket, SocketError, SystemNetlinkFactory};
pub use transport::{NetlinkTransport, ResponseListener, TransportError};
