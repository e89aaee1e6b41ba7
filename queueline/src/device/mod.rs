//! Device seams: the user-space TCP stack and the NIC poll-mode driver.
//!
//! Hardware bring-up, memory-pool allocation, and link probing live in an
//! external device service; the runtime only needs the narrow interfaces
//! here. All data-plane calls are non-blocking: transient unavailability
//! is reported as [`io::ErrorKind::WouldBlock`] (stream) or a
//! zero-accepted burst (datagram), never by blocking the carrier thread.

use std::io::{self, IoSlice};
use std::net::SocketAddrV4;

use bytes::BytesMut;
use protocol_sga::EtherAddr;

pub mod mem;

/// Readiness interest registered with the stack's edge-triggered poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);

    /// Returns true if `other`'s bits are all present in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no interest is registered.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Handle to one endpoint inside a [`TcpStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u32);

/// A user-space TCP stack.
///
/// One instance serves every stream queue on its carrier thread. The
/// stack owns connection state, retransmission, and congestion control;
/// the runtime drives it through non-blocking calls and readiness
/// registration.
pub trait TcpStack {
    /// Create a new, unconnected endpoint.
    fn socket(&mut self) -> io::Result<EndpointId>;

    /// Assign a local address.
    fn bind(&mut self, ep: EndpointId, addr: SocketAddrV4) -> io::Result<()>;

    /// Start accepting connections with the given backlog.
    fn listen(&mut self, ep: EndpointId, backlog: usize) -> io::Result<()>;

    /// Take one pending connection off a listening endpoint.
    ///
    /// `WouldBlock` when none is pending.
    fn accept(&mut self, ep: EndpointId) -> io::Result<(EndpointId, SocketAddrV4)>;

    /// Connect to a remote address.
    fn connect(&mut self, ep: EndpointId, addr: SocketAddrV4) -> io::Result<()>;

    /// Close the endpoint and release its resources.
    fn close(&mut self, ep: EndpointId) -> io::Result<()>;

    /// The locally bound (or assigned) address.
    fn local_addr(&self, ep: EndpointId) -> io::Result<SocketAddrV4>;

    /// Read available bytes. `Ok(0)` means the peer closed; `WouldBlock`
    /// means no data yet.
    fn read(&mut self, ep: EndpointId, buf: &mut [u8]) -> io::Result<usize>;

    /// Vectored write. May accept fewer bytes than offered; `WouldBlock`
    /// means none could be accepted.
    fn writev(&mut self, ep: EndpointId, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Disable Nagle batching.
    fn set_nodelay(&mut self, ep: EndpointId, on: bool) -> io::Result<()>;

    /// Switch the endpoint between blocking and non-blocking mode.
    fn set_nonblocking(&mut self, ep: EndpointId, on: bool) -> io::Result<()>;

    /// Register the endpoint with the readiness poller.
    fn register(&mut self, ep: EndpointId, interest: Interest) -> io::Result<()>;

    /// Change a registered endpoint's interest set.
    fn modify(&mut self, ep: EndpointId, interest: Interest) -> io::Result<()>;

    /// Remove the endpoint from the readiness poller.
    fn deregister(&mut self, ep: EndpointId) -> io::Result<()>;
}

/// A NIC poll-mode driver.
///
/// Frames are raw Ethernet; the datagram transport builds and validates
/// every header itself.
pub trait NetDevice {
    /// The device's configured MAC address.
    fn mac_addr(&self) -> EtherAddr;

    /// Offer frames for transmission, front first. Accepted frames are
    /// drained from `frames`; the count accepted is returned. Zero means
    /// back-pressure, not failure.
    fn tx_burst(&mut self, frames: &mut Vec<BytesMut>) -> usize;

    /// Pull up to `max` received frames, appending them to `out`.
    /// Returns the count pulled.
    fn rx_burst(&mut self, out: &mut Vec<BytesMut>, max: usize) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bits() {
        let rw = Interest::READ | Interest::WRITE;
        assert!(rw.contains(Interest::READ));
        assert!(rw.contains(Interest::WRITE));
        assert!(!Interest::READ.contains(Interest::WRITE));
        assert!(Interest::NONE.is_empty());
        assert!(!rw.is_empty());
    }
}
