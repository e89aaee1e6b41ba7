//! In-process device implementations.
//!
//! [`MemStack`] and [`MemDevice`] are deterministic stand-ins for the real
//! user-space TCP stack and NIC driver. They back the loopback tests and
//! are handy for driving the runtime without hardware. Both support
//! scripted back-pressure so short writes and zero-accepted bursts can be
//! forced at exact points.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

use bytes::BytesMut;
use protocol_sga::EtherAddr;

use super::{EndpointId, Interest, NetDevice, TcpStack};

/// Base port for ephemeral addresses assigned to unbound connectors.
const EPHEMERAL_BASE: u16 = 49152;

#[derive(Default)]
struct Endpoint {
    open: bool,
    local: Option<SocketAddrV4>,
    /// Address of the connected remote, set on connect/accept.
    remote: Option<SocketAddrV4>,
    listening: bool,
    backlog: usize,
    /// Index of the connected peer endpoint.
    peer: Option<u32>,
    peer_closed: bool,
    rx: VecDeque<u8>,
    /// Server-side endpoints created by connect, awaiting accept.
    accept_queue: VecDeque<u32>,
    registered: Option<Interest>,
    nodelay: bool,
    nonblocking: bool,
    /// Scripted per-call write caps; 0 forces `WouldBlock`. Empty means
    /// unlimited.
    write_script: VecDeque<usize>,
}

/// In-memory [`TcpStack`]: endpoints connected through byte pipes within
/// one instance.
#[derive(Default)]
pub struct MemStack {
    endpoints: Vec<Endpoint>,
}

impl MemStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next write calls on an endpoint: each entry caps one
    /// `writev` call's accepted bytes, with 0 forcing `WouldBlock`.
    pub fn push_write_script(&mut self, ep: EndpointId, caps: &[usize]) {
        let endpoint = &mut self.endpoints[ep.0 as usize];
        endpoint.write_script.extend(caps.iter().copied());
    }

    /// The interest currently registered for an endpoint, if any.
    pub fn registered_interest(&self, ep: EndpointId) -> Option<Interest> {
        self.endpoints[ep.0 as usize].registered
    }

    /// Whether the endpoint is in non-blocking mode.
    pub fn is_nonblocking(&self, ep: EndpointId) -> bool {
        self.endpoints[ep.0 as usize].nonblocking
    }

    /// Whether Nagle batching is disabled on the endpoint.
    pub fn nodelay(&self, ep: EndpointId) -> bool {
        self.endpoints[ep.0 as usize].nodelay
    }

    fn get(&self, ep: EndpointId) -> io::Result<&Endpoint> {
        self.endpoints
            .get(ep.0 as usize)
            .filter(|e| e.open)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such endpoint"))
    }

    fn get_mut(&mut self, ep: EndpointId) -> io::Result<&mut Endpoint> {
        self.endpoints
            .get_mut(ep.0 as usize)
            .filter(|e| e.open)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such endpoint"))
    }

    fn find_listener(&self, addr: SocketAddrV4) -> Option<u32> {
        self.endpoints.iter().position(|e| {
            e.open
                && e.listening
                && e.local.map(|l| {
                    l.port() == addr.port()
                        && (*l.ip() == *addr.ip() || *l.ip() == Ipv4Addr::UNSPECIFIED)
                }) == Some(true)
        }).map(|i| i as u32)
    }
}

impl TcpStack for MemStack {
    fn socket(&mut self) -> io::Result<EndpointId> {
        let id = self.endpoints.len() as u32;
        self.endpoints.push(Endpoint {
            open: true,
            ..Endpoint::default()
        });
        Ok(EndpointId(id))
    }

    fn bind(&mut self, ep: EndpointId, addr: SocketAddrV4) -> io::Result<()> {
        let endpoint = self.get_mut(ep)?;
        if endpoint.local.is_some() {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "already bound"));
        }
        endpoint.local = Some(addr);
        Ok(())
    }

    fn listen(&mut self, ep: EndpointId, backlog: usize) -> io::Result<()> {
        let endpoint = self.get_mut(ep)?;
        if endpoint.local.is_none() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not bound"));
        }
        endpoint.listening = true;
        endpoint.backlog = backlog.max(1);
        Ok(())
    }

    fn accept(&mut self, ep: EndpointId) -> io::Result<(EndpointId, SocketAddrV4)> {
        let endpoint = self.get_mut(ep)?;
        if !endpoint.listening {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not listening"));
        }
        match endpoint.accept_queue.pop_front() {
            Some(child) => {
                let remote = self.endpoints[child as usize].remote.unwrap();
                Ok((EndpointId(child), remote))
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn connect(&mut self, ep: EndpointId, addr: SocketAddrV4) -> io::Result<()> {
        self.get(ep)?;
        let listener = self
            .find_listener(addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no listener"))?;
        if self.endpoints[listener as usize].accept_queue.len()
            >= self.endpoints[listener as usize].backlog
        {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "backlog full"));
        }

        let client = ep.0 as usize;
        if self.endpoints[client].local.is_none() {
            let port = EPHEMERAL_BASE.wrapping_add(ep.0 as u16);
            self.endpoints[client].local = Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        }
        let client_addr = self.endpoints[client].local.unwrap();

        // Server-side endpoint for this connection.
        let child = self.endpoints.len() as u32;
        self.endpoints.push(Endpoint {
            open: true,
            local: self.endpoints[listener as usize].local,
            remote: Some(client_addr),
            peer: Some(ep.0),
            ..Endpoint::default()
        });
        self.endpoints[client].peer = Some(child);
        self.endpoints[client].remote = Some(addr);
        self.endpoints[listener as usize].accept_queue.push_back(child);
        Ok(())
    }

    fn close(&mut self, ep: EndpointId) -> io::Result<()> {
        let peer = {
            let endpoint = self.get_mut(ep)?;
            endpoint.open = false;
            endpoint.peer.take()
        };
        if let Some(peer) = peer {
            self.endpoints[peer as usize].peer_closed = true;
        }
        Ok(())
    }

    fn local_addr(&self, ep: EndpointId) -> io::Result<SocketAddrV4> {
        self.get(ep)?
            .local
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "not bound"))
    }

    fn read(&mut self, ep: EndpointId, buf: &mut [u8]) -> io::Result<usize> {
        let endpoint = self.get_mut(ep)?;
        if endpoint.rx.is_empty() {
            if endpoint.peer_closed {
                return Ok(0);
            }
            if endpoint.peer.is_none() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(endpoint.rx.len());
        for b in buf.iter_mut().take(n) {
            *b = endpoint.rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn writev(&mut self, ep: EndpointId, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let (peer, cap) = {
            let endpoint = self.get_mut(ep)?;
            if endpoint.peer_closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
            }
            let peer = endpoint
                .peer
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;
            let cap = endpoint.write_script.pop_front().unwrap_or(usize::MAX);
            (peer, cap)
        };
        if cap == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut written = 0;
        let rx = &mut self.endpoints[peer as usize].rx;
        'outer: for buf in bufs {
            for &b in buf.iter() {
                if written == cap {
                    break 'outer;
                }
                rx.push_back(b);
                written += 1;
            }
        }
        Ok(written)
    }

    fn set_nodelay(&mut self, ep: EndpointId, on: bool) -> io::Result<()> {
        self.get_mut(ep)?.nodelay = on;
        Ok(())
    }

    fn set_nonblocking(&mut self, ep: EndpointId, on: bool) -> io::Result<()> {
        self.get_mut(ep)?.nonblocking = on;
        Ok(())
    }

    fn register(&mut self, ep: EndpointId, interest: Interest) -> io::Result<()> {
        self.get_mut(ep)?.registered = Some(interest);
        Ok(())
    }

    fn modify(&mut self, ep: EndpointId, interest: Interest) -> io::Result<()> {
        let endpoint = self.get_mut(ep)?;
        if endpoint.registered.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not registered"));
        }
        endpoint.registered = Some(interest);
        Ok(())
    }

    fn deregister(&mut self, ep: EndpointId) -> io::Result<()> {
        self.get_mut(ep)?.registered = None;
        Ok(())
    }
}

type FrameQueue = Rc<RefCell<VecDeque<BytesMut>>>;

/// In-memory [`NetDevice`]: a frame queue pair shared between two devices
/// (or looped back onto one).
pub struct MemDevice {
    mac: EtherAddr,
    tx: FrameQueue,
    rx: FrameQueue,
    /// Scripted per-burst accept caps; 0 forces a rejected burst. Empty
    /// means unlimited.
    tx_script: VecDeque<usize>,
}

impl MemDevice {
    /// Two devices wired back-to-back: frames sent by one are received by
    /// the other.
    pub fn wire(mac_a: EtherAddr, mac_b: EtherAddr) -> (MemDevice, MemDevice) {
        let a_to_b: FrameQueue = Rc::new(RefCell::new(VecDeque::new()));
        let b_to_a: FrameQueue = Rc::new(RefCell::new(VecDeque::new()));
        (
            MemDevice {
                mac: mac_a,
                tx: a_to_b.clone(),
                rx: b_to_a.clone(),
                tx_script: VecDeque::new(),
            },
            MemDevice {
                mac: mac_b,
                tx: b_to_a,
                rx: a_to_b,
                tx_script: VecDeque::new(),
            },
        )
    }

    /// A single device whose transmissions are received by itself.
    pub fn loopback(mac: EtherAddr) -> MemDevice {
        let queue: FrameQueue = Rc::new(RefCell::new(VecDeque::new()));
        MemDevice {
            mac,
            tx: queue.clone(),
            rx: queue,
            tx_script: VecDeque::new(),
        }
    }

    /// Script the next transmit bursts: each entry caps one burst's
    /// accepted frame count, with 0 forcing a zero-accepted burst.
    pub fn push_tx_script(&mut self, caps: &[usize]) {
        self.tx_script.extend(caps.iter().copied());
    }
}

// Shared handles: a runtime can own one end of the stack or device while
// a test (or a second runtime on the same host) keeps the other.

impl TcpStack for Rc<RefCell<MemStack>> {
    fn socket(&mut self) -> io::Result<EndpointId> {
        self.borrow_mut().socket()
    }

    fn bind(&mut self, ep: EndpointId, addr: SocketAddrV4) -> io::Result<()> {
        self.borrow_mut().bind(ep, addr)
    }

    fn listen(&mut self, ep: EndpointId, backlog: usize) -> io::Result<()> {
        self.borrow_mut().listen(ep, backlog)
    }

    fn accept(&mut self, ep: EndpointId) -> io::Result<(EndpointId, SocketAddrV4)> {
        self.borrow_mut().accept(ep)
    }

    fn connect(&mut self, ep: EndpointId, addr: SocketAddrV4) -> io::Result<()> {
        self.borrow_mut().connect(ep, addr)
    }

    fn close(&mut self, ep: EndpointId) -> io::Result<()> {
        self.borrow_mut().close(ep)
    }

    fn local_addr(&self, ep: EndpointId) -> io::Result<SocketAddrV4> {
        self.borrow().local_addr(ep)
    }

    fn read(&mut self, ep: EndpointId, buf: &mut [u8]) -> io::Result<usize> {
        self.borrow_mut().read(ep, buf)
    }

    fn writev(&mut self, ep: EndpointId, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.borrow_mut().writev(ep, bufs)
    }

    fn set_nodelay(&mut self, ep: EndpointId, on: bool) -> io::Result<()> {
        self.borrow_mut().set_nodelay(ep, on)
    }

    fn set_nonblocking(&mut self, ep: EndpointId, on: bool) -> io::Result<()> {
        self.borrow_mut().set_nonblocking(ep, on)
    }

    fn register(&mut self, ep: EndpointId, interest: Interest) -> io::Result<()> {
        self.borrow_mut().register(ep, interest)
    }

    fn modify(&mut self, ep: EndpointId, interest: Interest) -> io::Result<()> {
        self.borrow_mut().modify(ep, interest)
    }

    fn deregister(&mut self, ep: EndpointId) -> io::Result<()> {
        self.borrow_mut().deregister(ep)
    }
}

impl NetDevice for Rc<RefCell<MemDevice>> {
    fn mac_addr(&self) -> EtherAddr {
        self.borrow().mac
    }

    fn tx_burst(&mut self, frames: &mut Vec<BytesMut>) -> usize {
        self.borrow_mut().tx_burst(frames)
    }

    fn rx_burst(&mut self, out: &mut Vec<BytesMut>, max: usize) -> usize {
        self.borrow_mut().rx_burst(out, max)
    }
}

impl NetDevice for MemDevice {
    fn mac_addr(&self) -> EtherAddr {
        self.mac
    }

    fn tx_burst(&mut self, frames: &mut Vec<BytesMut>) -> usize {
        let cap = self.tx_script.pop_front().unwrap_or(usize::MAX);
        let n = frames.len().min(cap);
        let mut queue = self.tx.borrow_mut();
        for frame in frames.drain(..n) {
            queue.push_back(frame);
        }
        n
    }

    fn rx_burst(&mut self, out: &mut Vec<BytesMut>, max: usize) -> usize {
        let mut queue = self.rx.borrow_mut();
        let n = queue.len().min(max);
        for _ in 0..n {
            out.push(queue.pop_front().unwrap());
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_pair(stack: &mut MemStack) -> (EndpointId, EndpointId) {
        let server = stack.socket().unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7000);
        stack.bind(server, addr).unwrap();
        stack.listen(server, 8).unwrap();

        let client = stack.socket().unwrap();
        stack.connect(client, addr).unwrap();
        let (child, _) = stack.accept(server).unwrap();
        (client, child)
    }

    #[test]
    fn connect_accept_and_transfer() {
        let mut stack = MemStack::new();
        let (client, child) = connected_pair(&mut stack);

        let n = stack
            .writev(client, &[IoSlice::new(b"hel"), IoSlice::new(b"lo")])
            .unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 16];
        let n = stack.read(child, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        // Drained: next read would block.
        let err = stack.read(child, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn accept_empty_would_block() {
        let mut stack = MemStack::new();
        let server = stack.socket().unwrap();
        stack
            .bind(server, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7001))
            .unwrap();
        stack.listen(server, 4).unwrap();
        let err = stack.accept(server).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn connect_refused_without_listener() {
        let mut stack = MemStack::new();
        let client = stack.socket().unwrap();
        let err = stack
            .connect(client, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9999))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn write_script_caps_and_blocks() {
        let mut stack = MemStack::new();
        let (client, child) = connected_pair(&mut stack);
        stack.push_write_script(client, &[7, 0]);

        // First call: only 7 bytes accepted.
        let n = stack.writev(client, &[IoSlice::new(&[0xAA; 40])]).unwrap();
        assert_eq!(n, 7);

        // Second call: scripted would-block.
        let err = stack.writev(client, &[IoSlice::new(&[0xAA; 33])]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Third call: unlimited again.
        let n = stack.writev(client, &[IoSlice::new(&[0xAA; 33])]).unwrap();
        assert_eq!(n, 33);

        let mut buf = [0u8; 64];
        assert_eq!(stack.read(child, &mut buf).unwrap(), 40);
    }

    #[test]
    fn close_is_seen_as_eof() {
        let mut stack = MemStack::new();
        let (client, child) = connected_pair(&mut stack);
        stack.close(client).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stack.read(child, &mut buf).unwrap(), 0);
    }

    #[test]
    fn device_wire_carries_frames() {
        let (mut a, mut b) = MemDevice::wire(EtherAddr([1; 6]), EtherAddr([2; 6]));
        let mut frames = vec![BytesMut::from(&b"frame"[..])];
        assert_eq!(a.tx_burst(&mut frames), 1);
        assert!(frames.is_empty());

        let mut out = Vec::new();
        assert_eq!(b.rx_burst(&mut out, 8), 1);
        assert_eq!(&out[0][..], b"frame");

        // Nothing flows the other way.
        let mut out = Vec::new();
        assert_eq!(a.rx_burst(&mut out, 8), 0);
    }

    #[test]
    fn device_tx_script_forces_backpressure() {
        let mut dev = MemDevice::loopback(EtherAddr([3; 6]));
        dev.push_tx_script(&[0]);

        let mut frames = vec![BytesMut::from(&b"x"[..])];
        assert_eq!(dev.tx_burst(&mut frames), 0);
        assert_eq!(frames.len(), 1);

        // Script exhausted: the retry succeeds.
        assert_eq!(dev.tx_burst(&mut frames), 1);
        let mut out = Vec::new();
        assert_eq!(dev.rx_burst(&mut out, 4), 1);
    }
}
