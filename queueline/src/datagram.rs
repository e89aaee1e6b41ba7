//! Datagram transport adapter.
//!
//! Speaks raw Ethernet/IPv4/UDP directly against the NIC driver; there is
//! no kernel network stack behind it. One message maps to exactly one
//! datagram — an encoded message that would not fit the MTU is refused,
//! never fragmented.
//!
//! The receive path pulls bursts of frames into a per-queue backlog and
//! screens each frame against the device MAC and, when the queue is
//! bound, the bound IP and port. Frames failing any check are freed
//! silently; the application only ever sees messages addressed to it.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::BytesMut;
use protocol_sga::datagram;
use protocol_sga::ether::{ETHER_HEADER_SIZE, ETHERTYPE_IPV4};
use protocol_sga::ipv4::{IPPROTO_UDP, IPV4_HEADER_SIZE};
use protocol_sga::udp::UDP_HEADER_SIZE;
use protocol_sga::{EtherAddr, EtherHeader, Ipv4Header, ParseError, UdpHeader};

use crate::addrbook::AddressBook;
use crate::config::Config;
use crate::device::NetDevice;
use crate::error::Error;
use crate::metrics;
use crate::sga::SgArray;
use crate::task::{Completion, TaskState};

/// A fully built frame waiting for the device to accept it.
pub(crate) struct DatagramPushState {
    frame: Option<BytesMut>,
    payload_len: usize,
}

/// Which receive-filter stage rejected a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterDrop {
    WrongEtherAddr,
    WrongEtherType,
    WrongIpAddr,
    WrongProtocol,
    WrongUdpPort,
    /// Truncated headers or a payload that does not decode.
    Malformed,
}

fn record_drop(stage: FilterDrop) {
    metrics::DATAGRAMS_DROPPED.increment();
    match stage {
        FilterDrop::WrongEtherAddr => metrics::DROPPED_WRONG_ETHER_ADDR.increment(),
        FilterDrop::WrongEtherType => metrics::DROPPED_WRONG_ETHER_TYPE.increment(),
        FilterDrop::WrongIpAddr => metrics::DROPPED_WRONG_IP_ADDR.increment(),
        FilterDrop::WrongProtocol => metrics::DROPPED_WRONG_PROTOCOL.increment(),
        FilterDrop::WrongUdpPort => metrics::DROPPED_WRONG_UDP_PORT.increment(),
        FilterDrop::Malformed => metrics::DROPPED_MALFORMED.increment(),
    };
}

/// State of one datagram queue.
#[derive(Default)]
pub(crate) struct DatagramQueue {
    bound: Option<SocketAddrV4>,
    peer: Option<SocketAddrV4>,
    backlog: VecDeque<BytesMut>,
}

impl DatagramQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound_addr(&self) -> Option<SocketAddrV4> {
        self.bound
    }

    /// Record the local address. The wildcard IP is replaced by the
    /// device's configured address.
    pub fn bind(
        &mut self,
        addr: SocketAddrV4,
        device_mac: EtherAddr,
        book: &AddressBook,
    ) -> Result<(), Error> {
        if self.bound.is_some() {
            return Err(Error::Busy);
        }
        if addr.port() == 0 {
            return Err(Error::InvalidArgument("bind requires a nonzero port"));
        }
        let ip = if *addr.ip() == Ipv4Addr::UNSPECIFIED {
            book.ip_for_mac(device_mac)
                .ok_or(Error::InvalidArgument("device has no configured address"))?
        } else {
            *addr.ip()
        };
        self.bound = Some(SocketAddrV4::new(ip, addr.port()));
        Ok(())
    }

    /// Record a default peer. No handshake happens.
    pub fn connect(&mut self, addr: SocketAddrV4) -> Result<(), Error> {
        if self.bound.is_some() || self.peer.is_some() {
            return Err(Error::Busy);
        }
        self.peer = Some(addr);
        Ok(())
    }

    /// Forget the local address and default peer; free backlogged frames.
    pub fn close(&mut self) {
        self.bound = None;
        self.peer = None;
        self.backlog.clear();
    }

    /// Validate a push and build its frame.
    pub fn prepare_push(
        &self,
        sga: SgArray,
        device_mac: EtherAddr,
        book: &AddressBook,
        config: &Config,
    ) -> Result<TaskState, Error> {
        if sga.num_segs() == 0 {
            return Err(Error::InvalidArgument("push requires at least one segment"));
        }
        if sga.num_segs() > config.max_segments as usize {
            return Err(Error::InvalidArgument("too many segments"));
        }
        let dst = sga
            .peer()
            .or(self.peer)
            .ok_or(Error::InvalidArgument("no destination address"))?;
        let payload_len = sga.total_len();
        let frame = self.build_frame(&sga, dst, device_mac, book, config)?;
        Ok(TaskState::DatagramPush(DatagramPushState {
            frame: Some(frame),
            payload_len,
        }))
    }

    /// Frame layout, outside in: Ethernet, IPv4, UDP, then the segment
    /// payload.
    fn build_frame(
        &self,
        sga: &SgArray,
        dst: SocketAddrV4,
        device_mac: EtherAddr,
        book: &AddressBook,
        config: &Config,
    ) -> Result<BytesMut, Error> {
        let slices = sga.seg_slices();
        let payload_len = datagram::encoded_len(&slices);
        let frame_len = Config::DATAGRAM_OVERHEAD + payload_len;
        if frame_len > config.mtu {
            return Err(Error::InvalidArgument("message exceeds MTU"));
        }

        let src_ip = match self.bound {
            Some(bound) => *bound.ip(),
            None => book.ip_for_mac(device_mac).unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        let src_port = self.bound.map(|b| b.port()).unwrap_or_else(|| dst.port());

        let mut frame = BytesMut::zeroed(frame_len);
        let mut at = 0;
        at += EtherHeader::ipv4(device_mac, book.mac_for_ip(*dst.ip())).encode(&mut frame[at..]);
        at += Ipv4Header::udp(
            src_ip,
            *dst.ip(),
            (IPV4_HEADER_SIZE + UDP_HEADER_SIZE + payload_len) as u16,
        )
        .encode(&mut frame[at..]);
        at += UdpHeader::new(src_port, dst.port(), payload_len as u16).encode(&mut frame[at..]);
        datagram::encode_payload(&slices, &mut frame[at..]);
        Ok(frame)
    }

    /// Offer the frame to the device. A rejected burst leaves the task
    /// pending; a single-frame burst cannot be partially accepted.
    pub fn progress_push(
        &mut self,
        device: &mut dyn NetDevice,
        state: &mut DatagramPushState,
    ) -> Option<Result<Completion, Error>> {
        let mut burst = vec![state.frame.take().expect("datagram already transmitted")];
        if device.tx_burst(&mut burst) == 0 {
            state.frame = Some(burst.pop().unwrap());
            return None;
        }
        metrics::DATAGRAMS_SENT.increment();
        metrics::BYTES_PUSHED.add(state.payload_len as u64);
        Some(Ok(Completion::Push(state.payload_len)))
    }

    /// Take the next frame that passes the filter, if any.
    pub fn progress_pop(
        &mut self,
        device: &mut dyn NetDevice,
        config: &Config,
    ) -> Option<Result<Completion, Error>> {
        if self.backlog.is_empty() {
            let space = config.backlog_bound.saturating_sub(self.backlog.len());
            let max = (config.rx_burst as usize).min(space);
            if max == 0 {
                return None;
            }
            let mut pulled = Vec::new();
            if device.rx_burst(&mut pulled, max) == 0 {
                return None;
            }
            self.backlog.extend(pulled);
        }

        let frame = self.backlog.pop_front().unwrap();
        let (src, payload) = match self.screen(&frame, device.mac_addr()) {
            Ok(hit) => hit,
            Err(stage) => {
                record_drop(stage);
                return None;
            }
        };

        match datagram::decode_payload(payload) {
            Ok(segs) => {
                let mut sga = SgArray::from_segs(segs);
                sga.set_peer(src);
                if sga.num_segs() > config.max_segments as usize {
                    record_drop(FilterDrop::Malformed);
                    return None;
                }
                let len = sga.total_len();
                metrics::DATAGRAMS_RECEIVED.increment();
                metrics::BYTES_POPPED.add(len as u64);
                Some(Ok(Completion::Pop(sga)))
            }
            Err(ParseError::OutOfMemory) => Some(Err(Error::OutOfMemory)),
            Err(_) => {
                record_drop(FilterDrop::Malformed);
                None
            }
        }
    }

    /// Apply the receive filter chain. Returns the sender's address and
    /// the UDP payload on a pass; an error names the stage that dropped
    /// the frame.
    fn screen<'a>(
        &self,
        frame: &'a [u8],
        device_mac: EtherAddr,
    ) -> Result<(SocketAddrV4, &'a [u8]), FilterDrop> {
        let ether = EtherHeader::parse(frame).map_err(|_| FilterDrop::Malformed)?;
        if ether.dst != device_mac {
            return Err(FilterDrop::WrongEtherAddr);
        }
        if ether.ethertype != ETHERTYPE_IPV4 {
            return Err(FilterDrop::WrongEtherType);
        }

        let ip = Ipv4Header::parse(&frame[ETHER_HEADER_SIZE..])
            .map_err(|_| FilterDrop::Malformed)?;
        if let Some(bound) = self.bound {
            if ip.dst != *bound.ip() {
                return Err(FilterDrop::WrongIpAddr);
            }
        }
        if ip.protocol != IPPROTO_UDP {
            return Err(FilterDrop::WrongProtocol);
        }

        let udp_at = ETHER_HEADER_SIZE + IPV4_HEADER_SIZE;
        let udp = UdpHeader::parse(&frame[udp_at..]).map_err(|_| FilterDrop::Malformed)?;
        if let Some(bound) = self.bound {
            if udp.dst_port != bound.port() {
                return Err(FilterDrop::WrongUdpPort);
            }
        }

        let payload_at = udp_at + UDP_HEADER_SIZE;
        let payload_len = (udp.len as usize)
            .checked_sub(UDP_HEADER_SIZE)
            .ok_or(FilterDrop::Malformed)?;
        // The link layer may pad short frames; trust the UDP length.
        let payload = frame
            .get(payload_at..payload_at + payload_len)
            .ok_or(FilterDrop::Malformed)?;
        Ok((SocketAddrV4::new(ip.src, udp.src_port), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrbook::AddressEntry;
    use crate::config::ConfigBuilder;
    use crate::device::mem::MemDevice;

    const MAC_A: EtherAddr = EtherAddr([0x02, 0, 0, 0, 0, 0xA]);
    const MAC_B: EtherAddr = EtherAddr([0x02, 0, 0, 0, 0, 0xB]);
    const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 7);

    fn book() -> AddressBook {
        AddressBook::new(vec![
            AddressEntry { mac: MAC_A, ip: IP_A },
            AddressEntry { mac: MAC_B, ip: IP_B },
        ])
    }

    fn push_one(
        queue: &mut DatagramQueue,
        device: &mut MemDevice,
        sga: SgArray,
        config: &Config,
    ) -> usize {
        let state = queue
            .prepare_push(sga, device.mac_addr(), &book(), config)
            .unwrap();
        let TaskState::DatagramPush(mut state) = state else {
            panic!("expected datagram push state");
        };
        match queue.progress_push(device, &mut state) {
            Some(Ok(Completion::Push(n))) => n,
            _ => panic!("push did not complete"),
        }
    }

    #[test]
    fn send_receive_round_trip() {
        let config = Config::default();
        let (mut dev_a, mut dev_b) = MemDevice::wire(MAC_A, MAC_B);

        let mut sender = DatagramQueue::new();
        sender
            .bind(SocketAddrV4::new(IP_A, 4000), MAC_A, &book())
            .unwrap();
        let sga = SgArray::with_peer(
            vec![b"ping".to_vec()],
            SocketAddrV4::new(IP_B, 5000),
        );
        let sent = push_one(&mut sender, &mut dev_a, sga, &config);
        assert_eq!(sent, 4);

        let mut receiver = DatagramQueue::new();
        receiver
            .bind(SocketAddrV4::new(IP_B, 5000), MAC_B, &book())
            .unwrap();
        match receiver.progress_pop(&mut dev_b, &config) {
            Some(Ok(Completion::Pop(sga))) => {
                assert_eq!(sga.segs(), &[b"ping".to_vec()]);
                assert_eq!(sga.peer(), Some(SocketAddrV4::new(IP_A, 4000)));
            }
            _ => panic!("pop did not complete"),
        }
    }

    #[test]
    fn wrong_port_is_dropped() {
        let config = Config::default();
        let (mut dev_a, mut dev_b) = MemDevice::wire(MAC_A, MAC_B);

        let mut sender = DatagramQueue::new();
        let sga = SgArray::with_peer(vec![b"x".to_vec()], SocketAddrV4::new(IP_B, 5001));
        push_one(&mut sender, &mut dev_a, sga, &config);

        let mut receiver = DatagramQueue::new();
        receiver
            .bind(SocketAddrV4::new(IP_B, 5000), MAC_B, &book())
            .unwrap();
        assert!(receiver.progress_pop(&mut dev_b, &config).is_none());
        assert!(receiver.backlog.is_empty());
    }

    #[test]
    fn wrong_mac_is_dropped() {
        let config = Config::default();
        let mut dev = MemDevice::loopback(MAC_A);

        let mut sender = DatagramQueue::new();
        // Destination IP resolves to MAC_B, but the loopback device
        // receives its own frames with MAC_A.
        let sga = SgArray::with_peer(vec![b"x".to_vec()], SocketAddrV4::new(IP_B, 5000));
        push_one(&mut sender, &mut dev, sga, &config);

        let mut receiver = DatagramQueue::new();
        assert!(receiver.progress_pop(&mut dev, &config).is_none());
    }

    #[test]
    fn unbound_pop_accepts_any_port() {
        let config = Config::default();
        let mut dev = MemDevice::loopback(MAC_A);

        let mut sender = DatagramQueue::new();
        let sga = SgArray::with_peer(vec![b"any".to_vec()], SocketAddrV4::new(IP_A, 12345));
        push_one(&mut sender, &mut dev, sga, &config);

        let mut receiver = DatagramQueue::new();
        match receiver.progress_pop(&mut dev, &config) {
            Some(Ok(Completion::Pop(sga))) => assert_eq!(sga.segs(), &[b"any".to_vec()]),
            _ => panic!("pop did not complete"),
        }
    }

    #[test]
    fn oversize_message_is_refused() {
        let config = Config::default();
        let queue = DatagramQueue::new();
        let sga = SgArray::with_peer(
            vec![vec![0u8; config.mtu]],
            SocketAddrV4::new(IP_B, 5000),
        );
        let err = queue
            .prepare_push(sga, MAC_A, &book(), &config)
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn push_without_destination_is_refused() {
        let config = Config::default();
        let queue = DatagramQueue::new();
        let err = queue
            .prepare_push(SgArray::single(b"x".to_vec()), MAC_A, &book(), &config)
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn rejected_burst_keeps_frame() {
        let config = Config::default();
        let mut dev = MemDevice::loopback(MAC_A);
        dev.push_tx_script(&[0]);

        let mut queue = DatagramQueue::new();
        queue.connect(SocketAddrV4::new(IP_B, 5000)).unwrap();
        let state = queue
            .prepare_push(SgArray::single(b"hi".to_vec()), MAC_A, &book(), &config)
            .unwrap();
        let TaskState::DatagramPush(mut state) = state else {
            panic!("expected datagram push state");
        };

        assert!(queue.progress_push(&mut dev, &mut state).is_none());
        match queue.progress_push(&mut dev, &mut state) {
            Some(Ok(Completion::Push(2))) => {}
            _ => panic!("retry did not complete"),
        }
    }

    #[test]
    fn screen_reports_the_failing_stage() {
        let config = Config::default();
        let mut dev = MemDevice::loopback(MAC_A);

        let mut sender = DatagramQueue::new();
        sender.connect(SocketAddrV4::new(IP_A, 5000)).unwrap();
        push_one(&mut sender, &mut dev, SgArray::single(b"x".to_vec()), &config);
        let mut frames = Vec::new();
        assert_eq!(dev.rx_burst(&mut frames, 4), 1);
        let frame = &frames[0];

        // Destination port 5000, bound to 6000.
        let mut wrong_port = DatagramQueue::new();
        wrong_port
            .bind(SocketAddrV4::new(IP_A, 6000), MAC_A, &book())
            .unwrap();
        assert_eq!(
            wrong_port.screen(frame, MAC_A).unwrap_err(),
            FilterDrop::WrongUdpPort
        );

        // Same frame seen by a device with another MAC.
        assert_eq!(
            wrong_port.screen(frame, MAC_B).unwrap_err(),
            FilterDrop::WrongEtherAddr
        );

        // Bound to an address the frame is not for.
        let mut wrong_ip = DatagramQueue::new();
        wrong_ip
            .bind(SocketAddrV4::new(IP_B, 5000), MAC_B, &book())
            .unwrap();
        assert_eq!(
            wrong_ip.screen(frame, MAC_A).unwrap_err(),
            FilterDrop::WrongIpAddr
        );

        let unbound = DatagramQueue::new();
        assert!(unbound.screen(frame, MAC_A).is_ok());

        let mut bad_type = frame.clone();
        bad_type[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(
            unbound.screen(&bad_type, MAC_A).unwrap_err(),
            FilterDrop::WrongEtherType
        );

        let mut bad_proto = frame.clone();
        bad_proto[ETHER_HEADER_SIZE + 9] = 6;
        assert_eq!(
            unbound.screen(&bad_proto, MAC_A).unwrap_err(),
            FilterDrop::WrongProtocol
        );

        assert_eq!(
            unbound.screen(&frame[..10], MAC_A).unwrap_err(),
            FilterDrop::Malformed
        );
    }

    #[test]
    fn backlog_pull_respects_bound() {
        let config = ConfigBuilder::new().backlog_bound(2).build().unwrap();
        let mut dev = MemDevice::loopback(MAC_A);

        let mut sender = DatagramQueue::new();
        sender.connect(SocketAddrV4::new(IP_A, 5001)).unwrap();
        for _ in 0..3 {
            push_one(&mut sender, &mut dev, SgArray::single(b"x".to_vec()), &config);
        }

        let mut receiver = DatagramQueue::new();
        receiver
            .bind(SocketAddrV4::new(IP_A, 5000), MAC_A, &book())
            .unwrap();

        // Only two of the three waiting frames fit the backlog; the head
        // is screened out (wrong port) and freed.
        assert!(receiver.progress_pop(&mut dev, &config).is_none());
        assert_eq!(receiver.backlog.len(), 1);

        // The rest drain one screening per step.
        assert!(receiver.progress_pop(&mut dev, &config).is_none());
        assert!(receiver.backlog.is_empty());
        assert!(receiver.progress_pop(&mut dev, &config).is_none());
    }

    #[test]
    fn bind_twice_is_busy() {
        let mut queue = DatagramQueue::new();
        queue
            .bind(SocketAddrV4::new(IP_A, 4000), MAC_A, &book())
            .unwrap();
        assert!(matches!(
            queue.bind(SocketAddrV4::new(IP_A, 4001), MAC_A, &book()),
            Err(Error::Busy)
        ));
    }

    #[test]
    fn wildcard_bind_uses_device_address() {
        let mut queue = DatagramQueue::new();
        queue
            .bind(
                SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 4000),
                MAC_A,
                &book(),
            )
            .unwrap();
        assert_eq!(queue.bound_addr(), Some(SocketAddrV4::new(IP_A, 4000)));
    }

    #[test]
    fn connect_after_bind_is_rejected() {
        let mut queue = DatagramQueue::new();
        queue
            .bind(SocketAddrV4::new(IP_A, 4000), MAC_A, &book())
            .unwrap();
        assert!(matches!(
            queue.connect(SocketAddrV4::new(IP_B, 5000)),
            Err(Error::Busy)
        ));
    }
}
