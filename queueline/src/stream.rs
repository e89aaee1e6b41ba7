//! Stream transport adapter.
//!
//! Each stream queue owns one endpoint of the user-space TCP stack and
//! speaks the length-delimited framing from [`protocol_sga::frame`].
//! Endpoints run non-blocking and are registered with the stack's
//! edge-triggered poller for the directions that have work outstanding.
//!
//! A framing violation from the peer (bad magic, oversize or malformed
//! payload) poisons the connection: the offending task fails with a
//! protocol error and every later operation on the queue fails with
//! `Closed`.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddrV4;

use protocol_sga::frame::{DecodeProgress, FRAME_HEADER_SIZE};
use protocol_sga::{FrameDecoder, FrameHeader};

use crate::config::Config;
use crate::device::{EndpointId, Interest, TcpStack};
use crate::error::Error;
use crate::metrics;
use crate::queue::Qd;
use crate::sga::SgArray;
use crate::task::{Completion, TaskState};

/// Resumable state of one framed write.
pub(crate) struct StreamPushState {
    sga: SgArray,
    header: [u8; FRAME_HEADER_SIZE],
    /// Big-endian per-segment length prefixes, kept stable so each retry
    /// can rebuild the iovec list.
    prefixes: Vec<[u8; 8]>,
    /// Frame bytes already accepted by the endpoint.
    sent: usize,
    total: usize,
}

impl StreamPushState {
    fn new(magic: u64, sga: SgArray) -> Self {
        let slices = sga.seg_slices();
        let header = FrameHeader::for_segments(magic, &slices);
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        header.encode(&mut header_buf);
        let prefixes = slices
            .iter()
            .map(|s| (s.len() as u64).to_be_bytes())
            .collect();
        let total = FRAME_HEADER_SIZE + header.payload_len as usize;
        Self {
            sga,
            header: header_buf,
            prefixes,
            sent: 0,
            total,
        }
    }

    /// Whether any frame bytes have reached the wire.
    pub fn started(&self) -> bool {
        self.sent > 0
    }

    /// The unsent tail of the frame as an iovec list: header, then each
    /// segment's length prefix and bytes, with `sent` bytes skipped.
    fn remaining(&self) -> Vec<IoSlice<'_>> {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + 2 * self.prefixes.len());
        parts.push(&self.header);
        for (prefix, seg) in self.prefixes.iter().zip(self.sga.segs()) {
            parts.push(prefix);
            parts.push(seg);
        }

        let mut skip = self.sent;
        let mut out = Vec::new();
        for part in parts {
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            out.push(IoSlice::new(&part[skip..]));
            skip = 0;
        }
        out
    }
}

/// State of one stream queue.
pub(crate) struct StreamQueue {
    ep: EndpointId,
    listening: bool,
    poisoned: bool,
    /// Interest currently registered with the poller; `None` until first
    /// registration.
    interest: Option<Interest>,
    /// Accepted children not yet claimed by `accept`.
    accepts: VecDeque<(Qd, SocketAddrV4)>,
    /// Decoder fed by `peek` before any pop task adopts it.
    stash: Option<FrameDecoder>,
}

impl StreamQueue {
    /// Create a fresh endpoint. Nagle batching is disabled up front.
    pub fn open(stack: &mut dyn TcpStack) -> Result<Self, Error> {
        let ep = stack.socket()?;
        stack.set_nodelay(ep, true)?;
        Ok(Self::wrap(ep))
    }

    /// Wrap an endpoint accepted from a listener: non-blocking, Nagle off,
    /// registered for reads only.
    pub fn adopt(stack: &mut dyn TcpStack, ep: EndpointId) -> Result<Self, Error> {
        stack.set_nodelay(ep, true)?;
        stack.set_nonblocking(ep, true)?;
        stack.register(ep, Interest::READ)?;
        let mut queue = Self::wrap(ep);
        queue.interest = Some(Interest::READ);
        Ok(queue)
    }

    fn wrap(ep: EndpointId) -> Self {
        Self {
            ep,
            listening: false,
            poisoned: false,
            interest: None,
            accepts: VecDeque::new(),
            stash: None,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn bind(&mut self, stack: &mut dyn TcpStack, addr: SocketAddrV4) -> Result<(), Error> {
        stack.bind(self.ep, addr)?;
        Ok(())
    }

    pub fn listen(&mut self, stack: &mut dyn TcpStack, backlog: usize) -> Result<(), Error> {
        stack.listen(self.ep, backlog)?;
        stack.set_nonblocking(self.ep, true)?;
        self.listening = true;
        Ok(())
    }

    pub fn connect(&mut self, stack: &mut dyn TcpStack, addr: SocketAddrV4) -> Result<(), Error> {
        stack.connect(self.ep, addr)?;
        stack.set_nonblocking(self.ep, true)?;
        self.ensure_interest(stack, Interest::WRITE)?;
        Ok(())
    }

    pub fn close(&mut self, stack: &mut dyn TcpStack) -> Result<(), Error> {
        let _ = stack.deregister(self.ep);
        stack.close(self.ep)?;
        Ok(())
    }

    /// Poison the connection and tear the endpoint down. Used when a
    /// partially transmitted push is dropped: the wire is mid-frame and
    /// cannot be resynchronized.
    pub fn abort(&mut self, stack: &mut dyn TcpStack) {
        self.poisoned = true;
        let _ = stack.deregister(self.ep);
        let _ = stack.close(self.ep);
    }

    pub fn local_addr(&self, stack: &dyn TcpStack) -> Result<SocketAddrV4, Error> {
        Ok(stack.local_addr(self.ep)?)
    }

    /// Pending accepted children, oldest first.
    pub fn accepts(&mut self) -> &mut VecDeque<(Qd, SocketAddrV4)> {
        &mut self.accepts
    }

    /// Widen the registered poller interest to include `add`.
    fn ensure_interest(&mut self, stack: &mut dyn TcpStack, add: Interest) -> Result<(), Error> {
        match self.interest {
            None => {
                stack.register(self.ep, add)?;
                self.interest = Some(add);
            }
            Some(current) if !current.contains(add) => {
                let want = current | add;
                stack.modify(self.ep, want)?;
                self.interest = Some(want);
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Validate and stage a push.
    pub fn prepare_push(
        &mut self,
        stack: &mut dyn TcpStack,
        sga: SgArray,
        config: &Config,
    ) -> Result<TaskState, Error> {
        if self.poisoned {
            return Err(Error::Closed);
        }
        if self.listening {
            return Err(Error::Unsupported);
        }
        if sga.num_segs() == 0 {
            return Err(Error::InvalidArgument("push requires at least one segment"));
        }
        if sga.num_segs() > config.max_segments as usize {
            return Err(Error::InvalidArgument("too many segments"));
        }
        let state = StreamPushState::new(config.frame_magic, sga);
        if (state.total - FRAME_HEADER_SIZE) as u64 > config.max_payload_len {
            return Err(Error::InvalidArgument("payload exceeds maximum frame length"));
        }
        self.ensure_interest(stack, Interest::WRITE)?;
        Ok(TaskState::StreamPush(state))
    }

    /// Stage a pop. On a listening queue this waits for a connection; on a
    /// connected queue it adopts any decoder the peek path started.
    pub fn prepare_pop(
        &mut self,
        stack: &mut dyn TcpStack,
        config: &Config,
    ) -> Result<TaskState, Error> {
        if self.poisoned {
            return Err(Error::Closed);
        }
        self.ensure_interest(stack, Interest::READ)?;
        if self.listening {
            return Ok(TaskState::Accept);
        }
        let decoder = self
            .stash
            .take()
            .unwrap_or_else(|| FrameDecoder::new(config.frame_magic, config.max_payload_len));
        Ok(TaskState::StreamPop {
            decoder: Some(decoder),
        })
    }

    /// Advance a framed write. `None` leaves the task pending.
    pub fn progress_push(
        &mut self,
        stack: &mut dyn TcpStack,
        state: &mut StreamPushState,
    ) -> Option<Result<Completion, Error>> {
        if self.poisoned {
            return Some(Err(Error::Closed));
        }
        let res = {
            let bufs = state.remaining();
            stack.writev(self.ep, &bufs)
        };
        match res {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                metrics::WOULD_BLOCK_YIELDS.increment();
                None
            }
            Err(err) => Some(Err(Error::TransportIo(err))),
            Ok(n) => {
                state.sent += n;
                if state.sent < state.total {
                    return None;
                }
                let payload = state.sga.total_len();
                metrics::FRAMES_SENT.increment();
                metrics::BYTES_PUSHED.add(payload as u64);
                Some(Ok(Completion::Push(payload)))
            }
        }
    }

    /// Advance a framed read. `None` leaves the task pending.
    pub fn progress_pop(
        &mut self,
        stack: &mut dyn TcpStack,
        decoder: &mut Option<FrameDecoder>,
        config: &Config,
    ) -> Option<Result<Completion, Error>> {
        if self.poisoned {
            return Some(Err(Error::Closed));
        }
        match self.fill(stack, decoder.as_mut().expect("pop without decoder")) {
            Ok(false) => None,
            Ok(true) => Some(self.decode(decoder, config).map(Completion::Pop)),
            Err(err) => Some(Err(err)),
        }
    }

    /// Non-enqueuing receive attempt: decode a frame only if it can be
    /// completed from bytes already available.
    pub fn peek(
        &mut self,
        stack: &mut dyn TcpStack,
        config: &Config,
    ) -> Result<Option<SgArray>, Error> {
        if self.poisoned {
            return Err(Error::Closed);
        }
        if self.listening {
            return Err(Error::Unsupported);
        }
        let mut decoder = Some(self.stash.take().unwrap_or_else(|| {
            FrameDecoder::new(config.frame_magic, config.max_payload_len)
        }));
        match self.fill(stack, decoder.as_mut().unwrap()) {
            Ok(true) => self.decode(&mut decoder, config).map(Some),
            Ok(false) => {
                // Keep the partial frame for the next peek or pop.
                self.stash = decoder;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Read until the decoder has a whole frame or the endpoint has no
    /// more bytes. `Ok(true)` means a frame is fully buffered. Framing
    /// violations and endpoint errors poison the queue.
    fn fill(&mut self, stack: &mut dyn TcpStack, decoder: &mut FrameDecoder) -> Result<bool, Error> {
        loop {
            let space = decoder.space();
            if space.is_empty() {
                return Ok(true);
            }
            match stack.read(self.ep, space) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    metrics::WOULD_BLOCK_YIELDS.increment();
                    return Ok(false);
                }
                Err(err) => {
                    self.poisoned = true;
                    return Err(Error::TransportIo(err));
                }
                Ok(0) => {
                    self.poisoned = true;
                    return Err(Error::Closed);
                }
                Ok(n) => match decoder.advance(n) {
                    Ok(DecodeProgress::NeedMore) => {}
                    Ok(DecodeProgress::Complete) => return Ok(true),
                    Err(err) => {
                        self.poisoned = true;
                        return Err(err.into());
                    }
                },
            }
        }
    }

    /// Turn a fully buffered frame into a message.
    fn decode(
        &mut self,
        decoder: &mut Option<FrameDecoder>,
        config: &Config,
    ) -> Result<SgArray, Error> {
        let decoder = decoder.take().expect("decode without decoder");
        match decoder.finish() {
            Ok((header, segs)) => {
                if header.num_segs > config.max_segments as u64 {
                    self.poisoned = true;
                    return Err(Error::Protocol("too many segments in frame"));
                }
                let sga = SgArray::from_segs(segs);
                metrics::FRAMES_RECEIVED.increment();
                metrics::BYTES_POPPED.add(sga.total_len() as u64);
                Ok(sga)
            }
            Err(err) => {
                self.poisoned = true;
                Err(err.into())
            }
        }
    }

    /// Take one pending connection off the listener. The parent is left
    /// non-blocking; the caller wraps the child via [`StreamQueue::adopt`].
    pub fn try_accept(
        &mut self,
        stack: &mut dyn TcpStack,
    ) -> io::Result<(EndpointId, SocketAddrV4)> {
        let (child, peer) = stack.accept(self.ep)?;
        stack.set_nonblocking(self.ep, true)?;
        Ok((child, peer))
    }
}
