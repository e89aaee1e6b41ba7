//! The queue runtime.
//!
//! Owns the descriptor table and the device handles for one carrier
//! thread, and drives every outstanding operation cooperatively: each
//! progress step advances the task at the head of a queue's work FIFO
//! until the underlying device would block. Nothing here sleeps; `wait`
//! spins progress with a step bound of one until the named task is done.

use std::io;
use std::net::SocketAddrV4;

use crate::addrbook::AddressBook;
use crate::config::Config;
use crate::datagram::DatagramQueue;
use crate::device::{NetDevice, TcpStack};
use crate::error::Error;
use crate::metrics;
use crate::queue::{Qd, Queue, QueueKind, QueueTable};
use crate::sga::SgArray;
use crate::stream::StreamQueue;
use crate::task::{Completion, Task, TaskState};
use crate::token::{OpKind, QToken};

/// Outcome of a data-plane call.
#[derive(Debug)]
pub enum OpState {
    /// The operation finished; its task is gone.
    Complete(Completion),
    /// The operation is outstanding; present the token to `poll` or
    /// `wait` later.
    Pending,
}

/// A single-threaded queue runtime over one TCP stack and one NIC.
///
/// Queues, tasks, and backlogs are all owned by this value; nothing is
/// shared across threads. A multi-threaded application runs one runtime
/// per carrier thread over disjoint devices.
pub struct Runtime {
    config: Config,
    book: AddressBook,
    stack: Box<dyn TcpStack>,
    device: Box<dyn NetDevice>,
    queues: QueueTable,
}

impl Runtime {
    /// Build a runtime over already-initialized devices.
    pub fn new(
        config: Config,
        stack: Box<dyn TcpStack>,
        device: Box<dyn NetDevice>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let book = AddressBook::new(config.address_book.clone());
        Ok(Self {
            config,
            book,
            stack,
            device,
            queues: QueueTable::new(),
        })
    }

    // ── Control plane ────────────────────────────────────────────────

    /// Create a queue of the given kind and return its descriptor.
    pub fn queue(&mut self, kind: QueueKind) -> Result<Qd, Error> {
        let queue = match kind {
            QueueKind::Stream => Queue::Stream(StreamQueue::open(&mut *self.stack)?),
            QueueKind::Datagram => Queue::Datagram(DatagramQueue::new()),
        };
        metrics::QUEUES_CREATED.increment();
        Ok(self.queues.create(queue))
    }

    /// File-backed queues are not implemented.
    pub fn open(&mut self, _path: &str) -> Result<Qd, Error> {
        Err(Error::Unsupported)
    }

    /// File-backed queues are not implemented.
    pub fn creat(&mut self, _path: &str) -> Result<Qd, Error> {
        Err(Error::Unsupported)
    }

    /// Assign a local address.
    pub fn bind(&mut self, qd: Qd, addr: SocketAddrV4) -> Result<(), Error> {
        let device_mac = self.device.mac_addr();
        match &mut self.queues.get_mut(qd)?.queue {
            Queue::Stream(q) => q.bind(&mut *self.stack, addr),
            Queue::Datagram(q) => q.bind(addr, device_mac, &self.book),
        }
    }

    /// Start accepting connections. Stream queues only.
    pub fn listen(&mut self, qd: Qd, backlog: usize) -> Result<(), Error> {
        match &mut self.queues.get_mut(qd)?.queue {
            Queue::Stream(q) => q.listen(&mut *self.stack, backlog),
            Queue::Datagram(_) => Err(Error::Unsupported),
        }
    }

    /// Claim one accepted connection as a fresh queue.
    ///
    /// Makes one non-blocking acceptance attempt first, so pending
    /// connections surface without a pop task.
    pub fn accept(&mut self, qd: Qd) -> Result<OpState, Error> {
        self.accept_raw(qd)?;
        let slot = self.queues.get_mut(qd)?;
        let Queue::Stream(q) = &mut slot.queue else {
            return Err(Error::Unsupported);
        };
        match q.accepts().pop_front() {
            Some((child, peer)) => Ok(OpState::Complete(Completion::Accepted(child, peer))),
            None => Ok(OpState::Pending),
        }
    }

    /// Connect to a remote address. On a datagram queue this only records
    /// the default peer.
    pub fn connect(&mut self, qd: Qd, addr: SocketAddrV4) -> Result<(), Error> {
        match &mut self.queues.get_mut(qd)?.queue {
            Queue::Stream(q) => q.connect(&mut *self.stack, addr),
            Queue::Datagram(q) => q.connect(addr),
        }
    }

    /// Close a queue. Fails with `Busy` while operations are outstanding.
    pub fn close(&mut self, qd: Qd) -> Result<(), Error> {
        let queue = self.queues.destroy(qd)?;
        metrics::QUEUES_CLOSED.increment();
        match queue {
            Queue::Stream(mut q) => q.close(&mut *self.stack)?,
            Queue::Datagram(mut q) => q.close(),
        }
        Ok(())
    }

    /// The queue's local address.
    pub fn local_addr(&self, qd: Qd) -> Result<SocketAddrV4, Error> {
        match &self.queues.get(qd)?.queue {
            Queue::Stream(q) => q.local_addr(&*self.stack),
            Queue::Datagram(q) => q
                .bound_addr()
                .ok_or(Error::InvalidArgument("queue is not bound")),
        }
    }

    // ── Data plane ───────────────────────────────────────────────────

    /// Submit a message for transmission.
    ///
    /// Validates synchronously (no task is created on a bad argument),
    /// then attempts immediate progress; an operation that cannot finish
    /// now is left pending under `qt`.
    pub fn push(&mut self, qd: Qd, qt: QToken, sga: SgArray) -> Result<OpState, Error> {
        if qt.kind() != OpKind::Push {
            return Err(Error::InvalidArgument("token does not name a push"));
        }
        let device_mac = self.device.mac_addr();
        let slot = self.queues.get_mut(qd)?;
        if slot.tasks.get(qt).is_some() {
            return Err(Error::Busy);
        }
        let state = match &mut slot.queue {
            Queue::Stream(q) => q.prepare_push(&mut *self.stack, sga, &self.config)?,
            Queue::Datagram(q) => q.prepare_push(sga, device_mac, &self.book, &self.config)?,
        };
        slot.tasks.insert(Task::new(qt, state))?;
        self.progress(qd, 1)?;
        self.take_if_done(qd, qt)
    }

    /// Submit a receive.
    ///
    /// On a listening stream queue this waits for a connection and
    /// completes with the accepted child descriptor.
    pub fn pop(&mut self, qd: Qd, qt: QToken) -> Result<OpState, Error> {
        if qt.kind() != OpKind::Pop {
            return Err(Error::InvalidArgument("token does not name a pop"));
        }
        let slot = self.queues.get_mut(qd)?;
        if slot.tasks.get(qt).is_some() {
            return Err(Error::Busy);
        }
        let state = match &mut slot.queue {
            Queue::Stream(q) => q.prepare_pop(&mut *self.stack, &self.config)?,
            Queue::Datagram(_) => TaskState::DatagramPop,
        };
        slot.tasks.insert(Task::new(qt, state))?;
        self.progress(qd, 1)?;
        self.take_if_done(qd, qt)
    }

    /// Non-blocking observation of an outstanding operation.
    ///
    /// A completed task is consumed: `poll` reports it done exactly once
    /// and the token is unknown afterwards.
    pub fn poll(&mut self, qd: Qd, qt: QToken) -> Result<OpState, Error> {
        let slot = self.queues.get_mut(qd)?;
        let task = slot
            .tasks
            .get(qt)
            .ok_or(Error::UnknownToken(qt.raw()))?;
        if !task.is_done() {
            return Ok(OpState::Pending);
        }
        let task = slot.tasks.remove(qt).unwrap();
        task.into_result().map(OpState::Complete)
    }

    /// Block until the named operation completes, driving progress one
    /// step at a time, then consume it like `poll`.
    pub fn wait(&mut self, qd: Qd, qt: QToken) -> Result<Completion, Error> {
        loop {
            let slot = self.queues.get_mut(qd)?;
            let task = slot
                .tasks
                .get(qt)
                .ok_or(Error::UnknownToken(qt.raw()))?;
            if task.is_done() {
                let task = slot.tasks.remove(qt).unwrap();
                return task.into_result();
            }
            self.progress(qd, 1)?;
        }
    }

    /// Abandon an outstanding operation, releasing whatever it holds.
    ///
    /// A push already partially on the wire cannot be taken back; the
    /// endpoint is closed and poisoned so the peer never sees a torn
    /// frame as data.
    pub fn drop_task(&mut self, qd: Qd, qt: QToken) -> Result<(), Error> {
        let slot = self.queues.get_mut(qd)?;
        let task = slot
            .tasks
            .remove(qt)
            .ok_or(Error::UnknownToken(qt.raw()))?;
        if let TaskState::StreamPush(state) = task.state() {
            if !task.is_done() && state.started() {
                if let Queue::Stream(q) = &mut slot.queue {
                    q.abort(&mut *self.stack);
                }
            }
        }
        Ok(())
    }

    /// Decode a ready frame without enqueuing a task. Stream queues only;
    /// refused while a pop is outstanding, which owns the byte stream.
    pub fn peek(&mut self, qd: Qd) -> Result<OpState, Error> {
        let slot = self.queues.get_mut(qd)?;
        let Queue::Stream(q) = &mut slot.queue else {
            return Err(Error::Unsupported);
        };
        if slot.tasks.has_kind(OpKind::Pop) {
            return Err(Error::Busy);
        }
        match q.peek(&mut *self.stack, &self.config)? {
            Some(sga) => Ok(OpState::Complete(Completion::Pop(sga))),
            None => Ok(OpState::Pending),
        }
    }

    /// Drive up to `max_steps` progress steps on a queue's work FIFO.
    ///
    /// Each step advances the head task once; a task that completes is
    /// retired from the FIFO, a task that cannot progress stays at the
    /// head for the next cycle.
    pub fn progress(&mut self, qd: Qd, max_steps: usize) -> Result<(), Error> {
        for _ in 0..max_steps {
            let Some(qt) = self.queues.get_mut(qd)?.tasks.head() else {
                return Ok(());
            };
            if self.step(qd, qt)? {
                self.queues.get_mut(qd)?.tasks.retire_head();
            }
        }
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Consume a task that completed during submission, if it did.
    fn take_if_done(&mut self, qd: Qd, qt: QToken) -> Result<OpState, Error> {
        let slot = self.queues.get_mut(qd)?;
        match slot.tasks.get(qt) {
            Some(task) if task.is_done() => {
                let task = slot.tasks.remove(qt).unwrap();
                task.into_result().map(OpState::Complete)
            }
            Some(_) => Ok(OpState::Pending),
            None => Err(Error::UnknownToken(qt.raw())),
        }
    }

    /// One progress invocation on one task. Returns true once the task is
    /// done and should leave the FIFO.
    fn step(&mut self, qd: Qd, qt: QToken) -> Result<bool, Error> {
        // Accept needs the descriptor table to mint the child queue, so
        // it cannot run under the in-place borrows below.
        {
            let slot = self.queues.get_mut(qd)?;
            let task = slot.tasks.get(qt).ok_or(Error::UnknownToken(qt.raw()))?;
            if task.is_done() {
                return Ok(true);
            }
            if matches!(task.state(), TaskState::Accept) {
                return self.step_accept(qd, qt);
            }
        }

        let slot = self.queues.get_mut(qd)?;
        let task = slot
            .tasks
            .get_mut(qt)
            .ok_or(Error::UnknownToken(qt.raw()))?;
        let outcome = match task.state_mut() {
            TaskState::StreamPush(state) => {
                let Queue::Stream(q) = &mut slot.queue else {
                    unreachable!("stream task on non-stream queue")
                };
                q.progress_push(&mut *self.stack, state)
            }
            TaskState::StreamPop { decoder } => {
                let Queue::Stream(q) = &mut slot.queue else {
                    unreachable!("stream task on non-stream queue")
                };
                q.progress_pop(&mut *self.stack, decoder, &self.config)
            }
            TaskState::DatagramPush(state) => {
                let Queue::Datagram(q) = &mut slot.queue else {
                    unreachable!("datagram task on non-datagram queue")
                };
                q.progress_push(&mut *self.device, state)
            }
            TaskState::DatagramPop => {
                let Queue::Datagram(q) = &mut slot.queue else {
                    unreachable!("datagram task on non-datagram queue")
                };
                q.progress_pop(&mut *self.device, &self.config)
            }
            TaskState::Accept => unreachable!("handled above"),
        };

        match outcome {
            Some(result) => {
                task.complete(result);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drive an accept task one step.
    fn step_accept(&mut self, qd: Qd, qt: QToken) -> Result<bool, Error> {
        let outcome = match self.accept_raw(qd) {
            Ok(None) => return Ok(false),
            Ok(Some((child, peer))) => Ok(Completion::Accepted(child, peer)),
            Err(err) => Err(err),
        };
        let slot = self.queues.get_mut(qd)?;
        let task = slot
            .tasks
            .get_mut(qt)
            .ok_or(Error::UnknownToken(qt.raw()))?;
        task.complete(outcome);
        Ok(true)
    }

    /// One non-blocking acceptance attempt. A taken connection becomes a
    /// fresh queue, registered for reads only, and is recorded in the
    /// listener's accept FIFO.
    fn accept_raw(&mut self, qd: Qd) -> Result<Option<(Qd, SocketAddrV4)>, Error> {
        let raw = {
            let slot = self.queues.get_mut(qd)?;
            let Queue::Stream(q) = &mut slot.queue else {
                return Err(Error::Unsupported);
            };
            if !q.is_listening() {
                return Err(Error::InvalidArgument("queue is not listening"));
            }
            match q.try_accept(&mut *self.stack) {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    metrics::WOULD_BLOCK_YIELDS.increment();
                    return Ok(None);
                }
                Err(err) => return Err(Error::TransportIo(err)),
            }
        };

        let child = StreamQueue::adopt(&mut *self.stack, raw.0)?;
        let child_qd = self.queues.create(Queue::Stream(child));
        metrics::QUEUES_CREATED.increment();
        metrics::CONNECTIONS_ACCEPTED.increment();

        let slot = self.queues.get_mut(qd)?;
        let Queue::Stream(q) = &mut slot.queue else {
            unreachable!("listener changed kind")
        };
        q.accepts().push_back((child_qd, raw.1));
        Ok(Some((child_qd, raw.1)))
    }
}
