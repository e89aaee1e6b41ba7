//! Queue descriptors and the descriptor table.

use std::collections::HashMap;
use std::fmt;

use crate::datagram::DatagramQueue;
use crate::error::Error;
use crate::stream::StreamQueue;
use crate::task::TaskTable;

/// Queue descriptor: a positive integer, stable and unique for the
/// lifetime of its queue. Zero is reserved as "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Qd(u32);

impl Qd {
    /// The raw descriptor value.
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Qd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The transport behind a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Framed byte stream over the user-space TCP stack.
    Stream,
    /// Single-datagram messages over the NIC driver.
    Datagram,
}

/// Transport state for one queue.
pub(crate) enum Queue {
    Stream(StreamQueue),
    Datagram(DatagramQueue),
}

impl Queue {
    pub fn kind(&self) -> QueueKind {
        match self {
            Queue::Stream(_) => QueueKind::Stream,
            Queue::Datagram(_) => QueueKind::Datagram,
        }
    }
}

/// A queue plus its outstanding operations.
pub(crate) struct QueueSlot {
    pub queue: Queue,
    pub tasks: TaskTable,
}

/// Process of issuing descriptors and finding queues by descriptor.
///
/// Descriptors increase monotonically and are never reissued, so a stale
/// descriptor can only miss, never alias a newer queue.
pub(crate) struct QueueTable {
    next: u32,
    map: HashMap<u32, QueueSlot>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self {
            next: 1,
            map: HashMap::new(),
        }
    }

    /// Install a queue under a fresh descriptor.
    pub fn create(&mut self, queue: Queue) -> Qd {
        let qd = Qd(self.next);
        self.next += 1;
        self.map.insert(
            qd.0,
            QueueSlot {
                queue,
                tasks: TaskTable::new(),
            },
        );
        qd
    }

    pub fn get(&self, qd: Qd) -> Result<&QueueSlot, Error> {
        self.map.get(&qd.0).ok_or(Error::UnknownDescriptor(qd))
    }

    pub fn get_mut(&mut self, qd: Qd) -> Result<&mut QueueSlot, Error> {
        self.map.get_mut(&qd.0).ok_or(Error::UnknownDescriptor(qd))
    }

    /// Remove a queue. Fails with `Busy` while operations are outstanding.
    pub fn destroy(&mut self, qd: Qd) -> Result<Queue, Error> {
        let slot = self.map.get(&qd.0).ok_or(Error::UnknownDescriptor(qd))?;
        if !slot.tasks.is_empty() {
            return Err(Error::Busy);
        }
        Ok(self.map.remove(&qd.0).unwrap().queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::DatagramQueue;

    fn datagram_queue() -> Queue {
        Queue::Datagram(DatagramQueue::new())
    }

    #[test]
    fn descriptors_are_distinct_and_increasing() {
        let mut table = QueueTable::new();
        let a = table.create(datagram_queue());
        let b = table.create(datagram_queue());
        assert_ne!(a, b);
        assert!(b > a);
        assert!(a.raw() > 0);
    }

    #[test]
    fn destroyed_descriptor_is_never_reissued() {
        let mut table = QueueTable::new();
        let a = table.create(datagram_queue());
        table.destroy(a).unwrap();
        let b = table.create(datagram_queue());
        assert_ne!(a, b);
        assert!(table.get(a).is_err());
        assert!(table.get(b).is_ok());
    }

    #[test]
    fn unknown_descriptor() {
        let mut table = QueueTable::new();
        let qd = table.create(datagram_queue());
        table.destroy(qd).unwrap();
        assert!(matches!(table.get(qd), Err(Error::UnknownDescriptor(_))));
        assert!(matches!(
            table.destroy(qd),
            Err(Error::UnknownDescriptor(_))
        ));
    }

    #[test]
    fn destroy_with_outstanding_tasks_is_busy() {
        use crate::task::{Task, TaskState};
        use crate::token::QToken;

        let mut table = QueueTable::new();
        let qd = table.create(datagram_queue());
        table
            .get_mut(qd)
            .unwrap()
            .tasks
            .insert(Task::new(QToken::pop(1), TaskState::DatagramPop))
            .unwrap();
        assert!(matches!(table.destroy(qd), Err(Error::Busy)));
    }
}
