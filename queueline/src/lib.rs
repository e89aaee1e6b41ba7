//! queueline — token-based I/O queues over kernel-bypass transports.
//!
//! queueline exposes a uniform, asynchronous queue abstraction over two
//! very different carriers: a framed byte stream on a user-space TCP
//! stack, and raw Ethernet/IPv4/UDP datagrams on a NIC poll-mode driver.
//! Applications create a queue descriptor, drive the control plane
//! (bind/listen/accept/connect/close), and submit data-plane operations
//! (push/pop) under caller-chosen tokens; completion is observed later
//! through `poll` or `wait` without ever blocking the carrier thread on
//! the device.
//!
//! # Quick Start
//!
//! ```rust
//! use queueline::device::mem::{MemDevice, MemStack};
//! use queueline::{
//!     Completion, Config, EtherAddr, OpState, QToken, QueueKind, Runtime, SgArray,
//! };
//!
//! fn main() -> Result<(), queueline::Error> {
//!     let device = MemDevice::loopback(EtherAddr([2, 0, 0, 0, 0, 1]));
//!     let mut rt = Runtime::new(Config::default(), Box::new(MemStack::new()), Box::new(device))?;
//!
//!     let server = rt.queue(QueueKind::Stream)?;
//!     rt.bind(server, "127.0.0.1:7000".parse().unwrap())?;
//!     rt.listen(server, 8)?;
//!
//!     let client = rt.queue(QueueKind::Stream)?;
//!     rt.connect(client, "127.0.0.1:7000".parse().unwrap())?;
//!     let OpState::Complete(Completion::Accepted(child, _peer)) = rt.accept(server)? else {
//!         panic!("no pending connection");
//!     };
//!
//!     rt.push(client, QToken::push(1), SgArray::single(b"hello".to_vec()))?;
//!     let message = match rt.pop(child, QToken::pop(1))? {
//!         OpState::Complete(Completion::Pop(sga)) => sga,
//!         OpState::Pending => match rt.wait(child, QToken::pop(1))? {
//!             Completion::Pop(sga) => sga,
//!             other => panic!("unexpected completion: {other:?}"),
//!         },
//!         other => panic!("unexpected completion: {other:?}"),
//!     };
//!     assert_eq!(message.segs()[0], b"hello");
//!     Ok(())
//! }
//! ```
//!
//! # Model
//!
//! Everything is single-threaded and cooperative: each queue keeps its
//! outstanding operations in a FIFO work queue, and one progress step
//! advances the head task until the device would block. Device
//! back-pressure is never an error — the task simply stays pending.

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod datagram;
pub(crate) mod metrics;
pub(crate) mod stream;
pub(crate) mod task;

// ── Public modules ──────────────────────────────────────────────────
pub mod addrbook;
pub mod config;
pub mod device;
pub mod error;
pub mod queue;
pub mod runtime;
pub mod sga;
pub mod token;

// ── Re-exports ──────────────────────────────────────────────────────

/// Static MAC/IPv4 table consulted by the datagram transport.
pub use addrbook::{AddressBook, AddressEntry};
/// Ethernet MAC address, re-exported from the codec crate.
pub use protocol_sga::EtherAddr;
/// Runtime configuration.
pub use config::{Config, ConfigBuilder, DEFAULT_MAGIC};
/// Errors surfaced by every public operation.
pub use error::Error;
/// Queue descriptors and kinds.
pub use queue::{Qd, QueueKind};
/// The per-thread queue runtime.
pub use runtime::{OpState, Runtime};
/// Scatter-gather message payload.
pub use sga::SgArray;
/// Result of a completed operation.
pub use task::Completion;
/// Operation tokens.
pub use token::{OpKind, QToken};
