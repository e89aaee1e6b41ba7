//! Wire codec for scatter-gather messages.
//!
//! This crate encodes one logical message — an ordered list of byte
//! segments — for two very different carriers:
//!
//! - **Stream framing** ([`frame`]): a magic-prefixed, length-delimited
//!   frame with a fixed 24-byte header, decoded incrementally so partial
//!   reads resume where they stopped.
//! - **Datagram packets** ([`datagram`], [`ether`], [`ipv4`], [`udp`]):
//!   the segment list packed into a single UDP payload, plus the raw
//!   Ethernet/IPv4/UDP headers a kernel-bypass transport must build and
//!   validate itself.
//!
//! # Stream framing
//!
//! ```
//! use protocol_sga::frame::{self, FrameDecoder, DecodeProgress};
//!
//! const MAGIC: u64 = 0x5347_4152_5241_5921;
//!
//! let wire = frame::encode_frame(MAGIC, &[b"ab", b"cdef"]);
//!
//! // The decoder asks for the header first, then the payload.
//! let mut decoder = FrameDecoder::new(MAGIC, 1 << 20);
//! let mut fed = 0;
//! loop {
//!     let space = decoder.space();
//!     let n = space.len().min(wire.len() - fed);
//!     space[..n].copy_from_slice(&wire[fed..fed + n]);
//!     fed += n;
//!     if decoder.advance(n).unwrap() == DecodeProgress::Complete {
//!         break;
//!     }
//! }
//! let (header, segs) = decoder.finish().unwrap();
//! assert_eq!(header.num_segs, 2);
//! assert_eq!(segs[1], b"cdef");
//! ```
//!
//! # Datagram payload
//!
//! ```
//! use protocol_sga::datagram;
//!
//! let segs: &[&[u8]] = &[b"ping"];
//! let mut payload = vec![0u8; datagram::encoded_len(segs)];
//! datagram::encode_payload(segs, &mut payload);
//! assert_eq!(datagram::decode_payload(&payload).unwrap()[0], b"ping");
//! ```

pub mod datagram;
mod error;
pub mod ether;
pub mod frame;
pub mod ipv4;
pub mod udp;

pub use error::ParseError;

/// Size of the fixed stream frame header.
pub use frame::FRAME_HEADER_SIZE;
/// Incremental stream frame decoder.
pub use frame::FrameDecoder;
/// Fixed stream frame header.
pub use frame::FrameHeader;

/// A 48-bit Ethernet MAC address.
pub use ether::EtherAddr;
/// Ethernet II header.
pub use ether::EtherHeader;
/// Option-less IPv4 header.
pub use ipv4::Ipv4Header;
/// UDP header.
pub use udp::UdpHeader;
