//! Scatter-gather payload codec for UDP datagrams.
//!
//! One datagram carries one whole message:
//!
//! ```text
//! [num_segs: u32]
//! [seg_len: u32][seg bytes...]    repeated num_segs times
//! ```
//!
//! Unlike the stream framing there is no magic word or outer length; the
//! datagram boundary delimits the message. All words are big-endian.

use crate::error::ParseError;

/// Size of the segment-count word and of each per-segment length prefix.
pub const SEG_PREFIX_SIZE: usize = 4;

/// Encoded size of a segment list.
pub fn encoded_len(segs: &[&[u8]]) -> usize {
    SEG_PREFIX_SIZE + segs.iter().map(|s| SEG_PREFIX_SIZE + s.len()).sum::<usize>()
}

/// Encode a segment list into `buf`, which must hold
/// [`encoded_len`]`(segs)` bytes.
///
/// Returns the number of bytes written.
pub fn encode_payload(segs: &[&[u8]], buf: &mut [u8]) -> usize {
    buf[0..4].copy_from_slice(&(segs.len() as u32).to_be_bytes());
    let mut at = SEG_PREFIX_SIZE;
    for seg in segs {
        buf[at..at + 4].copy_from_slice(&(seg.len() as u32).to_be_bytes());
        at += SEG_PREFIX_SIZE;
        buf[at..at + seg.len()].copy_from_slice(seg);
        at += seg.len();
    }
    at
}

/// Decode a datagram payload into its segments.
///
/// The payload must consist of exactly the declared segments with no
/// trailing bytes.
pub fn decode_payload(data: &[u8]) -> Result<Vec<Vec<u8>>, ParseError> {
    if data.len() < SEG_PREFIX_SIZE {
        return Err(ParseError::Incomplete);
    }
    let num_segs = u32::from_be_bytes(data[0..4].try_into().unwrap());
    if num_segs as usize > (data.len() - SEG_PREFIX_SIZE) / SEG_PREFIX_SIZE {
        return Err(ParseError::Protocol("segment prefix overruns datagram"));
    }

    let mut segs = Vec::new();
    segs.try_reserve_exact(num_segs as usize)
        .map_err(|_| ParseError::OutOfMemory)?;

    let mut at = SEG_PREFIX_SIZE;
    for _ in 0..num_segs {
        if data.len() - at < SEG_PREFIX_SIZE {
            return Err(ParseError::Protocol("segment prefix overruns datagram"));
        }
        let len = u32::from_be_bytes(data[at..at + 4].try_into().unwrap()) as usize;
        at += SEG_PREFIX_SIZE;
        if data.len() - at < len {
            return Err(ParseError::Protocol("segment overruns datagram"));
        }
        let mut seg = Vec::new();
        seg.try_reserve_exact(len).map_err(|_| ParseError::OutOfMemory)?;
        seg.extend_from_slice(&data[at..at + len]);
        at += len;
        segs.push(seg);
    }

    if at != data.len() {
        return Err(ParseError::Protocol("trailing bytes in datagram"));
    }
    Ok(segs)
}
