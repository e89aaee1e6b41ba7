//! Length-delimited stream framing.
//!
//! Every message on a stream transport is carried as one frame:
//!
//! ```text
//! [magic: u64][payload_len: u64][num_segs: u64]     24-byte header
//! [seg_len: u64][seg bytes...]                      repeated num_segs times
//! ```
//!
//! `payload_len` covers everything after the header, including the
//! per-segment length prefixes. All words are big-endian. The magic word
//! is caller-supplied; both peers must agree on it, and a mismatch is
//! fatal for the connection rather than a resynchronization point.

use crate::error::ParseError;

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Size of the per-segment length prefix.
pub const SEG_PREFIX_SIZE: usize = 8;

/// Fixed frame header (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Magic word agreed between peers.
    pub magic: u64,
    /// Byte count of everything after the header, segment prefixes included.
    pub payload_len: u64,
    /// Number of segments in the payload.
    pub num_segs: u64,
}

impl FrameHeader {
    /// Build a header describing `segs`.
    pub fn for_segments(magic: u64, segs: &[&[u8]]) -> Self {
        Self {
            magic,
            payload_len: frame_payload_len(segs),
            num_segs: segs.len() as u64,
        }
    }

    /// Parse a header from a byte buffer, checking the magic word.
    pub fn parse(data: &[u8], magic: u64) -> Result<Self, ParseError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ParseError::Incomplete);
        }

        let got = u64::from_be_bytes(data[0..8].try_into().unwrap());
        if got != magic {
            return Err(ParseError::BadMagic(got));
        }

        Ok(Self {
            magic: got,
            payload_len: u64::from_be_bytes(data[8..16].try_into().unwrap()),
            num_segs: u64::from_be_bytes(data[16..24].try_into().unwrap()),
        })
    }

    /// Encode the header into a byte buffer.
    ///
    /// Returns FRAME_HEADER_SIZE (24).
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0..8].copy_from_slice(&self.magic.to_be_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[16..24].copy_from_slice(&self.num_segs.to_be_bytes());
        FRAME_HEADER_SIZE
    }
}

/// Payload length for a segment list: each segment costs its prefix plus
/// its bytes. Excludes the frame header itself.
pub fn frame_payload_len(segs: &[&[u8]]) -> u64 {
    segs.iter()
        .map(|s| (SEG_PREFIX_SIZE + s.len()) as u64)
        .sum()
}

/// Encode a complete frame (header, prefixes, segment bytes) into a fresh
/// buffer.
pub fn encode_frame(magic: u64, segs: &[&[u8]]) -> Vec<u8> {
    let header = FrameHeader::for_segments(magic, segs);
    let mut out = vec![0u8; FRAME_HEADER_SIZE + header.payload_len as usize];
    header.encode(&mut out[..FRAME_HEADER_SIZE]);
    let mut at = FRAME_HEADER_SIZE;
    for seg in segs {
        out[at..at + SEG_PREFIX_SIZE].copy_from_slice(&(seg.len() as u64).to_be_bytes());
        at += SEG_PREFIX_SIZE;
        out[at..at + seg.len()].copy_from_slice(seg);
        at += seg.len();
    }
    out
}

/// Decode a frame payload into its segments.
///
/// The payload must consist of exactly `num_segs` prefixed segments with
/// no trailing bytes.
pub fn decode_segments(payload: &[u8], num_segs: u64) -> Result<Vec<Vec<u8>>, ParseError> {
    if num_segs > (payload.len() / SEG_PREFIX_SIZE) as u64 {
        return Err(ParseError::Protocol("segment prefix overruns payload"));
    }

    let mut segs = Vec::new();
    segs.try_reserve_exact(num_segs as usize)
        .map_err(|_| ParseError::OutOfMemory)?;

    let mut at = 0usize;
    for _ in 0..num_segs {
        if payload.len() - at < SEG_PREFIX_SIZE {
            return Err(ParseError::Protocol("segment prefix overruns payload"));
        }
        let len = u64::from_be_bytes(payload[at..at + SEG_PREFIX_SIZE].try_into().unwrap());
        at += SEG_PREFIX_SIZE;
        let len = usize::try_from(len).map_err(|_| ParseError::TooLarge)?;
        if payload.len() - at < len {
            return Err(ParseError::Protocol("segment overruns payload"));
        }
        let mut seg = Vec::new();
        seg.try_reserve_exact(len).map_err(|_| ParseError::OutOfMemory)?;
        seg.extend_from_slice(&payload[at..at + len]);
        at += len;
        segs.push(seg);
    }

    if at != payload.len() {
        return Err(ParseError::Protocol("trailing bytes in frame payload"));
    }
    Ok(segs)
}

/// Progress of an in-flight [`FrameDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeProgress {
    /// More bytes are required.
    NeedMore,
    /// A complete frame has been buffered; call [`FrameDecoder::finish`].
    Complete,
}

/// Incremental decoder for one frame.
///
/// Reads are two-phase: the fixed header first, then exactly
/// `payload_len` bytes of payload. The caller reads from its transport
/// into [`space`](Self::space) and reports the byte count via
/// [`advance`](Self::advance); partial reads resume where they left off.
pub struct FrameDecoder {
    magic: u64,
    max_payload: u64,
    header_buf: [u8; FRAME_HEADER_SIZE],
    filled: usize,
    header: Option<FrameHeader>,
    payload: Vec<u8>,
}

impl FrameDecoder {
    /// Create a decoder expecting `magic` and refusing payloads longer
    /// than `max_payload`.
    pub fn new(magic: u64, max_payload: u64) -> Self {
        Self {
            magic,
            max_payload,
            header_buf: [0u8; FRAME_HEADER_SIZE],
            filled: 0,
            header: None,
            payload: Vec::new(),
        }
    }

    /// Total bytes buffered so far (header and payload).
    pub fn bytes_buffered(&self) -> usize {
        self.filled
    }

    /// Whether the header phase is complete.
    pub fn header_complete(&self) -> bool {
        self.header.is_some()
    }

    /// The buffer to read the next bytes into.
    ///
    /// Empty only when the frame is already complete.
    pub fn space(&mut self) -> &mut [u8] {
        match self.header {
            None => &mut self.header_buf[self.filled..],
            Some(h) => {
                let at = self.filled - FRAME_HEADER_SIZE;
                &mut self.payload[at..h.payload_len as usize]
            }
        }
    }

    /// Record `n` bytes read into [`space`](Self::space).
    ///
    /// Parses the header once it is fully buffered. A magic mismatch or
    /// over-limit payload is fatal and the decoder must be discarded.
    pub fn advance(&mut self, n: usize) -> Result<DecodeProgress, ParseError> {
        self.filled += n;

        if self.header.is_none() {
            if self.filled < FRAME_HEADER_SIZE {
                return Ok(DecodeProgress::NeedMore);
            }
            let header = FrameHeader::parse(&self.header_buf, self.magic)?;
            if header.payload_len > self.max_payload {
                return Err(ParseError::TooLarge);
            }
            // A payload shorter than its own segment prefixes cannot decode.
            if header.num_segs > header.payload_len / SEG_PREFIX_SIZE as u64 {
                return Err(ParseError::Protocol("payload shorter than segment prefixes"));
            }
            let len = header.payload_len as usize;
            self.payload
                .try_reserve_exact(len)
                .map_err(|_| ParseError::OutOfMemory)?;
            self.payload.resize(len, 0);
            self.header = Some(header);
        }

        let header = self.header.as_ref().unwrap();
        if self.filled < FRAME_HEADER_SIZE + header.payload_len as usize {
            Ok(DecodeProgress::NeedMore)
        } else {
            Ok(DecodeProgress::Complete)
        }
    }

    /// Decode the buffered frame into its header and segments.
    pub fn finish(self) -> Result<(FrameHeader, Vec<Vec<u8>>), ParseError> {
        let header = self.header.ok_or(ParseError::Incomplete)?;
        if self.filled < FRAME_HEADER_SIZE + header.payload_len as usize {
            return Err(ParseError::Incomplete);
        }
        let segs = decode_segments(&self.payload, header.num_segs)?;
        Ok((header, segs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u64 = 0x5347_4152_5241_5921;

    fn decode_all(data: &[u8], chunk: usize) -> Result<(FrameHeader, Vec<Vec<u8>>), ParseError> {
        let mut decoder = FrameDecoder::new(MAGIC, 1 << 20);
        let mut at = 0;
        loop {
            let space = decoder.space();
            let n = chunk.min(space.len()).min(data.len() - at);
            space[..n].copy_from_slice(&data[at..at + n]);
            at += n;
            match decoder.advance(n)? {
                DecodeProgress::Complete => return decoder.finish(),
                DecodeProgress::NeedMore => {
                    assert!(at < data.len(), "decoder starved");
                }
            }
        }
    }

    #[test]
    fn header_encode_parse() {
        let header = FrameHeader {
            magic: MAGIC,
            payload_len: 42,
            num_segs: 3,
        };
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        assert_eq!(header.encode(&mut buf), FRAME_HEADER_SIZE);
        let parsed = FrameHeader::parse(&buf, MAGIC).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let header = FrameHeader {
            magic: MAGIC ^ 1,
            payload_len: 0,
            num_segs: 0,
        };
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(
            FrameHeader::parse(&buf, MAGIC),
            Err(ParseError::BadMagic(MAGIC ^ 1))
        );
    }

    #[test]
    fn header_incomplete() {
        let buf = [0u8; FRAME_HEADER_SIZE - 1];
        assert_eq!(FrameHeader::parse(&buf, MAGIC), Err(ParseError::Incomplete));
    }

    #[test]
    fn round_trip_single_segment() {
        let frame = encode_frame(MAGIC, &[b"hello"]);
        let (header, segs) = decode_all(&frame, frame.len()).unwrap();
        assert_eq!(header.num_segs, 1);
        assert_eq!(header.payload_len, 8 + 5);
        assert_eq!(segs, vec![b"hello".to_vec()]);
    }

    #[test]
    fn round_trip_multi_segment() {
        let frame = encode_frame(MAGIC, &[b"ab", b"cdef", b""]);
        let (header, segs) = decode_all(&frame, frame.len()).unwrap();
        assert_eq!(header.num_segs, 3);
        assert_eq!(segs, vec![b"ab".to_vec(), b"cdef".to_vec(), Vec::new()]);
    }

    #[test]
    fn chunked_decode_matches_whole() {
        // Self-synchronization: the same byte sequence decodes identically
        // under any chunking of the reads.
        let frame = encode_frame(MAGIC, &[b"the quick", b"brown", b"fox"]);
        let whole = decode_all(&frame, frame.len()).unwrap();
        for chunk in [1, 2, 3, 7, 13, 24, 25] {
            let pieces = decode_all(&frame, chunk).unwrap();
            assert_eq!(whole.0, pieces.0, "chunk={chunk}");
            assert_eq!(whole.1, pieces.1, "chunk={chunk}");
        }
    }

    #[test]
    fn decoder_rejects_bad_magic() {
        let mut frame = encode_frame(MAGIC, &[b"x"]);
        frame[0] ^= 0xFF;
        let err = decode_all(&frame, frame.len()).unwrap_err();
        assert!(matches!(err, ParseError::BadMagic(_)));
    }

    #[test]
    fn decoder_rejects_oversize_payload() {
        let frame = encode_frame(MAGIC, &[&[0u8; 128]]);
        let mut decoder = FrameDecoder::new(MAGIC, 64);
        let space = decoder.space();
        let n = space.len();
        space.copy_from_slice(&frame[..n]);
        assert_eq!(decoder.advance(n), Err(ParseError::TooLarge));
    }

    #[test]
    fn segments_reject_trailing_bytes() {
        let mut frame = encode_frame(MAGIC, &[b"hi"]);
        // Declare one extra payload byte and supply it.
        let header = FrameHeader {
            magic: MAGIC,
            payload_len: 8 + 2 + 1,
            num_segs: 1,
        };
        header.encode(&mut frame[..FRAME_HEADER_SIZE]);
        frame.push(0xAA);
        let err = decode_all(&frame, frame.len()).unwrap_err();
        assert_eq!(err, ParseError::Protocol("trailing bytes in frame payload"));
    }

    #[test]
    fn segments_reject_overrun() {
        // Segment prefix claims more bytes than the payload holds.
        let header = FrameHeader {
            magic: MAGIC,
            payload_len: 8 + 2,
            num_segs: 1,
        };
        let mut frame = vec![0u8; FRAME_HEADER_SIZE + 10];
        header.encode(&mut frame[..FRAME_HEADER_SIZE]);
        frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + 8].copy_from_slice(&100u64.to_be_bytes());
        let err = decode_all(&frame, frame.len()).unwrap_err();
        assert_eq!(err, ParseError::Protocol("segment overruns payload"));
    }

    #[test]
    fn payload_len_accounts_for_prefixes() {
        assert_eq!(frame_payload_len(&[]), 0);
        assert_eq!(frame_payload_len(&[b"hello"]), 13);
        assert_eq!(frame_payload_len(&[b"ab", b"cdef"]), 8 + 2 + 8 + 4);
    }
}
