//! Error types for codec operations.

/// Error type for frame and packet parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    /// This is not a fatal error - the caller should buffer more data and retry.
    #[error("incomplete data")]
    Incomplete,

    /// Frame magic word did not match the expected value.
    #[error("bad frame magic: {0:#018x}")]
    BadMagic(u64),

    /// A declared length exceeds the configured maximum.
    #[error("length exceeds maximum")]
    TooLarge,

    /// Malformed frame or packet.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Buffer allocation for the payload failed.
    #[error("allocation failed")]
    OutOfMemory,
}

impl ParseError {
    /// Returns true if this error indicates more data is needed.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_incomplete() {
        assert!(ParseError::Incomplete.is_incomplete());
        assert!(!ParseError::BadMagic(0).is_incomplete());
        assert!(!ParseError::Protocol("test").is_incomplete());
        assert!(!ParseError::TooLarge.is_incomplete());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", ParseError::Incomplete), "incomplete data");
        assert_eq!(
            format!("{}", ParseError::Protocol("bad segment")),
            "protocol error: bad segment"
        );
        assert_eq!(
            format!("{}", ParseError::BadMagic(0xABCD)),
            "bad frame magic: 0x000000000000abcd"
        );
    }
}
