use protocol_sga::ether::ETHER_HEADER_SIZE;
use protocol_sga::ipv4::IPV4_HEADER_SIZE;
use protocol_sga::udp::UDP_HEADER_SIZE;

use crate::addrbook::AddressEntry;

/// Default frame magic word ("SGARRAY!"). Both peers must use the same
/// value; nothing depends on this particular one.
pub const DEFAULT_MAGIC: u64 = u64::from_be_bytes(*b"SGARRAY!");

/// Configuration for the queue runtime.
#[derive(Clone)]
pub struct Config {
    /// Magic word stamped on every stream frame.
    pub frame_magic: u64,
    /// Maximum stream frame payload length in bytes (segment prefixes
    /// included). Longer incoming frames poison the connection; longer
    /// outgoing messages are rejected at submission.
    pub max_payload_len: u64,
    /// Maximum segments per message, either direction.
    pub max_segments: u32,
    /// Link MTU for the datagram transport. An encoded datagram
    /// (Ethernet/IPv4/UDP headers plus payload) must fit in one frame;
    /// nothing is fragmented here.
    pub mtu: usize,
    /// How many frames one receive burst may pull from the device into a
    /// queue's backlog.
    pub rx_burst: u16,
    /// Most frames a queue's receive backlog may hold; a burst pull is
    /// trimmed so the backlog never grows past this.
    pub backlog_bound: usize,
    /// Static MAC-to-IPv4 entries for the datagram transport's address
    /// book. A destination IP with no entry falls back to broadcast.
    pub address_book: Vec<AddressEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_magic: DEFAULT_MAGIC,
            max_payload_len: 1 << 20,
            max_segments: 16,
            mtu: 1500,
            rx_burst: 64,
            backlog_bound: 256,
            address_book: Vec::new(),
        }
    }
}

impl Config {
    /// Fixed per-datagram header overhead: Ethernet + IPv4 + UDP.
    pub const DATAGRAM_OVERHEAD: usize = ETHER_HEADER_SIZE + IPV4_HEADER_SIZE + UDP_HEADER_SIZE;

    /// Validate configuration values. Returns an error if any value is out
    /// of range.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.max_payload_len == 0 {
            return Err(crate::error::Error::InvalidArgument(
                "max_payload_len must be > 0",
            ));
        }
        if self.max_segments == 0 {
            return Err(crate::error::Error::InvalidArgument(
                "max_segments must be > 0",
            ));
        }
        if self.rx_burst == 0 {
            return Err(crate::error::Error::InvalidArgument("rx_burst must be > 0"));
        }
        if self.backlog_bound == 0 {
            return Err(crate::error::Error::InvalidArgument(
                "backlog_bound must be > 0",
            ));
        }
        if self.mtu <= Self::DATAGRAM_OVERHEAD {
            return Err(crate::error::Error::InvalidArgument(
                "mtu must exceed the Ethernet/IPv4/UDP header overhead",
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()`
/// validation.
///
/// # Example
///
/// ```rust
/// use queueline::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .max_segments(8)
///     .mtu(1500)
///     .rx_burst(32)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stream frame magic word.
    pub fn frame_magic(mut self, magic: u64) -> Self {
        self.config.frame_magic = magic;
        self
    }

    /// Set the maximum stream frame payload length.
    pub fn max_payload_len(mut self, len: u64) -> Self {
        self.config.max_payload_len = len;
        self
    }

    /// Set the maximum segments per message.
    pub fn max_segments(mut self, n: u32) -> Self {
        self.config.max_segments = n;
        self
    }

    /// Set the datagram link MTU.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the receive burst depth.
    pub fn rx_burst(mut self, n: u16) -> Self {
        self.config.rx_burst = n;
        self
    }

    /// Set the per-queue receive backlog bound.
    pub fn backlog_bound(mut self, n: usize) -> Self {
        self.config.backlog_bound = n;
        self
    }

    /// Add an address book entry. Can be called multiple times.
    pub fn address_entry(mut self, entry: AddressEntry) -> Self {
        self.config.address_book.push(entry);
        self
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_burst() {
        let config = ConfigBuilder::new().rx_burst(0).build();
        assert!(config.is_err());
    }

    #[test]
    fn rejects_zero_backlog_bound() {
        let config = ConfigBuilder::new().backlog_bound(0).build();
        assert!(config.is_err());
    }

    #[test]
    fn rejects_tiny_mtu() {
        let config = ConfigBuilder::new().mtu(Config::DATAGRAM_OVERHEAD).build();
        assert!(config.is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let config = ConfigBuilder::new()
            .frame_magic(0xABCD)
            .max_segments(4)
            .rx_burst(8)
            .build()
            .unwrap();
        assert_eq!(config.frame_magic, 0xABCD);
        assert_eq!(config.max_segments, 4);
        assert_eq!(config.rx_burst, 8);
    }
}
