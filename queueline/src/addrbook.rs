//! Static MAC-to-IPv4 address book.
//!
//! The datagram transport has no ARP; peers are configured up front. A
//! destination IP without an entry resolves to the broadcast MAC.

use std::net::Ipv4Addr;

use protocol_sga::EtherAddr;

/// One MAC-to-IPv4 pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressEntry {
    pub mac: EtherAddr,
    pub ip: Ipv4Addr,
}

/// Static bidirectional MAC/IPv4 table.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: Vec<AddressEntry>,
}

impl AddressBook {
    /// Build a book from configured entries.
    pub fn new(entries: Vec<AddressEntry>) -> Self {
        Self { entries }
    }

    /// Resolve a destination IP to a MAC, falling back to broadcast for
    /// unknown addresses.
    pub fn mac_for_ip(&self, ip: Ipv4Addr) -> EtherAddr {
        self.entries
            .iter()
            .find(|e| e.ip == ip)
            .map(|e| e.mac)
            .unwrap_or(EtherAddr::BROADCAST)
    }

    /// Reverse lookup: the IP configured for a MAC, if any. Used to derive
    /// a source address when sending from an unbound queue.
    pub fn ip_for_mac(&self, mac: EtherAddr) -> Option<Ipv4Addr> {
        self.entries.iter().find(|e| e.mac == mac).map(|e| e.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> AddressBook {
        AddressBook::new(vec![
            AddressEntry {
                mac: EtherAddr([0x00, 0x0d, 0x3a, 0x70, 0x25, 0x75]),
                ip: Ipv4Addr::new(10, 0, 0, 5),
            },
            AddressEntry {
                mac: EtherAddr([0x00, 0x0d, 0x3a, 0x5e, 0x4f, 0x6e]),
                ip: Ipv4Addr::new(10, 0, 0, 7),
            },
        ])
    }

    #[test]
    fn forward_lookup() {
        let book = book();
        assert_eq!(
            book.mac_for_ip(Ipv4Addr::new(10, 0, 0, 7)),
            EtherAddr([0x00, 0x0d, 0x3a, 0x5e, 0x4f, 0x6e])
        );
    }

    #[test]
    fn unknown_ip_is_broadcast() {
        let book = book();
        assert_eq!(
            book.mac_for_ip(Ipv4Addr::new(10, 0, 0, 99)),
            EtherAddr::BROADCAST
        );
    }

    #[test]
    fn reverse_lookup() {
        let book = book();
        assert_eq!(
            book.ip_for_mac(EtherAddr([0x00, 0x0d, 0x3a, 0x70, 0x25, 0x75])),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
        assert_eq!(book.ip_for_mac(EtherAddr([1; 6])), None);
    }
}
