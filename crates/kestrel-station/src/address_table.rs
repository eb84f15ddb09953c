use kestrel_core::MacAddress;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Append-only IP → MAC table fed by discovery datagrams.
///
/// Bounded at construction and never shrunk; an IP that is already known has
/// its MAC updated in place.
#[derive(Debug)]
pub struct AddressTable {
    entries: Vec<(IpAddr, MacAddress)>,
    limit: usize,
}

impl AddressTable {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Record `ip` → `mac`. Returns false when the table is full.
    pub fn record(&mut self, ip: IpAddr, mac: MacAddress) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(known, _)| *known == ip) {
            if entry.1 != mac {
                debug!("Address table: {} moved from {} to {}", ip, entry.1, mac);
                entry.1 = mac;
            }
            return true;
        }

        if self.entries.len() >= self.limit {
            warn!(
                "Address table full ({} entries), not recording {} -> {}",
                self.limit, ip, mac
            );
            return false;
        }

        self.entries.push((ip, mac));
        true
    }

    pub fn mac_for(&self, ip: IpAddr) -> Option<MacAddress> {
        self.entries
            .iter()
            .find(|(known, _)| *known == ip)
            .map(|(_, mac)| *mac)
    }

    pub fn ip_for(&self, mac: MacAddress) -> Option<IpAddr> {
        self.entries
            .iter()
            .find(|(_, known)| *known == mac)
            .map(|(ip, _)| *ip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0, 0x1a, 0x2b, 0x3c, 0x4d, last])
    }

    #[test]
    fn records_and_resolves_both_ways() {
        let mut table = AddressTable::new(4);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(table.record(ip, mac(1)));
        assert_eq!(table.mac_for(ip), Some(mac(1)));
        assert_eq!(table.ip_for(mac(1)), Some(ip));
    }

    #[test]
    fn updates_in_place_without_growing() {
        let mut table = AddressTable::new(4);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        table.record(ip, mac(1));
        table.record(ip, mac(2));
        assert_eq!(table.len(), 1);
        assert_eq!(table.mac_for(ip), Some(mac(2)));
    }

    #[test]
    fn refuses_entries_past_the_limit() {
        let mut table = AddressTable::new(2);
        assert!(table.record("10.0.0.1".parse().unwrap(), mac(1)));
        assert!(table.record("10.0.0.2".parse().unwrap(), mac(2)));
        assert!(!table.record("10.0.0.3".parse().unwrap(), mac(3)));
        assert_eq!(table.len(), 2);
        assert_eq!(table.mac_for("10.0.0.3".parse().unwrap()), None);
    }
}
