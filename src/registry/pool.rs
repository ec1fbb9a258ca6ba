//! Host-local IPv4 address pool. Scans a configured CIDR range and returns
//! the first address not already assigned to a live deployment.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

pub struct AddressPool {
    network: u32,
    host_bits: u32,
}

impl AddressPool {
    pub fn parse(cidr: &str) -> Result<Self> {
        let (addr_part, prefix_part) = cidr
            .split_once('/')
            .ok_or_else(|| Error::InvalidInput(format!("address_pool_cidr {cidr} missing prefix")))?;
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|e| Error::InvalidInput(format!("address_pool_cidr {cidr}: {e}")))?;
        let prefix_len: u32 = prefix_part
            .parse()
            .map_err(|e| Error::InvalidInput(format!("address_pool_cidr {cidr}: {e}")))?;
        if prefix_len > 32 {
            return Err(Error::InvalidInput(format!(
                "address_pool_cidr {cidr}: prefix length out of range"
            )));
        }
        let host_bits = 32 - prefix_len;
        let mask = if host_bits == 32 { 0 } else { !0u32 << host_bits };
        let network = u32::from(addr) & mask;
        Ok(Self { network, host_bits })
    }

    /// Number of usable host addresses, excluding the network, gateway
    /// (host offset 1), and broadcast addresses.
    fn usable_range(&self) -> std::ops::Range<u32> {
        let total = if self.host_bits >= 32 { u32::MAX } else { 1u32 << self.host_bits };
        2..total.saturating_sub(1)
    }

    pub fn allocate(&self, used: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        for host in self.usable_range() {
            let candidate = Ipv4Addr::from(self.network + host);
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::PoolExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_free_address_in_order() {
        let pool = AddressPool::parse("169.254.92.0/30").unwrap();
        let used = HashSet::new();
        let first = pool.allocate(&used).unwrap();
        assert_eq!(first, Ipv4Addr::new(169, 254, 92, 2));
    }

    #[test]
    fn skips_addresses_already_in_use() {
        let pool = AddressPool::parse("169.254.92.0/30").unwrap();
        let mut used = HashSet::new();
        used.insert(Ipv4Addr::new(169, 254, 92, 2));
        let next = pool.allocate(&used).unwrap();
        assert_eq!(next, Ipv4Addr::new(169, 254, 92, 3));
    }

    #[test]
    fn exhausted_pool_fails() {
        let pool = AddressPool::parse("169.254.92.0/30").unwrap();
        let mut used = HashSet::new();
        used.insert(Ipv4Addr::new(169, 254, 92, 2));
        let err = pool.allocate(&used).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));
    }
}
