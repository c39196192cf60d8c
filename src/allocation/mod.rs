//! Tunnel and shared-service IP allocation
//!
//! Pools are IPv4 CIDR ranges declared on a WAN network. Allocation hands
//! out the first usable host not already recorded against the pool; the
//! caller supplies the allocated set from the store within one transaction.

use crate::error::{Result, WirewanError};
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Iterate the usable host addresses of a pool.
///
/// Network and broadcast addresses are excluded for prefixes up to /30;
/// a /31 yields both addresses and a /32 its single address.
pub fn usable_hosts(network: Ipv4Network) -> Box<dyn Iterator<Item = Ipv4Addr>> {
    match network.prefix() {
        32 => Box::new(std::iter::once(network.network())),
        31 => Box::new(network.iter()),
        _ => {
            let net_addr = network.network();
            let bcast = network.broadcast();
            Box::new(network.iter().filter(move |ip| *ip != net_addr && *ip != bcast))
        }
    }
}

/// Number of usable hosts in a pool.
pub fn host_count(network: Ipv4Network) -> u32 {
    match network.prefix() {
        32 => 1,
        31 => 2,
        _ => network.size().saturating_sub(2),
    }
}

/// Allocate the first usable host not present in `allocated`.
pub fn allocate(network: Ipv4Network, allocated: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
    usable_hosts(network)
        .find(|ip| !allocated.contains(ip))
        .ok_or_else(|| {
            WirewanError::PoolExhausted(format!("No available IPs in range {}", network))
        })
}

/// Check whether a specific address can be reserved: it must fall inside
/// the pool and must not already be allocated.
pub fn is_available(network: Ipv4Network, ip: Ipv4Addr, allocated: &HashSet<Ipv4Addr>) -> bool {
    network.contains(ip) && usable_hosts(network).any(|h| h == ip) && !allocated.contains(&ip)
}

/// Descriptive snapshot of an allocation pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    /// Network address
    pub network_address: Ipv4Addr,
    /// Broadcast address
    pub broadcast_address: Ipv4Addr,
    /// Dotted netmask
    pub netmask: Ipv4Addr,
    /// Prefix length
    pub prefix_length: u8,
    /// Usable host count
    pub total_hosts: u32,
    /// First usable host, if any
    pub first_host: Option<Ipv4Addr>,
    /// Last usable host, if any
    pub last_host: Option<Ipv4Addr>,
    /// Hosts currently allocated
    pub allocated_count: u32,
    /// Hosts still free
    pub available_count: u32,
}

impl PoolInfo {
    /// Describe a pool given its current allocation count.
    pub fn describe(network: Ipv4Network, allocated_count: u32) -> Self {
        let total = host_count(network);
        let first_host = usable_hosts(network).next();
        let last_host = usable_hosts(network).last();
        Self {
            network_address: network.network(),
            broadcast_address: network.broadcast(),
            netmask: network.mask(),
            prefix_length: network.prefix(),
            total_hosts: total,
            first_host,
            last_host,
            allocated_count,
            available_count: total.saturating_sub(allocated_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_usable_hosts_slash_29() {
        let hosts: Vec<_> = usable_hosts(net("10.0.0.0/29")).collect();
        assert_eq!(hosts.len(), 6);
        assert_eq!(hosts[0], "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(hosts[5], "10.0.0.6".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_usable_hosts_small_prefixes() {
        assert_eq!(usable_hosts(net("10.0.0.0/31")).count(), 2);
        assert_eq!(usable_hosts(net("10.0.0.5/32")).count(), 1);
    }

    #[test]
    fn test_allocate_sequential() {
        let network = net("10.0.0.0/29");
        let mut allocated = HashSet::new();
        for expected in 1..=6u8 {
            let ip = allocate(network, &allocated).unwrap();
            assert_eq!(ip, Ipv4Addr::new(10, 0, 0, expected));
            allocated.insert(ip);
        }
        // Seventh allocation exhausts the pool
        assert!(matches!(
            allocate(network, &allocated),
            Err(WirewanError::PoolExhausted(_))
        ));
    }

    #[test]
    fn test_allocate_fills_gaps() {
        let network = net("10.0.0.0/29");
        let mut allocated: HashSet<Ipv4Addr> =
            ["10.0.0.1", "10.0.0.3"].iter().map(|s| s.parse().unwrap()).collect();
        let ip = allocate(network, &allocated).unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
        allocated.insert(ip);
        assert_eq!(allocate(network, &allocated).unwrap(), Ipv4Addr::new(10, 0, 0, 4));
    }

    #[test]
    fn test_is_available() {
        let network = net("10.0.0.0/29");
        let allocated: HashSet<Ipv4Addr> = ["10.0.0.1"].iter().map(|s| s.parse().unwrap()).collect();

        assert!(is_available(network, "10.0.0.2".parse().unwrap(), &allocated));
        // Already allocated
        assert!(!is_available(network, "10.0.0.1".parse().unwrap(), &allocated));
        // Outside the pool
        assert!(!is_available(network, "10.1.0.2".parse().unwrap(), &allocated));
        // Network and broadcast are not usable
        assert!(!is_available(network, "10.0.0.0".parse().unwrap(), &allocated));
        assert!(!is_available(network, "10.0.0.7".parse().unwrap(), &allocated));
    }

    #[test]
    fn test_pool_info() {
        let info = PoolInfo::describe(net("10.0.0.0/24"), 3);
        assert_eq!(info.network_address, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(info.broadcast_address, Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(info.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(info.prefix_length, 24);
        assert_eq!(info.total_hosts, 254);
        assert_eq!(info.first_host, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(info.last_host, Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(info.allocated_count, 3);
        assert_eq!(info.available_count, 251);
    }

    proptest! {
        // Every allocated address is a usable host of the pool, and repeated
        // allocation never hands out the same address twice.
        #[test]
        fn prop_allocations_unique_and_in_range(prefix in 24u8..=30) {
            let network = Ipv4Network::new(Ipv4Addr::new(192, 0, 2, 0), prefix).unwrap();
            let mut allocated = HashSet::new();
            while let Ok(ip) = allocate(network, &allocated) {
                prop_assert!(network.contains(ip));
                prop_assert!(ip != network.network() && ip != network.broadcast());
                prop_assert!(allocated.insert(ip));
            }
            prop_assert_eq!(allocated.len() as u32, host_count(network));
        }
    }
}
