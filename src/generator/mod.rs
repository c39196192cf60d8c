//! Configuration generation
//!
//! Pure, read-only derivation of per-peer configuration from an overlay
//! snapshot: standard WireGuard INI text, an idempotent RouterOS script,
//! and the structured desired state the deployment engine converges
//! managed routers onto.

mod desired;
mod script;

pub use desired::{
    to_entry, DesiredState, FirewallRuleSpec, InterfaceSpec, IpAddressSpec, NatRuleSpec, PeerSpec,
    RouteSpec,
};
pub use script::routeros_script;

use crate::error::{Result, WirewanError};
use crate::model::{OverlaySnapshot, PeerView};
use chrono::Utc;
use ipnetwork::Ipv4Network;

/// Default WireGuard listen port.
pub const DEFAULT_WG_PORT: u16 = 51820;

/// Default WireGuard interface name on managed routers.
pub const DEFAULT_INTERFACE_NAME: &str = "wg-wan-overlay";

/// Parse a peer endpoint into host and port.
///
/// Accepts `host:port`, `[v6]:port` (brackets stripped), and a bare host
/// or bracketed IPv6 without a port, which gets the default WireGuard
/// port. A non-numeric or zero port is a validation error.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let s = endpoint.trim();
    if s.is_empty() {
        return Err(WirewanError::Validation("Endpoint cannot be empty".to_string()));
    }

    if let Some(rest) = s.strip_prefix('[') {
        let (host, remainder) = rest.split_once(']').ok_or_else(|| {
            WirewanError::Validation(format!("Invalid endpoint format: {}", endpoint))
        })?;
        if host.is_empty() {
            return Err(WirewanError::Validation(format!(
                "Invalid endpoint format: {}",
                endpoint
            )));
        }
        let port = match remainder.strip_prefix(':') {
            Some(port_str) => parse_port(port_str, endpoint)?,
            None if remainder.is_empty() => DEFAULT_WG_PORT,
            None => {
                return Err(WirewanError::Validation(format!(
                    "Invalid endpoint format: {}",
                    endpoint
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match s.rsplit_once(':') {
        // Bare IPv6 without brackets: the colons belong to the address
        Some((host, _)) if host.contains(':') => Ok((s.to_string(), DEFAULT_WG_PORT)),
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(WirewanError::Validation(format!(
                    "Invalid endpoint format: {}",
                    endpoint
                )));
            }
            Ok((host.to_string(), parse_port(port_str, endpoint)?))
        }
        None => Ok((s.to_string(), DEFAULT_WG_PORT)),
    }
}

fn parse_port(port_str: &str, endpoint: &str) -> Result<u16> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| WirewanError::Validation(format!("Invalid port in endpoint: {}", endpoint)))?;
    if port == 0 {
        return Err(WirewanError::Validation(
            "Port number cannot be 0".to_string(),
        ));
    }
    Ok(port)
}

/// AllowedIPs towards one remote peer: its tunnel address, its routed
/// subnets (NAT translation preferred), its active service addresses, and
/// the WAN's shared-services range. With `include_default_route`, peers
/// that have an endpoint additionally carry `0.0.0.0/0`.
///
/// The result is deduplicated and keeps insertion order so repeated
/// generation yields identical output.
pub fn allowed_ips(
    other: &PeerView,
    shared_services_range: Ipv4Network,
    include_default_route: bool,
) -> Vec<String> {
    let mut ips = Vec::new();
    let mut push = |ip: String| {
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    };

    if let Some(tunnel_ip) = other.peer.tunnel_ip {
        push(format!("{}/32", tunnel_ip));
    }
    if include_default_route && other.peer.endpoint.is_some() {
        push("0.0.0.0/0".to_string());
    }
    for subnet in &other.subnets {
        if subnet.is_routed {
            push(subnet.advertised_cidr().to_string());
        }
    }
    for service in &other.services {
        if service.is_active {
            push(format!("{}/32", service.shared_ip));
        }
    }
    push(shared_services_range.to_string());
    ips
}

/// Generate the standard WireGuard INI configuration for the snapshot's
/// target peer. The private key is decrypted by the caller for the
/// duration of the call.
pub fn wireguard_config(snapshot: &OverlaySnapshot, private_key: &str) -> String {
    let peer = &snapshot.peer.peer;
    let mut lines = vec![
        "# WAN-Overlay-Manager Configuration".to_string(),
        format!("# Peer: {}", peer.name),
        format!("# Generated: {}", Utc::now().to_rfc3339()),
        String::new(),
        "[Interface]".to_string(),
        format!("PrivateKey = {}", private_key),
    ];

    let mut addresses = Vec::new();
    if let Some(tunnel_ip) = peer.tunnel_ip {
        addresses.push(format!("{}/32", tunnel_ip));
    }
    for service in &snapshot.peer.services {
        if service.is_active {
            addresses.push(format!("{}/32", service.shared_ip));
        }
    }
    lines.push(format!("Address = {}", addresses.join(", ")));

    if let Some(port) = peer.listen_port {
        lines.push(format!("ListenPort = {}", port));
    }
    lines.push(String::new());

    let route_all = peer.peer_metadata.route_all_traffic;
    for other in &snapshot.others {
        let Some(public_key) = other.peer.public_key.as_deref() else {
            continue;
        };

        lines.push(format!("# Peer: {}", other.peer.name));
        lines.push("[Peer]".to_string());
        lines.push(format!("PublicKey = {}", public_key));
        if let Some(endpoint) = other.peer.endpoint.as_deref() {
            lines.push(format!("Endpoint = {}", endpoint));
        }
        let ips = allowed_ips(other, snapshot.wan.shared_services_range, route_all);
        lines.push(format!("AllowedIPs = {}", ips.join(", ")));
        if let Some(keepalive) = peer.persistent_keepalive {
            lines.push(format!("PersistentKeepalive = {}", keepalive));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_parse_endpoint_host_port() {
        assert_eq!(
            parse_endpoint("203.0.113.5:51820").unwrap(),
            ("203.0.113.5".to_string(), 51820)
        );
        assert_eq!(
            parse_endpoint("vpn.example.com:4500").unwrap(),
            ("vpn.example.com".to_string(), 4500)
        );
    }

    #[test]
    fn test_parse_endpoint_defaults_port() {
        assert_eq!(
            parse_endpoint("vpn.example.com").unwrap(),
            ("vpn.example.com".to_string(), 51820)
        );
    }

    #[test]
    fn test_parse_endpoint_ipv6_brackets() {
        assert_eq!(
            parse_endpoint("[2001:db8::1]:51820").unwrap(),
            ("2001:db8::1".to_string(), 51820)
        );
        // Bracketed address without a port gets the default
        assert_eq!(
            parse_endpoint("[2001:db8::1]").unwrap(),
            ("2001:db8::1".to_string(), 51820)
        );
    }

    #[test]
    fn test_parse_endpoint_bare_ipv6() {
        assert_eq!(
            parse_endpoint("2001:db8::1").unwrap(),
            ("2001:db8::1".to_string(), 51820)
        );
    }

    #[test]
    fn test_parse_endpoint_rejects_bad_ports() {
        assert!(parse_endpoint("host:notaport").is_err());
        assert!(parse_endpoint("host:0").is_err());
        assert!(parse_endpoint("[2001:db8::1]:nope").is_err());
        assert!(parse_endpoint("").is_err());
        assert!(parse_endpoint("[2001:db8::1").is_err());
    }

    #[test]
    fn test_wireguard_config_single_peer() {
        let me = snapshot_with(vec![]);
        let mut other = peer_view("branch", "10.0.0.2", Some("K_B"), Some("203.0.113.5:51820"));
        other
            .subnets
            .push(subnet(other.peer.id, "192.168.10.0/24", true, None));
        let snapshot = OverlaySnapshot {
            others: vec![other],
            ..me
        };

        let config = wireguard_config(&snapshot, "PRIVATE_KEY");
        assert_eq!(config.matches("[Peer]").count(), 1);
        assert!(config.contains("PrivateKey = PRIVATE_KEY"));
        assert!(config.contains("Address = 10.0.0.1/32"));
        assert!(config.contains("PublicKey = K_B"));
        assert!(config.contains("Endpoint = 203.0.113.5:51820"));

        let allowed_line = config
            .lines()
            .find(|l| l.starts_with("AllowedIPs"))
            .unwrap();
        let ips: std::collections::HashSet<&str> = allowed_line
            .trim_start_matches("AllowedIPs = ")
            .split(", ")
            .collect();
        let expected: std::collections::HashSet<&str> =
            ["10.0.0.2/32", "192.168.10.0/24", "10.0.5.0/24"]
                .into_iter()
                .collect();
        assert_eq!(ips, expected);
    }

    #[test]
    fn test_peers_without_public_key_are_skipped() {
        let snapshot = snapshot_with(vec![peer_view("keyless", "10.0.0.3", None, None)]);
        let config = wireguard_config(&snapshot, "PRIV");
        assert!(!config.contains("[Peer]"));
    }

    #[test]
    fn test_allowed_ips_no_duplicates_and_core_entries() {
        let shared = "10.0.5.0/24".parse().unwrap();
        let mut other = peer_view("b", "10.0.0.2", Some("K"), None);
        // Subnet equal to the shared range would duplicate the trailing entry
        other.subnets.push(subnet(other.peer.id, "10.0.5.0/24", true, None));
        let ips = allowed_ips(&other, shared, false);

        let unique: std::collections::HashSet<&String> = ips.iter().collect();
        assert_eq!(unique.len(), ips.len());
        assert!(ips.contains(&"10.0.0.2/32".to_string()));
        assert!(ips.contains(&"10.0.5.0/24".to_string()));
    }

    #[test]
    fn test_allowed_ips_nat_translation_preferred() {
        let shared = "10.0.5.0/24".parse().unwrap();
        let mut other = peer_view("b", "10.0.0.2", Some("K"), None);
        other.subnets.push(subnet(
            other.peer.id,
            "192.168.1.0/24",
            true,
            Some("172.16.0.0/24"),
        ));
        let ips = allowed_ips(&other, shared, false);
        assert!(ips.contains(&"172.16.0.0/24".to_string()));
        assert!(!ips.contains(&"192.168.1.0/24".to_string()));
    }

    #[test]
    fn test_route_all_traffic_requires_endpoint() {
        let shared = "10.0.5.0/24".parse().unwrap();
        let with_endpoint = peer_view("b", "10.0.0.2", Some("K"), Some("203.0.113.5:51820"));
        let without_endpoint = peer_view("c", "10.0.0.3", Some("K"), None);

        assert!(allowed_ips(&with_endpoint, shared, true).contains(&"0.0.0.0/0".to_string()));
        assert!(!allowed_ips(&without_endpoint, shared, true).contains(&"0.0.0.0/0".to_string()));
        assert!(!allowed_ips(&with_endpoint, shared, false).contains(&"0.0.0.0/0".to_string()));
    }

    #[test]
    fn test_unrouted_subnets_not_advertised() {
        let shared = "10.0.5.0/24".parse().unwrap();
        let mut other = peer_view("b", "10.0.0.2", Some("K"), None);
        other.subnets.push(subnet(other.peer.id, "192.168.9.0/24", false, None));
        let ips = allowed_ips(&other, shared, false);
        assert!(!ips.contains(&"192.168.9.0/24".to_string()));
    }

    #[test]
    fn test_keepalive_comes_from_target_peer() {
        let mut snapshot = snapshot_with(vec![peer_view("b", "10.0.0.2", Some("K"), None)]);
        snapshot.peer.peer.persistent_keepalive = Some(25);
        let config = wireguard_config(&snapshot, "PRIV");
        assert!(config.contains("PersistentKeepalive = 25"));
    }
}
