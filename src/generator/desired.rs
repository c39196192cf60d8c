//! Structured desired state for a managed router
//!
//! The typed counterpart of what the deployment engine writes through the
//! router API. Field names serialize in the router's native kebab-case so
//! a spec converts 1:1 into a transport row. Every spec carries a comment
//! beginning with the ownership prefix; that comment is the identity used
//! for diffing, backup and drift detection.

use super::{allowed_ips, parse_endpoint, DEFAULT_INTERFACE_NAME, DEFAULT_WG_PORT};
use crate::model::OverlaySnapshot;
use crate::routeros::RouterEntry;
use crate::COMMENT_PREFIX;
use serde::Serialize;

/// WireGuard interface on the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceSpec {
    /// Interface name
    pub name: String,
    /// Listen port
    #[serde(rename = "listen-port")]
    pub listen_port: u16,
    /// Decrypted private key
    #[serde(rename = "private-key")]
    pub private_key: String,
    /// Ownership comment
    pub comment: String,
}

/// Address bound to the managed interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpAddressSpec {
    /// `ip/prefix`
    pub address: String,
    /// Interface the address sits on
    pub interface: String,
    /// Ownership comment
    pub comment: String,
}

/// WireGuard peer entry on the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSpec {
    /// Owning interface
    pub interface: String,
    /// Remote public key
    #[serde(rename = "public-key")]
    pub public_key: String,
    /// Comma-joined allowed addresses
    #[serde(rename = "allowed-address")]
    pub allowed_address: String,
    /// Keepalive, rendered as `<n>s`
    #[serde(rename = "persistent-keepalive")]
    pub persistent_keepalive: String,
    /// Ownership comment
    pub comment: String,
    /// Remote endpoint host
    #[serde(rename = "endpoint-address", skip_serializing_if = "Option::is_none")]
    pub endpoint_address: Option<String>,
    /// Remote endpoint port
    #[serde(rename = "endpoint-port", skip_serializing_if = "Option::is_none")]
    pub endpoint_port: Option<String>,
}

/// Route towards a remote subnet or the shared-services range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSpec {
    /// Destination CIDR
    #[serde(rename = "dst-address")]
    pub dst_address: String,
    /// Gateway (the managed interface)
    pub gateway: String,
    /// Ownership comment
    pub comment: String,
}

/// Firewall filter rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirewallRuleSpec {
    /// Chain
    pub chain: String,
    /// Action
    pub action: String,
    /// Inbound interface match
    #[serde(rename = "in-interface", skip_serializing_if = "Option::is_none")]
    pub in_interface: Option<String>,
    /// Outbound interface match
    #[serde(rename = "out-interface", skip_serializing_if = "Option::is_none")]
    pub out_interface: Option<String>,
    /// Ownership comment
    pub comment: String,
}

/// Destination NAT rule for a published service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NatRuleSpec {
    /// Chain (`dstnat`)
    pub chain: String,
    /// Shared address the service is published on
    #[serde(rename = "dst-address")]
    pub dst_address: String,
    /// Transport protocol
    pub protocol: String,
    /// Action (`dst-nat`)
    pub action: String,
    /// Local address the traffic is translated to
    #[serde(rename = "to-addresses")]
    pub to_addresses: String,
    /// Exposed port; absent when the service publishes any port
    #[serde(rename = "dst-port", skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<String>,
    /// Local port; absent when any port is forwarded
    #[serde(rename = "to-ports", skip_serializing_if = "Option::is_none")]
    pub to_ports: Option<String>,
    /// Ownership comment
    pub comment: String,
}

/// Complete desired state for one managed peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredState {
    /// The WireGuard interface
    pub interface: InterfaceSpec,
    /// Addresses on the interface
    pub ip_addresses: Vec<IpAddressSpec>,
    /// WireGuard peers
    pub peers: Vec<PeerSpec>,
    /// Routes
    pub routes: Vec<RouteSpec>,
    /// Firewall filter rules
    pub firewall_rules: Vec<FirewallRuleSpec>,
    /// NAT rules
    pub nat_rules: Vec<NatRuleSpec>,
}

impl DesiredState {
    /// Derive the desired state for the snapshot's target peer.
    ///
    /// Pure over the snapshot: recomputing against unchanged overlay state
    /// yields an equal structure.
    pub fn build(snapshot: &OverlaySnapshot, private_key: &str) -> Self {
        let peer = &snapshot.peer.peer;
        let interface_name = peer
            .managed
            .as_ref()
            .and_then(|m| m.interface_name.clone())
            .unwrap_or_else(|| DEFAULT_INTERFACE_NAME.to_string());
        let listen_port = peer.listen_port.unwrap_or(DEFAULT_WG_PORT);

        let interface = InterfaceSpec {
            name: interface_name.clone(),
            listen_port,
            private_key: private_key.to_string(),
            comment: format!("{}peer-{}", COMMENT_PREFIX, peer.id),
        };

        let ip_addresses = peer
            .tunnel_ip
            .map(|tunnel_ip| IpAddressSpec {
                address: format!("{}/24", tunnel_ip),
                interface: interface_name.clone(),
                comment: format!("{}peer-{}", COMMENT_PREFIX, peer.id),
            })
            .into_iter()
            .collect();

        let mut peers = Vec::new();
        for other in &snapshot.others {
            let Some(public_key) = other.peer.public_key.clone() else {
                continue;
            };
            let ips = allowed_ips(other, snapshot.wan.shared_services_range, false);
            let keepalive = other.peer.persistent_keepalive.unwrap_or(25);

            let (endpoint_address, endpoint_port) = match other.peer.endpoint.as_deref() {
                Some(endpoint) => match parse_endpoint(endpoint) {
                    Ok((host, port)) => (Some(host), Some(port.to_string())),
                    Err(_) => (None, None),
                },
                None => (None, None),
            };

            peers.push(PeerSpec {
                interface: interface_name.clone(),
                public_key,
                allowed_address: ips.join(","),
                persistent_keepalive: format!("{}s", keepalive),
                comment: format!("{}peer-{}", COMMENT_PREFIX, other.peer.id),
                endpoint_address,
                endpoint_port,
            });
        }

        let mut routes = Vec::new();
        for other in &snapshot.others {
            for subnet in &other.subnets {
                if subnet.is_routed {
                    routes.push(RouteSpec {
                        dst_address: subnet.advertised_cidr().to_string(),
                        gateway: interface_name.clone(),
                        comment: format!("{}route-to-{}", COMMENT_PREFIX, other.peer.id),
                    });
                }
            }
        }
        routes.push(RouteSpec {
            dst_address: snapshot.wan.shared_services_range.to_string(),
            gateway: interface_name.clone(),
            comment: format!("{}route-shared-services-{}", COMMENT_PREFIX, peer.id),
        });

        let firewall_rules = vec![
            FirewallRuleSpec {
                chain: "input".to_string(),
                action: "accept".to_string(),
                in_interface: Some(interface_name.clone()),
                out_interface: None,
                comment: format!("{}allow-input-wan-{}", COMMENT_PREFIX, peer.id),
            },
            FirewallRuleSpec {
                chain: "forward".to_string(),
                action: "accept".to_string(),
                in_interface: Some(interface_name.clone()),
                out_interface: None,
                comment: format!("{}allow-from-wan-{}", COMMENT_PREFIX, peer.id),
            },
            FirewallRuleSpec {
                chain: "forward".to_string(),
                action: "accept".to_string(),
                in_interface: None,
                out_interface: Some(interface_name.clone()),
                comment: format!("{}allow-to-wan-{}", COMMENT_PREFIX, peer.id),
            },
        ];

        let mut nat_rules = Vec::new();
        for service in &snapshot.peer.services {
            if !service.is_active {
                continue;
            }
            for proto in service.protocol.expand() {
                nat_rules.push(NatRuleSpec {
                    chain: "dstnat".to_string(),
                    dst_address: service.shared_ip.to_string(),
                    protocol: proto.to_string(),
                    action: "dst-nat".to_string(),
                    to_addresses: service.local_ip.to_string(),
                    dst_port: (service.shared_port > 0).then(|| service.shared_port.to_string()),
                    to_ports: (service.local_port > 0).then(|| service.local_port.to_string()),
                    comment: format!("{}service-{}", COMMENT_PREFIX, service.id),
                });
            }
        }

        DesiredState {
            interface,
            ip_addresses,
            peers,
            routes,
            firewall_rules,
            nat_rules,
        }
    }
}

/// Serialize a spec into a transport row (kebab-case keys, string values).
pub fn to_entry<T: Serialize>(spec: &T) -> RouterEntry {
    let mut entry = RouterEntry::new();
    if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(spec) {
        for (key, value) in map {
            let rendered = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            entry.insert(key, rendered);
        }
    }
    entry
}
