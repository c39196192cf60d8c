//! Subnet conflict detection
//!
//! Classifies overlaps between a peer's advertised subnets, the WAN's own
//! address ranges, sibling peers' subnets, and routes already present on a
//! target router. Each conflict carries a severity and suggested
//! resolutions so the operator can decide how to proceed.

use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// How severe a detected overlap is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    /// Overlap with the overlay's own ranges; blocks routing
    Critical,
    /// Overlap that may cause routing ambiguity
    Warning,
    /// Informational notice
    Info,
}

/// Suggested ways to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the subnet local; do not advertise it into the overlay
    DontRoute,
    /// Advertise a NAT-translated replacement subnet
    UseNat,
    /// Renumber the local subnet
    ChangeSubnet,
    /// Route only the non-overlapping portion
    SelectiveRouting,
}

/// The kind of overlap detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Candidate overlaps the WAN tunnel range
    TunnelIpOverlap,
    /// Candidate overlaps the WAN shared-services range
    SharedServicesOverlap,
    /// Candidate overlaps another peer's advertised subnet
    PeerSubnetOverlap,
    /// Candidate overlaps a route already present on the target router
    ExistingRouteOverlap,
}

impl ConflictType {
    /// Wire name of the conflict type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::TunnelIpOverlap => "tunnel_ip_overlap",
            ConflictType::SharedServicesOverlap => "shared_services_overlap",
            ConflictType::PeerSubnetOverlap => "peer_subnet_overlap",
            ConflictType::ExistingRouteOverlap => "existing_route_overlap",
        }
    }
}

impl ConflictResolution {
    /// Wire name of the resolution.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::DontRoute => "dont_route",
            ConflictResolution::UseNat => "use_nat",
            ConflictResolution::ChangeSubnet => "change_subnet",
            ConflictResolution::SelectiveRouting => "selective_routing",
        }
    }
}

/// A detected overlap between a candidate subnet and some other range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetConflict {
    /// The candidate subnet under scrutiny
    pub subnet: IpNetwork,
    /// Classification of the overlap
    pub conflict_type: ConflictType,
    /// Severity of the overlap
    pub severity: ConflictSeverity,
    /// Human-readable owner of the conflicting range
    pub conflicting_with: String,
    /// The range the candidate overlaps
    pub conflicting_subnet: IpNetwork,
    /// Human-readable summary
    pub description: String,
    /// Resolutions worth offering the operator
    pub suggested_resolutions: Vec<ConflictResolution>,
}

impl SubnetConflict {
    /// Whether this conflict should block a create operation.
    pub fn is_critical(&self) -> bool {
        self.severity == ConflictSeverity::Critical
    }
}

/// Advertised subnets of one peer, for cross-peer overlap checks.
#[derive(Debug, Clone)]
pub struct PeerSubnets {
    /// Peer id (skipped when it matches the peer under scrutiny)
    pub peer_id: Option<Uuid>,
    /// Peer display name for conflict descriptions
    pub peer_name: String,
    /// The peer's advertised subnets
    pub subnets: Vec<IpNetwork>,
}

/// Check whether two CIDR ranges overlap. Mixed address families never
/// overlap.
pub fn subnets_overlap(a: IpNetwork, b: IpNetwork) -> bool {
    match (a, b) {
        (IpNetwork::V4(a), IpNetwork::V4(b)) => a.overlaps(b),
        (IpNetwork::V6(a), IpNetwork::V6(b)) => a.overlaps(b),
        _ => false,
    }
}

/// Detect conflicts for a set of candidate subnets attributed to one peer.
///
/// `existing_routes` carries destinations already routed on the target
/// router, injected by preflight to surface dual-path ambiguity.
pub fn detect_conflicts(
    tunnel_range: IpNetwork,
    shared_services_range: IpNetwork,
    wan_peers: &[PeerSubnets],
    peer_id: Option<Uuid>,
    candidates: &[IpNetwork],
    existing_routes: &[IpNetwork],
) -> Vec<SubnetConflict> {
    let mut conflicts = Vec::new();

    for &subnet in candidates {
        if subnets_overlap(subnet, tunnel_range) {
            conflicts.push(SubnetConflict {
                subnet,
                conflict_type: ConflictType::TunnelIpOverlap,
                severity: ConflictSeverity::Critical,
                conflicting_with: "WAN Tunnel Network".to_string(),
                conflicting_subnet: tunnel_range,
                description: format!(
                    "Subnet {} overlaps with WAN tunnel IP range {}",
                    subnet, tunnel_range
                ),
                suggested_resolutions: vec![
                    ConflictResolution::DontRoute,
                    ConflictResolution::UseNat,
                    ConflictResolution::ChangeSubnet,
                ],
            });
        }

        if subnets_overlap(subnet, shared_services_range) {
            conflicts.push(SubnetConflict {
                subnet,
                conflict_type: ConflictType::SharedServicesOverlap,
                severity: ConflictSeverity::Critical,
                conflicting_with: "WAN Shared Services Network".to_string(),
                conflicting_subnet: shared_services_range,
                description: format!(
                    "Subnet {} overlaps with shared services range {}",
                    subnet, shared_services_range
                ),
                suggested_resolutions: vec![
                    ConflictResolution::DontRoute,
                    ConflictResolution::UseNat,
                    ConflictResolution::ChangeSubnet,
                ],
            });
        }

        for other in wan_peers {
            if other.peer_id.is_some() && other.peer_id == peer_id {
                continue;
            }
            for &other_subnet in &other.subnets {
                if subnets_overlap(subnet, other_subnet) {
                    conflicts.push(SubnetConflict {
                        subnet,
                        conflict_type: ConflictType::PeerSubnetOverlap,
                        severity: ConflictSeverity::Warning,
                        conflicting_with: format!("Peer: {}", other.peer_name),
                        conflicting_subnet: other_subnet,
                        description: format!(
                            "Subnet {} overlaps with {}'s subnet {}",
                            subnet, other.peer_name, other_subnet
                        ),
                        suggested_resolutions: vec![
                            ConflictResolution::UseNat,
                            ConflictResolution::SelectiveRouting,
                            ConflictResolution::ChangeSubnet,
                        ],
                    });
                }
            }
        }

        for &route in existing_routes {
            if subnets_overlap(subnet, route) {
                conflicts.push(SubnetConflict {
                    subnet,
                    conflict_type: ConflictType::ExistingRouteOverlap,
                    severity: ConflictSeverity::Warning,
                    conflicting_with: "Existing routed network".to_string(),
                    conflicting_subnet: route,
                    description: format!(
                        "Subnet {} overlaps with existing routed network {}",
                        subnet, route
                    ),
                    suggested_resolutions: vec![
                        ConflictResolution::DontRoute,
                        ConflictResolution::SelectiveRouting,
                        ConflictResolution::ChangeSubnet,
                    ],
                });
            }
        }
    }

    conflicts
}

/// Find a free subnet usable as a NAT translation target for a conflicting
/// subnet. The candidate keeps the same prefix length; 172.16.0.0/12 is
/// scanned first, then 192.168.0.0/16.
pub fn find_available_nat_subnet(
    conflicting_subnet: IpNetwork,
    existing_subnets: &[IpNetwork],
) -> Option<Ipv4Network> {
    let prefix = match conflicting_subnet {
        IpNetwork::V4(net) => net.prefix(),
        IpNetwork::V6(_) => return None,
    };

    let candidates_172 = (16u8..32).filter_map(move |base| {
        Ipv4Network::new(Ipv4Addr::new(172, base, 0, 0), prefix).ok()
    });
    let candidates_192 = (0u16..256).filter_map(move |third| {
        Ipv4Network::new(Ipv4Addr::new(192, 168, third as u8, 0), prefix).ok()
    });

    candidates_172.chain(candidates_192).find_map(|candidate| {
        // Normalize host bits away before comparing
        let candidate = Ipv4Network::new(candidate.network(), prefix).ok()?;
        let clashes = existing_subnets
            .iter()
            .any(|&existing| subnets_overlap(IpNetwork::V4(candidate), existing));
        if clashes {
            None
        } else {
            Some(candidate)
        }
    })
}
