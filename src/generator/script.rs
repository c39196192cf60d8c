//! RouterOS script generation
//!
//! Serializes the desired state as an idempotent command stream for
//! operators who apply configuration by hand or through the script-exec
//! surface: create-or-set for the interface and address, delete-all-with-
//! prefix then recreate for peers, routes, firewall and NAT, with
//! verification prints at the end.

use super::{allowed_ips, parse_endpoint, DEFAULT_INTERFACE_NAME, DEFAULT_WG_PORT};
use crate::model::OverlaySnapshot;
use crate::COMMENT_PREFIX;
use chrono::Utc;
use uuid::Uuid;

/// Generate the RouterOS script for the snapshot's target peer.
pub fn routeros_script(snapshot: &OverlaySnapshot, private_key: &str) -> String {
    let peer = &snapshot.peer.peer;
    let interface_name = peer
        .managed
        .as_ref()
        .and_then(|m| m.interface_name.clone())
        .unwrap_or_else(|| DEFAULT_INTERFACE_NAME.to_string());
    let listen_port = peer.listen_port.unwrap_or(DEFAULT_WG_PORT);
    let config_id = Uuid::new_v4().to_string()[..8].to_string();

    let mut lines = vec![
        format!("# WAN-Overlay-Manager: {}", peer.name),
        format!("# Configuration ID: {}", config_id),
        format!("# Generated: {}", Utc::now().to_rfc3339()),
        String::new(),
        "# IMPORTANT: Review this script before applying".to_string(),
        "# This script is designed to be non-destructive".to_string(),
        String::new(),
        "# Step 1: Create Wireguard interface if not exists".to_string(),
        "/interface wireguard".to_string(),
        format!(":if ([:len [find name=\"{}\"]] = 0) do={{", interface_name),
        format!(
            "  add name={} listen-port={} private-key=\"{}\" \\",
            interface_name, listen_port, private_key
        ),
        format!("      comment=\"{}peer-{}\"", COMMENT_PREFIX, peer.id),
        "} else={".to_string(),
        format!(
            "  set [find name=\"{}\"] listen-port={} private-key=\"{}\"",
            interface_name, listen_port, private_key
        ),
        "}".to_string(),
        String::new(),
        "# Step 2: Remove old peers managed by this system".to_string(),
        "/interface wireguard peers".to_string(),
        format!(":foreach peer in=[find comment~\"{}\"] do={{", COMMENT_PREFIX),
        "  remove $peer".to_string(),
        "}".to_string(),
        String::new(),
        "# Step 3: Add Wireguard peers".to_string(),
        "/interface wireguard peers".to_string(),
    ];

    for other in &snapshot.others {
        let Some(public_key) = other.peer.public_key.as_deref() else {
            continue;
        };
        let ips = allowed_ips(other, snapshot.wan.shared_services_range, false);
        let keepalive = other.peer.persistent_keepalive.unwrap_or(25);

        lines.push(format!(
            "add interface={} public-key=\"{}\" \\",
            interface_name, public_key
        ));
        if let Some(endpoint) = other.peer.endpoint.as_deref() {
            if let Ok((host, port)) = parse_endpoint(endpoint) {
                lines.push(format!(
                    "    endpoint-address={} endpoint-port={} \\",
                    host, port
                ));
            }
        }
        lines.push(format!("    allowed-address={} \\", ips.join(",")));
        lines.push(format!(
            "    persistent-keepalive={}s comment=\"{}peer-{}\"",
            keepalive, COMMENT_PREFIX, other.peer.id
        ));
    }

    let tunnel_address = peer
        .tunnel_ip
        .map(|ip| format!("{}/24", ip))
        .unwrap_or_default();
    lines.extend([
        String::new(),
        "# Step 4: Configure IP addressing".to_string(),
        "/ip address".to_string(),
        format!(
            ":if ([:len [find address=\"{}\" interface=\"{}\"]] = 0) do={{",
            tunnel_address, interface_name
        ),
        format!("  add address={} interface={} \\", tunnel_address, interface_name),
        format!("      comment=\"{}peer-{}\"", COMMENT_PREFIX, peer.id),
        "}".to_string(),
        String::new(),
        "# Step 5: Remove old routes managed by this system".to_string(),
        "/ip route".to_string(),
        format!(":foreach route in=[find comment~\"{}\"] do={{", COMMENT_PREFIX),
        "  remove $route".to_string(),
        "}".to_string(),
        String::new(),
        "# Step 6: Add routes for remote networks".to_string(),
        "/ip route".to_string(),
    ]);

    for other in &snapshot.others {
        for subnet in &other.subnets {
            if subnet.is_routed {
                lines.push(format!(
                    "add dst-address={} gateway={} \\",
                    subnet.advertised_cidr(),
                    interface_name
                ));
                lines.push(format!(
                    "    comment=\"{}route-to-{}\"",
                    COMMENT_PREFIX, other.peer.id
                ));
            }
        }
    }
    lines.push(format!(
        "add dst-address={} gateway={} \\",
        snapshot.wan.shared_services_range, interface_name
    ));
    lines.push(format!(
        "    comment=\"{}route-shared-services-{}\"",
        COMMENT_PREFIX, peer.id
    ));

    lines.extend([
        String::new(),
        "# Step 7: Remove old firewall rules managed by this system".to_string(),
        "/ip firewall filter".to_string(),
        format!(":foreach rule in=[find comment~\"{}\"] do={{", COMMENT_PREFIX),
        "  remove $rule".to_string(),
        "}".to_string(),
        String::new(),
        "# Step 8: Add firewall rules to allow forwarding".to_string(),
        "/ip firewall filter".to_string(),
        format!("add chain=input in-interface={} action=accept \\", interface_name),
        format!("    comment=\"{}allow-input-wan-{}\"", COMMENT_PREFIX, peer.id),
        format!("add chain=forward in-interface={} action=accept \\", interface_name),
        format!(
            "    place-before=0 comment=\"{}allow-from-wan-{}\"",
            COMMENT_PREFIX, peer.id
        ),
        format!("add chain=forward out-interface={} action=accept \\", interface_name),
        format!(
            "    place-before=1 comment=\"{}allow-to-wan-{}\"",
            COMMENT_PREFIX, peer.id
        ),
    ]);

    let active_services: Vec<_> = snapshot
        .peer
        .services
        .iter()
        .filter(|s| s.is_active)
        .collect();
    if !active_services.is_empty() {
        lines.extend([
            String::new(),
            "# Step 9: Remove old NAT rules managed by this system".to_string(),
            "/ip firewall nat".to_string(),
            format!(":foreach rule in=[find comment~\"{}\"] do={{", COMMENT_PREFIX),
            "  remove $rule".to_string(),
            "}".to_string(),
            String::new(),
            "# Step 10: NAT rules for published services".to_string(),
            "/ip firewall nat".to_string(),
        ]);

        for service in active_services {
            for proto in service.protocol.expand() {
                lines.push(format!(
                    "add chain=dstnat dst-address={} protocol={} \\",
                    service.shared_ip, proto
                ));
                let dst_port_clause = if service.shared_port > 0 {
                    format!("dst-port={} ", service.shared_port)
                } else {
                    String::new()
                };
                let to_ports_clause = if service.local_port > 0 {
                    format!("to-ports={} ", service.local_port)
                } else {
                    String::new()
                };
                lines.push(format!(
                    "    {}action=dst-nat to-addresses={} {}\\",
                    dst_port_clause, service.local_ip, to_ports_clause
                ));
                lines.push(format!(
                    "    comment=\"{}service-{}\"",
                    COMMENT_PREFIX, service.id
                ));

                // Source NAT for return traffic
                lines.push(format!(
                    "add chain=srcnat src-address={} out-interface={} \\",
                    service.local_ip, interface_name
                ));
                lines.push(format!(
                    "    action=src-nat to-addresses={} \\",
                    service.shared_ip
                ));
                lines.push(format!(
                    "    comment=\"{}service-{}-srcnat\"",
                    COMMENT_PREFIX, service.id
                ));
            }
        }
    }

    lines.extend([
        String::new(),
        "# Verification commands".to_string(),
        ":put \"Configuration applied. Verifying...\"".to_string(),
        "/interface wireguard print".to_string(),
        "/interface wireguard peers print".to_string(),
        ":put \"Check peer handshakes above. Recent timestamps indicate successful connection.\""
            .to_string(),
    ]);

    lines.join("\n")
}
