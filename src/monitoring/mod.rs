//! Metrics snapshot
//!
//! Renders a Prometheus-style text exposition from store counters. The
//! gauge set mirrors what operators watch during rollouts: peer liveness,
//! published services, and deployment jobs by status.

use crate::model::{JobStatus, Store};
use std::fmt::Write as _;

/// Render the metrics exposition for the `/metrics` endpoint.
pub fn render_metrics(store: &Store) -> String {
    let (peers_total, peers_online, services_total, jobs) = store.metrics_counts();

    let mut out = String::new();
    out.push_str("# HELP wirewan_peers_total Total peers\n");
    out.push_str("# TYPE wirewan_peers_total gauge\n");
    let _ = writeln!(out, "wirewan_peers_total {}", peers_total);

    out.push_str("# HELP wirewan_peers_online Online peers\n");
    out.push_str("# TYPE wirewan_peers_online gauge\n");
    let _ = writeln!(out, "wirewan_peers_online {}", peers_online);

    out.push_str("# HELP wirewan_services_total Total published services\n");
    out.push_str("# TYPE wirewan_services_total gauge\n");
    let _ = writeln!(out, "wirewan_services_total {}", services_total);

    out.push_str("# HELP wirewan_jobs_total Deployment jobs by status\n");
    out.push_str("# TYPE wirewan_jobs_total gauge\n");
    for status in JobStatus::all() {
        let count = jobs.get(&status).copied().unwrap_or(0);
        let _ = writeln!(out, "wirewan_jobs_total{{status=\"{}\"}} {}", status, count);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{store::NewPeer, PeerType, TopologyType};

    #[test]
    fn test_render_empty_store() {
        let store = Store::new();
        let metrics = render_metrics(&store);
        assert!(metrics.contains("wirewan_peers_total 0"));
        assert!(metrics.contains("wirewan_jobs_total{status=\"pending\"} 0"));
        assert!(metrics.contains("wirewan_jobs_total{status=\"cancelled\"} 0"));
    }

    #[test]
    fn test_counts_reflect_store() {
        let store = Store::new();
        let wan = store
            .create_wan(
                "wan",
                None,
                "10.0.0.0/24".parse().unwrap(),
                "10.0.5.0/24".parse().unwrap(),
                TopologyType::Mesh,
            )
            .unwrap();
        let peer = store
            .create_peer(NewPeer {
                wan_id: wan.id,
                name: "a".to_string(),
                peer_type: PeerType::Server,
                public_key: None,
                private_key_encrypted: None,
                endpoint: None,
                listen_port: None,
                persistent_keepalive: None,
                managed: None,
                subnets: Vec::new(),
            })
            .unwrap();
        store.with_peer_mut(peer.id, |p| p.is_online = true).unwrap();

        let metrics = render_metrics(&store);
        assert!(metrics.contains("wirewan_peers_total 1"));
        assert!(metrics.contains("wirewan_peers_online 1"));
    }
}
