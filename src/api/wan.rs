//! WAN network endpoints

use super::{ApiError, ApiResult, AppState};
use crate::allocation::PoolInfo;
use crate::conflict::{self, SubnetConflict};
use crate::model::{store::WanUpdate, PeerType, TopologyType, WanNetwork};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routes under `/api/wan`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_wans).post(create_wan))
        .route("/:wan_id", get(get_wan).put(update_wan).delete(delete_wan))
        .route("/:wan_id/ip-info", get(ip_info))
        .route("/:wan_id/conflicts", get(wan_conflicts))
        .route("/:wan_id/topology", get(topology))
}

#[derive(Debug, Deserialize)]
pub(super) struct WanCreate {
    name: String,
    description: Option<String>,
    tunnel_ip_range: Option<String>,
    shared_services_range: Option<String>,
    #[serde(default = "default_topology")]
    topology_type: TopologyType,
}

fn default_topology() -> TopologyType {
    TopologyType::Mesh
}

#[derive(Debug, Deserialize)]
struct WanUpdateBody {
    name: Option<String>,
    description: Option<String>,
    tunnel_ip_range: Option<String>,
    shared_services_range: Option<String>,
    topology_type: Option<TopologyType>,
}

#[derive(Debug, Serialize)]
pub(super) struct WanResponse {
    id: Uuid,
    name: String,
    description: Option<String>,
    tunnel_ip_range: Ipv4Network,
    shared_services_range: Ipv4Network,
    topology_type: TopologyType,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    peer_count: usize,
}

#[derive(Debug, Serialize)]
pub(super) struct WanListResponse {
    items: Vec<WanResponse>,
    total: usize,
}

fn wan_response(wan: WanNetwork, peer_count: usize) -> WanResponse {
    WanResponse {
        id: wan.id,
        name: wan.name,
        description: wan.description,
        tunnel_ip_range: wan.tunnel_ip_range,
        shared_services_range: wan.shared_services_range,
        topology_type: wan.topology_type,
        created_at: wan.created_at,
        updated_at: wan.updated_at,
        peer_count,
    }
}

/// Parse an operator-supplied pool range. Pools must be IPv4.
fn parse_pool(field: &str, value: &str) -> Result<Ipv4Network, ApiError> {
    match value.parse::<IpNetwork>() {
        Ok(IpNetwork::V4(net)) => Ok(net),
        Ok(IpNetwork::V6(_)) => Err(ApiError::bad_request(format!(
            "{}: IPv6 pools are not supported",
            field
        ))),
        Err(e) => Err(ApiError::bad_request(format!("{}: {}", field, e))),
    }
}

pub(super) async fn list_wans(State(state): State<AppState>) -> Json<WanListResponse> {
    let wans = state.store.list_wans();
    let items: Vec<WanResponse> = wans
        .into_iter()
        .map(|wan| {
            let count = state.store.wan_peer_count(wan.id);
            wan_response(wan, count)
        })
        .collect();
    let total = items.len();
    Json(WanListResponse { items, total })
}

pub(super) async fn create_wan(
    State(state): State<AppState>,
    Json(body): Json<WanCreate>,
) -> ApiResult<(StatusCode, Json<WanResponse>)> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("WAN name cannot be empty"));
    }
    let tunnel = parse_pool(
        "tunnel_ip_range",
        body.tunnel_ip_range
            .as_deref()
            .unwrap_or(&state.settings.default_tunnel_ip_range),
    )?;
    let shared = parse_pool(
        "shared_services_range",
        body.shared_services_range
            .as_deref()
            .unwrap_or(&state.settings.default_shared_services_range),
    )?;
    let wan = state.store.create_wan(
        body.name.trim(),
        body.description,
        tunnel,
        shared,
        body.topology_type,
    )?;
    Ok((StatusCode::CREATED, Json(wan_response(wan, 0))))
}

async fn get_wan(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
) -> ApiResult<Json<WanResponse>> {
    let wan = state.store.get_wan(wan_id)?;
    let count = state.store.wan_peer_count(wan_id);
    Ok(Json(wan_response(wan, count)))
}

async fn update_wan(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
    Json(body): Json<WanUpdateBody>,
) -> ApiResult<Json<WanResponse>> {
    let update = WanUpdate {
        name: body.name,
        description: body.description.map(Some),
        tunnel_ip_range: body
            .tunnel_ip_range
            .as_deref()
            .map(|v| parse_pool("tunnel_ip_range", v))
            .transpose()?,
        shared_services_range: body
            .shared_services_range
            .as_deref()
            .map(|v| parse_pool("shared_services_range", v))
            .transpose()?,
        topology_type: body.topology_type,
    };
    let wan = state.store.update_wan(wan_id, update)?;
    let count = state.store.wan_peer_count(wan_id);
    Ok(Json(wan_response(wan, count)))
}

async fn delete_wan(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.store.delete_wan(wan_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ip_info(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let wan = state.store.get_wan(wan_id)?;
    let tunnel_allocated = state.store.allocated_tunnel_ips(wan_id).len() as u32;
    let service_allocated = state.store.allocated_service_ips(wan_id).len() as u32;

    let tunnel_info = PoolInfo::describe(wan.tunnel_ip_range, tunnel_allocated);
    let shared_info = PoolInfo::describe(wan.shared_services_range, service_allocated);

    Ok(Json(serde_json::json!({
        "tunnel_network": tunnel_info,
        "shared_services_network": shared_info,
    })))
}

/// Serialized conflict for API responses.
pub(super) fn conflict_json(c: &SubnetConflict) -> serde_json::Value {
    serde_json::json!({
        "subnet": c.subnet.to_string(),
        "conflict_type": c.conflict_type.as_str(),
        "severity": c.severity,
        "conflicting_with": c.conflicting_with,
        "conflicting_subnet": c.conflicting_subnet.to_string(),
        "description": c.description,
        "suggested_resolutions": c
            .suggested_resolutions
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>(),
    })
}

async fn wan_conflicts(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let wan = state.store.get_wan(wan_id)?;
    let views = state.store.peer_subnet_views(wan_id);

    let mut conflicts = Vec::new();
    for view in &views {
        conflicts.extend(conflict::detect_conflicts(
            IpNetwork::V4(wan.tunnel_ip_range),
            IpNetwork::V4(wan.shared_services_range),
            &views,
            view.peer_id,
            &view.subnets,
            &[],
        ));
    }

    Ok(Json(serde_json::json!({
        "conflicts": conflicts.iter().map(conflict_json).collect::<Vec<_>>(),
        "total": conflicts.len(),
    })))
}

async fn topology(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let wan = state.store.get_wan(wan_id)?;
    let peers = state.store.list_peers(wan_id, None);

    let nodes: Vec<serde_json::Value> = peers
        .iter()
        .map(|peer| {
            serde_json::json!({
                "id": peer.id,
                "name": peer.name,
                "type": peer.peer_type,
                "tunnel_ip": peer.tunnel_ip,
                "is_online": peer.is_online,
                "endpoint": peer.endpoint,
                "subnet_count": state.store.subnets_for_peer(peer.id).len(),
                "service_count": state.store.list_services(wan_id, Some(peer.id)).len(),
                "is_managed": peer.is_managed(),
                "api_status": peer.managed.as_ref().map(|m| m.api_status),
            })
        })
        .collect();

    let mut edges = Vec::new();
    match wan.topology_type {
        TopologyType::Mesh | TopologyType::Hybrid => {
            for (i, a) in peers.iter().enumerate() {
                for b in peers.iter().skip(i + 1) {
                    edges.push(serde_json::json!({
                        "source": a.id,
                        "target": b.id,
                        "type": "mesh",
                    }));
                }
            }
        }
        TopologyType::HubSpoke => {
            if let Some(hub) = peers.iter().find(|p| p.peer_type == PeerType::Hub) {
                for peer in &peers {
                    if peer.id != hub.id {
                        edges.push(serde_json::json!({
                            "source": hub.id,
                            "target": peer.id,
                            "type": "hub-spoke",
                        }));
                    }
                }
            }
        }
    }

    Ok(Json(serde_json::json!({
        "wan_id": wan.id,
        "wan_name": wan.name,
        "topology_type": wan.topology_type,
        "nodes": nodes,
        "edges": edges,
    })))
}
