//! Published service endpoints

use super::{ApiError, ApiResult, AppState};
use crate::model::store::NewService;
use crate::model::{PublishedService, ServiceProtocol};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::warn;
use uuid::Uuid;

/// Routes under `/api/services`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/wan/:wan_id", get(list_services))
        .route("/peer/:peer_id", axum::routing::post(create_service))
        .route(
            "/:service_id",
            get(get_service).put(update_service).delete(delete_service),
        )
}

#[derive(Debug, Deserialize)]
struct ServiceCreate {
    name: String,
    description: Option<String>,
    local_ip: IpAddr,
    local_port: u16,
    shared_port: Option<u16>,
    #[serde(default = "default_protocol")]
    protocol: ServiceProtocol,
}

fn default_protocol() -> ServiceProtocol {
    ServiceProtocol::Tcp
}

#[derive(Debug, Deserialize)]
struct ServiceUpdate {
    name: Option<String>,
    description: Option<String>,
    local_ip: Option<IpAddr>,
    local_port: Option<u16>,
    shared_port: Option<u16>,
    protocol: Option<ServiceProtocol>,
    is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ServiceResponse {
    #[serde(flatten)]
    service: PublishedService,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
}

#[derive(Debug, Serialize)]
struct ServiceListResponse {
    items: Vec<ServiceResponse>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    peer_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    #[serde(default)]
    auto_deploy: bool,
}

fn service_response(state: &AppState, service: PublishedService, wan_name: &str) -> ServiceResponse {
    let hostname = state
        .dns
        .is_configured()
        .then(|| state.dns.build_hostname(&service.name, service.id, wan_name));
    ServiceResponse { service, hostname }
}

async fn list_services(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ServiceListResponse>> {
    let wan = state.store.get_wan(wan_id)?;
    let services = state.store.list_services(wan_id, query.peer_id);
    let items: Vec<ServiceResponse> = services
        .into_iter()
        .map(|s| service_response(&state, s, &wan.name))
        .collect();
    let total = items.len();
    Ok(Json(ServiceListResponse { items, total }))
}

async fn create_service(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<CreateQuery>,
    Json(body): Json<ServiceCreate>,
) -> ApiResult<(StatusCode, Json<ServiceResponse>)> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("Service name cannot be empty"));
    }
    let peer = state.store.get_peer(peer_id)?;
    let wan = state.store.get_wan(peer.wan_id)?;

    let service = state.store.create_service(NewService {
        peer_id,
        name: body.name.trim().to_string(),
        description: body.description,
        local_ip: body.local_ip,
        local_port: body.local_port,
        shared_port: body.shared_port,
        protocol: body.protocol,
    })?;

    // DNS publication must never fail service creation.
    let hostname = if state.dns.is_configured() {
        let hostname = state.dns.build_hostname(&service.name, service.id, &wan.name);
        state
            .dns
            .add_record(&hostname, &service.shared_ip.to_string())
            .await;
        Some(hostname)
    } else {
        None
    };

    // Fan out: managed peers with auto-deploy get a job when requested;
    // everyone else is flagged for a config refresh.
    let wan_peers = state.store.list_peers(peer.wan_id, None);
    for wan_peer in &wan_peers {
        let auto = wan_peer
            .managed
            .as_ref()
            .map(|m| m.auto_deploy)
            .unwrap_or(false);
        if wan_peer.is_managed() && auto {
            if query.auto_deploy {
                if let Err(err) = state.engine.start_apply(wan_peer.id, None) {
                    warn!(peer = %wan_peer.name, error = %err, "auto-deploy not queued");
                }
            }
        } else {
            let _ = state.store.with_peer_mut(wan_peer.id, |p| {
                p.peer_metadata.needs_config_refresh = true;
            });
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(ServiceResponse { service, hostname }),
    ))
}

async fn get_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<ServiceResponse>> {
    let service = state.store.get_service(service_id)?;
    let peer = state.store.get_peer(service.peer_id)?;
    let wan = state.store.get_wan(peer.wan_id)?;
    Ok(Json(service_response(&state, service, &wan.name)))
}

async fn update_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
    Json(body): Json<ServiceUpdate>,
) -> ApiResult<Json<ServiceResponse>> {
    let service = state.store.with_service_mut(service_id, |service| {
        if let Some(name) = body.name.clone() {
            service.name = name;
        }
        if let Some(description) = body.description.clone() {
            service.description = Some(description);
        }
        if let Some(local_ip) = body.local_ip {
            service.local_ip = local_ip;
        }
        if let Some(local_port) = body.local_port {
            service.local_port = local_port;
        }
        if let Some(shared_port) = body.shared_port {
            service.shared_port = shared_port;
        }
        if let Some(protocol) = body.protocol {
            service.protocol = protocol;
        }
        if let Some(is_active) = body.is_active {
            service.is_active = is_active;
        }
        service.clone()
    })?;

    let peer = state.store.get_peer(service.peer_id)?;
    let wan = state.store.get_wan(peer.wan_id)?;
    Ok(Json(service_response(&state, service, &wan.name)))
}

async fn delete_service(
    State(state): State<AppState>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let service = state.store.get_service(service_id)?;

    // Unpublish DNS best-effort before the row disappears.
    if state.dns.is_configured() {
        let wan_name = state
            .store
            .get_peer(service.peer_id)
            .and_then(|p| state.store.get_wan(p.wan_id))
            .map(|w| w.name)
            .unwrap_or_default();
        let hostname = state.dns.build_hostname(&service.name, service.id, &wan_name);
        state
            .dns
            .delete_record(&hostname, &service.shared_ip.to_string())
            .await;
    }

    state.store.delete_service(service_id)?;
    Ok(StatusCode::NO_CONTENT)
}
