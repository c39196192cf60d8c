//! Peer endpoints, including managed-router actions

use super::wan::conflict_json;
use super::{ApiError, ApiResult, AppState};
use crate::conflict;
use crate::generator::{self, parse_endpoint};
use crate::model::store::{NewPeer, NewSubnet};
use crate::model::{AuthMethod, ConfigType, LocalSubnet, ManagedDevice, Peer, PeerType};
use crate::wireguard::KeyPair;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Routes under `/api/peers`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/wan/:wan_id", get(list_peers).post(create_peer))
        .route("/:peer_id", get(get_peer).put(update_peer).delete(delete_peer))
        .route("/:peer_id/regenerate-keys", post(regenerate_keys))
        .route("/:peer_id/config", get(get_config))
        .route("/:peer_id/check-conflicts", get(check_conflicts))
        .route("/:peer_id/subnets", post(add_subnet))
        .route("/:peer_id/subnets/:subnet_id", delete(delete_subnet))
        .route("/:peer_id/mikrotik/test-connection", post(test_connection))
        .route("/:peer_id/mikrotik/preflight", get(preflight))
        .route("/:peer_id/mikrotik/verify", get(verify))
        .route("/:peer_id/mikrotik/revert", post(revert))
        .route("/:peer_id/mikrotik/clear", post(clear))
        .route("/:peer_id/mikrotik/deploy", post(deploy))
}

#[derive(Debug, Deserialize)]
struct SubnetCreate {
    cidr: String,
    #[serde(default = "default_true")]
    is_routed: bool,
    #[serde(default)]
    nat_enabled: bool,
    nat_translated_cidr: Option<String>,
    description: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PeerCreate {
    name: String,
    #[serde(rename = "type")]
    peer_type: PeerType,
    endpoint: Option<String>,
    listen_port: Option<u16>,
    persistent_keepalive: Option<u16>,
    #[serde(default)]
    local_subnets: Vec<SubnetCreate>,

    // Managed-device settings (used when type is mikrotik)
    mikrotik_management_ip: Option<String>,
    mikrotik_api_port: Option<u16>,
    mikrotik_auth_method: Option<AuthMethod>,
    mikrotik_username: Option<String>,
    mikrotik_password: Option<String>,
    mikrotik_api_token: Option<String>,
    mikrotik_use_ssl: Option<bool>,
    mikrotik_verify_cert: Option<bool>,
    mikrotik_auto_deploy: Option<bool>,
    mikrotik_interface_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PeerUpdate {
    name: Option<String>,
    endpoint: Option<String>,
    listen_port: Option<u16>,
    persistent_keepalive: Option<u16>,
    route_all_traffic: Option<bool>,

    mikrotik_management_ip: Option<String>,
    mikrotik_api_port: Option<u16>,
    mikrotik_auth_method: Option<AuthMethod>,
    mikrotik_username: Option<String>,
    mikrotik_password: Option<String>,
    mikrotik_api_token: Option<String>,
    mikrotik_use_ssl: Option<bool>,
    mikrotik_verify_cert: Option<bool>,
    mikrotik_auto_deploy: Option<bool>,
    mikrotik_interface_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct PeerResponse {
    #[serde(flatten)]
    peer: Peer,
    local_subnets: Vec<LocalSubnet>,
}

#[derive(Debug, Serialize)]
struct PeerListResponse {
    items: Vec<PeerResponse>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    peer_type: Option<PeerType>,
}

fn peer_response(state: &AppState, peer: Peer) -> PeerResponse {
    let local_subnets = state.store.subnets_for_peer(peer.id);
    PeerResponse {
        peer,
        local_subnets,
    }
}

fn parse_subnets(subnets: &[SubnetCreate]) -> ApiResult<Vec<NewSubnet>> {
    subnets
        .iter()
        .map(|s| {
            let cidr: IpNetwork = s
                .cidr
                .parse()
                .map_err(|e| ApiError::bad_request(format!("cidr: {}", e)))?;
            let nat_translated_cidr = s
                .nat_translated_cidr
                .as_deref()
                .map(|c| {
                    c.parse::<IpNetwork>()
                        .map_err(|e| ApiError::bad_request(format!("nat_translated_cidr: {}", e)))
                })
                .transpose()?;
            Ok(NewSubnet {
                cidr,
                is_routed: s.is_routed,
                nat_enabled: s.nat_enabled,
                nat_translated_cidr,
                description: s.description.clone(),
            })
        })
        .collect()
}

async fn list_peers(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<PeerListResponse>> {
    state.store.get_wan(wan_id)?;
    let peers = state.store.list_peers(wan_id, query.peer_type);
    let items: Vec<PeerResponse> = peers
        .into_iter()
        .map(|p| peer_response(&state, p))
        .collect();
    let total = items.len();
    Ok(Json(PeerListResponse { items, total }))
}

async fn create_peer(
    State(state): State<AppState>,
    Path(wan_id): Path<Uuid>,
    Json(body): Json<PeerCreate>,
) -> ApiResult<(StatusCode, Json<PeerResponse>)> {
    let wan = state.store.get_wan(wan_id)?;
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("Peer name cannot be empty"));
    }
    if let Some(endpoint) = body.endpoint.as_deref() {
        parse_endpoint(endpoint)?;
    }
    let subnets = parse_subnets(&body.local_subnets)?;

    // Gate on critical conflicts before allocating anything.
    if !subnets.is_empty() {
        let views = state.store.peer_subnet_views(wan_id);
        let candidates: Vec<IpNetwork> = subnets.iter().map(|s| s.cidr).collect();
        let conflicts = conflict::detect_conflicts(
            IpNetwork::V4(wan.tunnel_ip_range),
            IpNetwork::V4(wan.shared_services_range),
            &views,
            None,
            &candidates,
            &[],
        );
        let critical: Vec<_> = conflicts.iter().filter(|c| c.is_critical()).collect();
        if !critical.is_empty() {
            return Err(ApiError::structured(
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "message": "Critical subnet conflicts detected",
                    "conflicts": critical
                        .iter()
                        .map(|c| serde_json::json!({
                            "subnet": c.subnet.to_string(),
                            "conflict_type": c.conflict_type.as_str(),
                            "description": c.description,
                        }))
                        .collect::<Vec<_>>(),
                }),
            ));
        }
    }

    let keypair = KeyPair::generate();
    let private_key_encrypted = state.envelope.encrypt(&keypair.private.to_base64())?;

    let managed = if body.peer_type == PeerType::Mikrotik {
        let mut device = ManagedDevice {
            management_ip: body.mikrotik_management_ip.clone(),
            api_port: body
                .mikrotik_api_port
                .unwrap_or(state.settings.mikrotik_default_api_port),
            auth_method: body.mikrotik_auth_method.unwrap_or(AuthMethod::Password),
            username: body.mikrotik_username.clone(),
            use_ssl: body.mikrotik_use_ssl.unwrap_or(true),
            verify_cert: body.mikrotik_verify_cert.unwrap_or(false),
            auto_deploy: body.mikrotik_auto_deploy.unwrap_or(false),
            interface_name: Some(
                body.mikrotik_interface_name
                    .clone()
                    .unwrap_or_else(|| state.settings.mikrotik_default_interface_name.clone()),
            ),
            ..ManagedDevice::default()
        };
        if let Some(password) = body.mikrotik_password.as_deref() {
            device.password_encrypted = Some(state.envelope.encrypt(password)?);
        }
        if let Some(token) = body.mikrotik_api_token.as_deref() {
            device.api_token_encrypted = Some(state.envelope.encrypt(token)?);
        }
        Some(device)
    } else {
        None
    };

    let peer = state.store.create_peer(NewPeer {
        wan_id,
        name: body.name.trim().to_string(),
        peer_type: body.peer_type,
        public_key: Some(keypair.public.to_base64()),
        private_key_encrypted: Some(private_key_encrypted),
        endpoint: body.endpoint,
        listen_port: body.listen_port,
        persistent_keepalive: body.persistent_keepalive,
        managed,
        subnets,
    })?;

    Ok((StatusCode::CREATED, Json(peer_response(&state, peer))))
}

async fn get_peer(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<Json<PeerResponse>> {
    let peer = state.store.get_peer(peer_id)?;
    Ok(Json(peer_response(&state, peer)))
}

async fn update_peer(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Json(body): Json<PeerUpdate>,
) -> ApiResult<Json<PeerResponse>> {
    if let Some(endpoint) = body.endpoint.as_deref() {
        parse_endpoint(endpoint)?;
    }
    let password_encrypted = body
        .mikrotik_password
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| state.envelope.encrypt(p))
        .transpose()?;
    let token_encrypted = body
        .mikrotik_api_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(|t| state.envelope.encrypt(t))
        .transpose()?;

    let peer = state.store.with_peer_mut(peer_id, |peer| {
        if let Some(name) = body.name.clone() {
            peer.name = name;
        }
        if let Some(endpoint) = body.endpoint.clone() {
            peer.endpoint = Some(endpoint);
        }
        if let Some(port) = body.listen_port {
            peer.listen_port = Some(port);
        }
        if let Some(keepalive) = body.persistent_keepalive {
            peer.persistent_keepalive = Some(keepalive);
        }
        if let Some(route_all) = body.route_all_traffic {
            peer.peer_metadata.route_all_traffic = route_all;
        }
        if let Some(managed) = peer.managed.as_mut() {
            if let Some(ip) = body.mikrotik_management_ip.clone() {
                managed.management_ip = Some(ip);
            }
            if let Some(port) = body.mikrotik_api_port {
                managed.api_port = port;
            }
            if let Some(method) = body.mikrotik_auth_method {
                managed.auth_method = method;
            }
            if let Some(username) = body.mikrotik_username.clone() {
                managed.username = Some(username);
            }
            if let Some(encrypted) = password_encrypted.clone() {
                managed.password_encrypted = Some(encrypted);
            }
            if let Some(encrypted) = token_encrypted.clone() {
                managed.api_token_encrypted = Some(encrypted);
            }
            if let Some(use_ssl) = body.mikrotik_use_ssl {
                managed.use_ssl = use_ssl;
            }
            if let Some(verify) = body.mikrotik_verify_cert {
                managed.verify_cert = verify;
            }
            if let Some(auto) = body.mikrotik_auto_deploy {
                managed.auto_deploy = auto;
            }
            if let Some(name) = body.mikrotik_interface_name.clone() {
                managed.interface_name = Some(name);
            }
        }
        peer.clone()
    })?;

    Ok(Json(peer_response(&state, peer)))
}

async fn delete_peer(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let peer = state.store.get_peer(peer_id)?;

    // Best-effort cleanup of managed configuration before deletion.
    if peer.is_managed() {
        if let Err(err) = state.engine.clear(peer_id).await {
            warn!(peer = %peer.name, error = %err, "could not clear router before deletion");
        }
    }

    state.store.delete_peer(peer_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn regenerate_keys(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<Json<PeerResponse>> {
    let keypair = KeyPair::generate();
    let encrypted = state.envelope.encrypt(&keypair.private.to_base64())?;
    let peer = state.store.with_peer_mut(peer_id, |peer| {
        peer.public_key = Some(keypair.public.to_base64());
        peer.private_key_encrypted = Some(encrypted.clone());
        peer.clone()
    })?;
    Ok(Json(peer_response(&state, peer)))
}

#[derive(Debug, Deserialize)]
struct ConfigQuery {
    #[serde(default = "default_config_type")]
    config_type: String,
}

fn default_config_type() -> String {
    "wireguard".to_string()
}

async fn get_config(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<ConfigQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let snapshot = state.store.overlay_snapshot(peer_id)?;
    let private_key = match snapshot.peer.peer.private_key_encrypted.as_deref() {
        Some(enc) => state.envelope.decrypt(enc)?,
        None => String::new(),
    };

    let (config_text, config_type) = match query.config_type.as_str() {
        "wireguard" => (
            generator::wireguard_config(&snapshot, &private_key),
            ConfigType::Wireguard,
        ),
        "mikrotik-script" => (
            generator::routeros_script(&snapshot, &private_key),
            ConfigType::MikrotikScript,
        ),
        other => {
            return Err(ApiError::bad_request(format!(
                "config_type must be 'wireguard' or 'mikrotik-script', got '{}'",
                other
            )))
        }
    };

    state
        .store
        .add_history(peer_id, config_type, config_text.clone(), false)?;

    // The operator now holds a current config.
    state.store.with_peer_mut(peer_id, |peer| {
        peer.peer_metadata.needs_config_refresh = false;
    })?;

    Ok(Json(serde_json::json!({
        "config_type": query.config_type,
        "config_text": config_text,
        "peer_name": snapshot.peer.peer.name,
        "generated_at": Utc::now(),
    })))
}

async fn check_conflicts(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let peer = state.store.get_peer(peer_id)?;
    let wan = state.store.get_wan(peer.wan_id)?;
    let views = state.store.peer_subnet_views(peer.wan_id);
    let candidates: Vec<IpNetwork> = state
        .store
        .subnets_for_peer(peer_id)
        .iter()
        .map(|s| s.cidr)
        .collect();

    let conflicts = conflict::detect_conflicts(
        IpNetwork::V4(wan.tunnel_ip_range),
        IpNetwork::V4(wan.shared_services_range),
        &views,
        Some(peer_id),
        &candidates,
        &[],
    );

    Ok(Json(serde_json::json!({
        "peer_id": peer_id,
        "conflicts": conflicts.iter().map(conflict_json).collect::<Vec<_>>(),
        "has_critical_conflicts": conflicts.iter().any(|c| c.is_critical()),
    })))
}

#[derive(Debug, Deserialize)]
struct SubnetQuery {
    cidr: String,
    #[serde(default = "default_true")]
    is_routed: bool,
    description: Option<String>,
}

async fn add_subnet(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<SubnetQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let peer = state.store.get_peer(peer_id)?;
    let wan = state.store.get_wan(peer.wan_id)?;
    let cidr: IpNetwork = query
        .cidr
        .parse()
        .map_err(|e| ApiError::bad_request(format!("cidr: {}", e)))?;

    // Advisory: the subnet is stored either way, conflicts ride along.
    let views = state.store.peer_subnet_views(peer.wan_id);
    let conflicts = conflict::detect_conflicts(
        IpNetwork::V4(wan.tunnel_ip_range),
        IpNetwork::V4(wan.shared_services_range),
        &views,
        Some(peer_id),
        &[cidr],
        &[],
    );

    let subnet = state.store.add_subnet(
        peer_id,
        NewSubnet {
            cidr,
            is_routed: query.is_routed,
            nat_enabled: false,
            nat_translated_cidr: None,
            description: query.description,
        },
    )?;

    Ok(Json(serde_json::json!({
        "subnet": subnet,
        "conflicts": conflicts.iter().map(conflict_json).collect::<Vec<_>>(),
    })))
}

async fn delete_subnet(
    State(state): State<AppState>,
    Path((peer_id, subnet_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.store.delete_subnet(peer_id, subnet_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------------
// Managed-router actions
// ----------------------------------------------------------------------

async fn test_connection(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<Json<crate::deploy::TestConnectionResult>> {
    Ok(Json(state.engine.test_connection(peer_id).await?))
}

async fn preflight(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<Json<crate::deploy::PreflightReport>> {
    Ok(Json(state.engine.preflight(peer_id).await?))
}

async fn verify(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<Json<crate::deploy::VerifyReport>> {
    Ok(Json(state.engine.verify(peer_id).await?))
}

async fn revert(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.revert(peer_id).await?;
    Ok(Json(serde_json::json!({
        "message": "Reverted to last deployed configuration"
    })))
}

async fn clear(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.clear(peer_id).await?;
    Ok(Json(serde_json::json!({
        "message": "Managed configuration cleared from router"
    })))
}

#[derive(Debug, Deserialize)]
struct DeployQuery {
    #[serde(default)]
    approve: bool,
}

async fn deploy(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<DeployQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.settings.require_deploy_approval && !query.approve {
        let plan = state.engine.plan(peer_id).await?;
        return Ok(Json(serde_json::json!({
            "message": "Approval required",
            "plan": plan,
        })));
    }

    let job = state.engine.start_apply(peer_id, None)?;
    Ok(Json(serde_json::json!({
        "message": "Deployment job created",
        "job_id": job.id,
        "status": job.status,
    })))
}
