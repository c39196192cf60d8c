//! The deployment engine

use super::{
    DeployPlan, FamilyPlan, PlanInterface, PlanSummary, PreflightIssue, PreflightReport,
    RouterConnector, TestConnectionResult, VerifyReport,
};
use crate::config::Settings;
use crate::conflict;
use crate::error::{Result, WirewanError};
use crate::generator::{self, to_entry, DesiredState};
use crate::model::{
    ApiCallRecord, ApiStatus, ConfigType, DeploymentJob, JobStatus, JobType, OverlaySnapshot,
    Peer, Store,
};
use crate::routeros::{
    comment_of, AuditCall, ManagedResources, ResourcePath, RouterClient, RouterEntry,
    RouterHandle, RouterParams,
};
use crate::secrets::SecretEnvelope;
use crate::COMMENT_PREFIX;
use chrono::Utc;
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

// Milestone table: percent reported on completion of each apply step.
const PROGRESS_ACCEPTED: u8 = 5;
const PROGRESS_CONNECTED: u8 = 10;
const PROGRESS_DESIRED: u8 = 15;
const PROGRESS_BACKUP: u8 = 20;
const PROGRESS_INTERFACE: u8 = 30;
const PROGRESS_PEERS: u8 = 50;
const PROGRESS_ADDRESSES: u8 = 60;
const PROGRESS_ROUTES: u8 = 70;
const PROGRESS_FIREWALL: u8 = 80;
const PROGRESS_NAT: u8 = 90;
const PROGRESS_VERIFIED: u8 = 100;

enum ApplyOutcome {
    Completed,
    Cancelled,
}

/// Orchestrates all router-facing operations for managed peers.
pub struct DeployEngine {
    store: Arc<Store>,
    settings: Arc<Settings>,
    envelope: Arc<SecretEnvelope>,
    connector: Arc<dyn RouterConnector>,
    limiter: Arc<Semaphore>,
}

impl DeployEngine {
    /// Build an engine over the given connector. The semaphore bounds
    /// concurrent router work at `max_concurrent_deployments`.
    pub fn new(
        store: Arc<Store>,
        settings: Arc<Settings>,
        envelope: Arc<SecretEnvelope>,
        connector: Arc<dyn RouterConnector>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(settings.max_concurrent_deployments));
        Self {
            store,
            settings,
            envelope,
            connector,
            limiter,
        }
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    fn require_managed(&self, peer: &Peer) -> Result<()> {
        if peer.is_managed() {
            Ok(())
        } else {
            Err(WirewanError::Validation(
                "Peer is not a MikroTik device".to_string(),
            ))
        }
    }

    fn router_params(&self, peer: &Peer) -> Result<RouterParams> {
        let managed = peer.managed.as_ref().ok_or_else(|| {
            WirewanError::Validation("Peer is not a MikroTik device".to_string())
        })?;
        let password = match managed.password_encrypted.as_deref() {
            Some(enc) => Some(self.envelope.decrypt(enc).map_err(|_| {
                WirewanError::SecretUnreadable(
                    "Cannot decrypt stored password. Please re-enter the router credentials."
                        .to_string(),
                )
            })?),
            None => None,
        };
        let api_token = match managed.api_token_encrypted.as_deref() {
            Some(enc) => Some(self.envelope.decrypt(enc).map_err(|_| {
                WirewanError::SecretUnreadable(
                    "Cannot decrypt stored API token. Please re-enter the router credentials."
                        .to_string(),
                )
            })?),
            None => None,
        };
        Ok(RouterParams {
            host: managed.management_ip.clone().unwrap_or_default(),
            port: managed.api_port,
            username: managed
                .username
                .clone()
                .unwrap_or_else(|| "admin".to_string()),
            password,
            api_token,
            auth_method: managed.auth_method,
            use_ssl: managed.use_ssl,
            verify_cert: managed.verify_cert,
            timeout: Duration::from_secs(self.settings.deployment_timeout_seconds),
        })
    }

    fn handle_for(&self, peer: &Peer) -> Result<RouterHandle> {
        let params = self.router_params(peer)?;
        let timeout = params.timeout;
        let transport = self.connector.connect(params)?;
        let client = Arc::new(RouterClient::new(transport));
        Ok(RouterHandle::new(client, timeout))
    }

    fn desired_for(&self, peer_id: Uuid) -> Result<(OverlaySnapshot, DesiredState, String)> {
        let snapshot = self.store.overlay_snapshot(peer_id)?;
        let private_key = match snapshot.peer.peer.private_key_encrypted.as_deref() {
            Some(enc) => self.envelope.decrypt(enc)?,
            None => String::new(),
        };
        let desired = DesiredState::build(&snapshot, &private_key);
        Ok((snapshot, desired, private_key))
    }

    async fn permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.limiter.clone().acquire_owned().await.map_err(|_| {
            WirewanError::InvalidState("deployment worker pool is shut down".to_string())
        })
    }

    fn drain_audit(&self, handle: &RouterHandle, job_id: Uuid, peer_id: Uuid) {
        let calls = handle.client().take_audit();
        if calls.is_empty() {
            return;
        }
        let records = calls
            .into_iter()
            .map(|call: AuditCall| ApiCallRecord {
                id: Uuid::new_v4(),
                job_id,
                peer_id,
                method: call.method,
                endpoint: call.endpoint,
                request_body: call.request_body,
                response_status: call.response_status,
                response_body: call.response_body,
                error_message: call.error_message,
                timestamp: call.timestamp,
            })
            .collect();
        self.store.add_api_logs(records);
    }

    fn note_router_failure(&self, peer_id: Uuid, err: &WirewanError) {
        let status = match err {
            WirewanError::RouterApi(router_err) if router_err.is_auth_failure() => {
                ApiStatus::AuthFailed
            }
            WirewanError::RouterApi(_) | WirewanError::Timeout(_) => ApiStatus::Unreachable,
            _ => return,
        };
        let _ = self.store.with_peer_mut(peer_id, |peer| {
            peer.is_online = false;
            if let Some(managed) = peer.managed.as_mut() {
                managed.api_status = status;
                managed.last_api_check = Some(Utc::now());
            }
        });
    }

    // ------------------------------------------------------------------
    // Read-only operations
    // ------------------------------------------------------------------

    /// Connectivity probe: connect, read identity and OS version, update
    /// the peer's observed fields.
    pub async fn test_connection(&self, peer_id: Uuid) -> Result<TestConnectionResult> {
        let peer = self.store.get_peer(peer_id)?;
        self.require_managed(&peer)?;
        let handle = self.handle_for(&peer)?;
        let _permit = self.permit().await?;

        let outcome = handle.run(|client| client.test_connection()).await;
        let now = Utc::now();
        match outcome {
            Ok(info) => {
                self.store.with_peer_mut(peer_id, |p| {
                    p.is_online = true;
                    p.last_seen = Some(now);
                    if let Some(managed) = p.managed.as_mut() {
                        managed.api_status = ApiStatus::Connected;
                        managed.router_identity = Some(info.identity.clone());
                        managed.routeros_version = Some(info.version.clone());
                        managed.last_api_check = Some(now);
                    }
                })?;
                Ok(TestConnectionResult {
                    success: true,
                    router_identity: Some(info.identity),
                    routeros_version: Some(info.version),
                    error_message: None,
                })
            }
            Err(err) => {
                self.note_router_failure(peer_id, &err);
                Ok(TestConnectionResult {
                    success: false,
                    router_identity: None,
                    routeros_version: None,
                    error_message: Some(err.to_string()),
                })
            }
        }
    }

    /// Preview the changes an apply would make. Read-only.
    pub async fn plan(&self, peer_id: Uuid) -> Result<DeployPlan> {
        let peer = self.store.get_peer(peer_id)?;
        self.require_managed(&peer)?;
        let (_, desired, _) = self.desired_for(peer_id)?;
        let handle = self.handle_for(&peer)?;
        let _permit = self.permit().await?;

        let current = handle.run(|client| client.get_managed_resources()).await?;

        let comments = |items: &[String]| -> HashSet<String> { items.iter().cloned().collect() };
        let desired_ips: Vec<String> =
            desired.ip_addresses.iter().map(|a| a.comment.clone()).collect();
        let desired_routes: Vec<String> = desired.routes.iter().map(|r| r.comment.clone()).collect();
        let desired_fw: Vec<String> =
            desired.firewall_rules.iter().map(|r| r.comment.clone()).collect();
        let desired_nat: Vec<String> = desired.nat_rules.iter().map(|r| r.comment.clone()).collect();
        let desired_peers: Vec<String> = desired.peers.iter().map(|p| p.comment.clone()).collect();

        Ok(DeployPlan {
            interface: PlanInterface {
                name: desired.interface.name.clone(),
                listen_port: desired.interface.listen_port,
                comment: desired.interface.comment.clone(),
            },
            summary: PlanSummary {
                ips: summarize("ip_addresses", &comments(&desired_ips), &current.ip_addresses),
                routes: summarize("routes", &comments(&desired_routes), &current.routes),
                firewall: summarize(
                    "firewall_rules",
                    &comments(&desired_fw),
                    &current.firewall_rules,
                ),
                nat: summarize("nat_rules", &comments(&desired_nat), &current.nat_rules),
                peers: summarize("peers", &comments(&desired_peers), &current.wireguard_peers),
            },
        })
    }

    /// Read all router resources and report collisions with foreign
    /// configuration plus routing-path ambiguity. Never writes.
    pub async fn preflight(&self, peer_id: Uuid) -> Result<PreflightReport> {
        let peer = self.store.get_peer(peer_id)?;
        self.require_managed(&peer)?;
        let (snapshot, desired, _) = self.desired_for(peer_id)?;
        let handle = self.handle_for(&peer)?;
        let _permit = self.permit().await?;

        let interfaces = handle
            .run(|c| c.list(ResourcePath::WireguardInterface, None))
            .await?;
        let addresses = handle.run(|c| c.list(ResourcePath::IpAddress, None)).await?;
        let routes = handle.run(|c| c.list(ResourcePath::IpRoute, None)).await?;
        let firewall = handle
            .run(|c| c.list(ResourcePath::FirewallFilter, None))
            .await?;
        let nat = handle.run(|c| c.list(ResourcePath::FirewallNat, None)).await?;

        let mut issues = Vec::new();

        // Routing-path ambiguity via the conflict detector: desired route
        // destinations against the router's existing routes.
        let candidates: Vec<IpNetwork> = desired
            .routes
            .iter()
            .filter_map(|r| r.dst_address.parse().ok())
            .collect();
        let existing_routes: Vec<IpNetwork> = routes
            .iter()
            .filter(|r| !comment_of(r).starts_with(COMMENT_PREFIX))
            .filter_map(|r| r.get("dst-address").and_then(|d| d.parse().ok()))
            .collect();
        let wan_views = self.store.peer_subnet_views(peer.wan_id);
        let overlaps = conflict::detect_conflicts(
            IpNetwork::V4(snapshot.wan.tunnel_ip_range),
            IpNetwork::V4(snapshot.wan.shared_services_range),
            &wan_views,
            Some(peer.id),
            &candidates,
            &existing_routes,
        );
        for c in overlaps {
            issues.push(PreflightIssue {
                kind: c.conflict_type.as_str().to_string(),
                description: c.description,
                suggestions: c
                    .suggested_resolutions
                    .iter()
                    .map(|r| r.as_str().to_string())
                    .collect(),
            });
        }

        let interface_name = desired.interface.name.as_str();
        let desired_port = desired.interface.listen_port.to_string();

        // Interface name clash with a foreign interface
        if interfaces.iter().any(|iface| {
            iface.get("name").map(String::as_str) == Some(interface_name)
                && !comment_of(iface).starts_with(COMMENT_PREFIX)
        }) {
            issues.push(PreflightIssue {
                kind: "interface-name".to_string(),
                description: format!(
                    "Interface '{}' already exists and is not managed by this system.",
                    interface_name
                ),
                suggestions: vec![
                    "Remove/rename the interface manually".to_string(),
                    "Change the interface name in peer settings before deploying".to_string(),
                ],
            });
        }

        // Listen-port clash with another interface
        if let Some(iface) = interfaces.iter().find(|iface| {
            iface.get("listen-port") == Some(&desired_port)
                && iface.get("name").map(String::as_str) != Some(interface_name)
        }) {
            issues.push(PreflightIssue {
                kind: "listen-port".to_string(),
                description: format!(
                    "WireGuard listen port {} is already used by '{}'.",
                    desired_port,
                    iface.get("name").map(String::as_str).unwrap_or("?")
                ),
                suggestions: vec![
                    "Change listen port on this peer".to_string(),
                    "Update or remove the conflicting interface on the router".to_string(),
                ],
            });
        }

        // Desired addresses already present under a foreign comment
        let desired_addresses: HashSet<&str> =
            desired.ip_addresses.iter().map(|a| a.address.as_str()).collect();
        for addr in &addresses {
            let address = addr.get("address").map(String::as_str).unwrap_or("");
            if desired_addresses.contains(address) && !comment_of(addr).starts_with(COMMENT_PREFIX)
            {
                issues.push(PreflightIssue {
                    kind: "ip-address".to_string(),
                    description: format!(
                        "IP {} already exists on interface {} (not managed).",
                        address,
                        addr.get("interface").map(String::as_str).unwrap_or("?")
                    ),
                    suggestions: vec![
                        "Remove or change the existing address".to_string(),
                        "Adjust the peer tunnel IP or subnet".to_string(),
                    ],
                });
            }
        }

        // Desired route destinations already present under a foreign comment
        let desired_dsts: HashSet<&str> =
            desired.routes.iter().map(|r| r.dst_address.as_str()).collect();
        for route in &routes {
            let dst = route.get("dst-address").map(String::as_str).unwrap_or("");
            if desired_dsts.contains(dst) && !comment_of(route).starts_with(COMMENT_PREFIX) {
                issues.push(PreflightIssue {
                    kind: "route".to_string(),
                    description: format!("Route {} already exists (not managed).", dst),
                    suggestions: vec![
                        "Remove or adjust the conflicting route".to_string(),
                        "Change the managed route destinations".to_string(),
                    ],
                });
            }
        }

        // Foreign NAT rules with the same (chain, dst-address, dst-port) key
        let desired_nat_keys: HashSet<(String, String, String)> = desired
            .nat_rules
            .iter()
            .map(|r| {
                (
                    r.chain.clone(),
                    r.dst_address.clone(),
                    r.dst_port.clone().unwrap_or_default(),
                )
            })
            .collect();
        for rule in &nat {
            let key = (
                rule.get("chain").cloned().unwrap_or_default(),
                rule.get("dst-address").cloned().unwrap_or_default(),
                rule.get("dst-port").cloned().unwrap_or_default(),
            );
            if desired_nat_keys.contains(&key) && !comment_of(rule).starts_with(COMMENT_PREFIX) {
                issues.push(PreflightIssue {
                    kind: "nat".to_string(),
                    description: format!(
                        "NAT rule for chain {} dst {}:{} already exists (not managed).",
                        key.0, key.1, key.2
                    ),
                    suggestions: vec![
                        "Remove or adjust the existing NAT rule".to_string(),
                        "Change the peer's NAT configuration".to_string(),
                    ],
                });
            }
        }

        // Foreign firewall rules with the same (chain, action, interfaces) key
        let desired_fw_keys: HashSet<(String, String, String, String)> = desired
            .firewall_rules
            .iter()
            .map(|r| {
                (
                    r.chain.clone(),
                    r.action.clone(),
                    r.in_interface.clone().unwrap_or_default(),
                    r.out_interface.clone().unwrap_or_default(),
                )
            })
            .collect();
        for rule in &firewall {
            let key = (
                rule.get("chain").cloned().unwrap_or_default(),
                rule.get("action").cloned().unwrap_or_default(),
                rule.get("in-interface").cloned().unwrap_or_default(),
                rule.get("out-interface").cloned().unwrap_or_default(),
            );
            if desired_fw_keys.contains(&key) && !comment_of(rule).starts_with(COMMENT_PREFIX) {
                issues.push(PreflightIssue {
                    kind: "firewall".to_string(),
                    description: format!(
                        "Firewall rule in chain {} already exists (not managed).",
                        key.0
                    ),
                    suggestions: vec![
                        "Remove/disable the existing rule".to_string(),
                        "Adjust peer firewall settings".to_string(),
                    ],
                });
            }
        }

        Ok(PreflightReport {
            success: issues.is_empty(),
            issues,
        })
    }

    /// Compare desired configuration with what is deployed under managed
    /// comments. Read-only.
    pub async fn verify(&self, peer_id: Uuid) -> Result<VerifyReport> {
        let peer = self.store.get_peer(peer_id)?;
        self.require_managed(&peer)?;
        let (_, desired, _) = self.desired_for(peer_id)?;
        let handle = self.handle_for(&peer)?;
        let _permit = self.permit().await?;

        let current = handle.run(|client| client.get_managed_resources()).await?;
        let issues = diff_desired_current(&desired, &current);
        Ok(VerifyReport {
            in_sync: issues.is_empty(),
            issues,
            current,
        })
    }

    // ------------------------------------------------------------------
    // Write operations
    // ------------------------------------------------------------------

    /// Push the most recent configuration captured at API deployment time
    /// back onto the router through its script-exec surface.
    ///
    /// There is deliberately no fallback to structured CRUD: the stored
    /// text may be non-idempotent, so a missing script surface must fail
    /// clearly.
    pub async fn revert(&self, peer_id: Uuid) -> Result<()> {
        let peer = self.store.get_peer(peer_id)?;
        self.require_managed(&peer)?;
        let history = self
            .store
            .latest_history(peer_id, ConfigType::MikrotikApi)
            .ok_or_else(|| {
                WirewanError::NotFound(
                    "No stored MikroTik configuration to revert to".to_string(),
                )
            })?;
        let handle = self.handle_for(&peer)?;
        let _permit = self.permit().await?;
        let script = history.configuration_text;
        handle.run(move |client| client.run_script(&script)).await
    }

    /// Remove every managed resource from the router. Idempotent: clearing
    /// an already-clean router succeeds.
    pub async fn clear(&self, peer_id: Uuid) -> Result<()> {
        let peer = self.store.get_peer(peer_id)?;
        self.require_managed(&peer)?;
        let handle = self.handle_for(&peer)?;
        let _permit = self.permit().await?;
        handle.run(|client| client.remove_managed_resources()).await
    }

    /// Create an apply job and run it in the background. Returns the job
    /// synchronously; progress is polled through the jobs API. Refuses
    /// while another job for the peer is pending or running.
    pub fn start_apply(
        self: &Arc<Self>,
        peer_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<DeploymentJob> {
        let peer = self.store.get_peer(peer_id)?;
        self.require_managed(&peer)?;
        let job = self
            .store
            .create_job_exclusive(peer_id, JobType::DeployConfig, created_by)?;
        info!(job_id = %job.id, peer = %peer.name, "deployment job accepted");

        let engine = Arc::clone(self);
        let job_id = job.id;
        tokio::spawn(async move {
            engine.execute_apply(job_id, peer_id).await;
        });
        Ok(job)
    }

    async fn execute_apply(self: Arc<Self>, job_id: Uuid, peer_id: Uuid) {
        let permit = match self.permit().await {
            Ok(permit) => permit,
            Err(err) => {
                self.store.job_fail(job_id, &err.to_string(), None);
                return;
            }
        };

        let peer = match self.store.get_peer(peer_id) {
            Ok(peer) => peer,
            Err(err) => {
                self.store.job_fail(job_id, &err.to_string(), None);
                return;
            }
        };
        let handle = match self.handle_for(&peer) {
            Ok(handle) => handle,
            Err(err) => {
                self.store.job_fail(job_id, &err.to_string(), None);
                return;
            }
        };

        let outcome = self.apply_steps(job_id, peer_id, &handle).await;
        self.drain_audit(&handle, job_id, peer_id);
        drop(permit);

        match outcome {
            Ok(ApplyOutcome::Completed) => {
                info!(job_id = %job_id, "deployment completed");
            }
            Ok(ApplyOutcome::Cancelled) => {
                info!(job_id = %job_id, "deployment cancelled; backup preserved");
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "deployment failed");
                let detail = serde_json::json!({ "traceback": format!("{:?}", err) });
                self.store.job_fail(job_id, &err.to_string(), Some(detail));
                self.note_router_failure(peer_id, &err);
            }
        }
    }

    async fn apply_steps(
        &self,
        job_id: Uuid,
        peer_id: Uuid,
        handle: &RouterHandle,
    ) -> Result<ApplyOutcome> {
        // The operator may cancel between creation and pickup.
        if self.store.job_status(job_id)? == JobStatus::Cancelled {
            return Ok(ApplyOutcome::Cancelled);
        }
        self.store.job_transition(job_id, JobStatus::Running)?;
        self.store.job_set_progress(job_id, PROGRESS_ACCEPTED)?;

        // Always verify connectivity before any write.
        let info = handle.run(|client| client.test_connection()).await?;
        self.store.job_set_progress(job_id, PROGRESS_CONNECTED)?;
        if self.check_cancelled(job_id)? {
            return Ok(ApplyOutcome::Cancelled);
        }

        let (snapshot, desired, private_key) = self.desired_for(peer_id)?;
        self.store.job_set_progress(job_id, PROGRESS_DESIRED)?;

        // Backup is captured exactly once, before the first mutation.
        let backup = handle.run(|client| client.get_managed_resources()).await?;
        self.store
            .job_set_backup(job_id, serde_json::to_value(&backup)?)?;
        self.store.job_set_progress(job_id, PROGRESS_BACKUP)?;
        if self.check_cancelled(job_id)? {
            return Ok(ApplyOutcome::Cancelled);
        }

        // Step 1: interface, created or updated in place.
        let interface_name = desired.interface.name.clone();
        let interface_entry = to_entry(&desired.interface);
        {
            let name = interface_name.clone();
            handle
                .run(move |client| {
                    let existing = client.list(ResourcePath::WireguardInterface, None)?;
                    let found = existing
                        .iter()
                        .find(|row| row.get("name").map(String::as_str) == Some(name.as_str()));
                    match found.and_then(|row| row.get(".id").cloned()) {
                        Some(id) => {
                            let mut update = RouterEntry::new();
                            for key in ["listen-port", "private-key", "comment"] {
                                if let Some(value) = interface_entry.get(key) {
                                    update.insert(key.to_string(), value.clone());
                                }
                            }
                            client.update(ResourcePath::WireguardInterface, &id, update)
                        }
                        None => client
                            .add(ResourcePath::WireguardInterface, interface_entry)
                            .map(|_| ()),
                    }
                })
                .await?;
        }
        self.store.job_set_progress(job_id, PROGRESS_INTERFACE)?;
        if self.check_cancelled(job_id)? {
            return Ok(ApplyOutcome::Cancelled);
        }

        // Steps 2-6: replace managed resources, fixed ordering.
        let steps: [(ResourcePath, Vec<RouterEntry>, u8); 5] = [
            (
                ResourcePath::WireguardPeer,
                desired.peers.iter().map(to_entry).collect(),
                PROGRESS_PEERS,
            ),
            (
                ResourcePath::IpAddress,
                desired.ip_addresses.iter().map(to_entry).collect(),
                PROGRESS_ADDRESSES,
            ),
            (
                ResourcePath::IpRoute,
                desired.routes.iter().map(to_entry).collect(),
                PROGRESS_ROUTES,
            ),
            (
                ResourcePath::FirewallFilter,
                desired.firewall_rules.iter().map(to_entry).collect(),
                PROGRESS_FIREWALL,
            ),
            (
                ResourcePath::FirewallNat,
                desired.nat_rules.iter().map(to_entry).collect(),
                PROGRESS_NAT,
            ),
        ];
        for (path, entries, progress) in steps {
            handle
                .run(move |client| {
                    client.delete_managed(path)?;
                    for entry in entries {
                        client.add(path, entry)?;
                    }
                    Ok(())
                })
                .await?;
            self.store.job_set_progress(job_id, progress)?;
            if self.check_cancelled(job_id)? {
                return Ok(ApplyOutcome::Cancelled);
            }
        }

        // Step 7: verification read.
        let running = {
            let name = interface_name.clone();
            handle
                .run(move |client| {
                    let interfaces = client.list(ResourcePath::WireguardInterface, None)?;
                    Ok(interfaces.iter().any(|row| {
                        row.get("name").map(String::as_str) == Some(name.as_str())
                            && row.get("running").map(String::as_str) == Some("true")
                    }))
                })
                .await?
        };
        if !running {
            warn!(job_id = %job_id, interface = %interface_name, "interface not running after apply");
            self.store.job_push_operation(
                job_id,
                serde_json::json!({ "warning": "Interface created but may not be running" }),
            )?;
        }
        self.store.job_set_progress(job_id, PROGRESS_VERIFIED)?;
        self.store.job_transition(job_id, JobStatus::Completed)?;

        // Keep the applied configuration for revert.
        let script = generator::routeros_script(&snapshot, &private_key);
        self.store
            .add_history(peer_id, ConfigType::MikrotikApi, script, true)?;

        let now = Utc::now();
        self.store.with_peer_mut(peer_id, |p| {
            p.is_online = true;
            p.last_seen = Some(now);
            if let Some(managed) = p.managed.as_mut() {
                managed.api_status = ApiStatus::Connected;
                managed.router_identity = Some(info.identity.clone());
                managed.routeros_version = Some(info.version.clone());
                managed.last_api_check = Some(now);
            }
        })?;

        Ok(ApplyOutcome::Completed)
    }

    fn check_cancelled(&self, job_id: Uuid) -> Result<bool> {
        Ok(self.store.job_status(job_id)? == JobStatus::Cancelled)
    }
}

fn summarize(kind: &str, desired: &HashSet<String>, current: &[RouterEntry]) -> FamilyPlan {
    let current_comments: HashSet<&str> = current
        .iter()
        .map(comment_of)
        .filter(|c| !c.is_empty())
        .collect();
    FamilyPlan {
        kind: kind.to_string(),
        to_create: desired
            .iter()
            .filter(|c| !current_comments.contains(c.as_str()))
            .count(),
        to_delete: current_comments
            .iter()
            .filter(|c| !desired.contains(**c))
            .count(),
        managed_current: current_comments.len(),
        managed_desired: desired.len(),
    }
}

fn index_by_comment(entries: &[RouterEntry]) -> std::collections::HashMap<&str, &RouterEntry> {
    entries
        .iter()
        .filter(|e| !comment_of(e).is_empty())
        .map(|e| (comment_of(e), e))
        .collect()
}

fn diff_desired_current(desired: &DesiredState, current: &ManagedResources) -> Vec<String> {
    let mut issues = Vec::new();

    let interface_name = desired.interface.name.as_str();
    match current
        .wireguard_interfaces
        .iter()
        .find(|row| row.get("name").map(String::as_str) == Some(interface_name))
    {
        None => issues.push(format!(
            "Managed interface '{}' is missing.",
            interface_name
        )),
        Some(row) => {
            let want = desired.interface.listen_port.to_string();
            if let Some(have) = row.get("listen-port") {
                if have != &want {
                    issues.push(format!(
                        "Interface '{}' differs on listen-port: desired {}, found {}",
                        interface_name, want, have
                    ));
                }
            }
        }
    }

    let missing_by = |wanted: Vec<&str>, rows: &[RouterEntry], field: &str| -> Vec<String> {
        let present: HashSet<&str> = rows
            .iter()
            .filter_map(|row| row.get(field).map(String::as_str))
            .collect();
        wanted
            .into_iter()
            .filter(|value| !present.contains(value))
            .map(str::to_string)
            .collect()
    };

    let missing_ips = missing_by(
        desired.ip_addresses.iter().map(|a| a.address.as_str()).collect(),
        &current.ip_addresses,
        "address",
    );
    if !missing_ips.is_empty() {
        issues.push(format!("Missing IP addresses: {}", missing_ips.join(", ")));
    }

    let missing_routes = missing_by(
        desired.routes.iter().map(|r| r.dst_address.as_str()).collect(),
        &current.routes,
        "dst-address",
    );
    if !missing_routes.is_empty() {
        issues.push(format!("Missing routes: {}", missing_routes.join(", ")));
    }

    let missing_fw = missing_by(
        desired.firewall_rules.iter().map(|r| r.comment.as_str()).collect(),
        &current.firewall_rules,
        "comment",
    );
    if !missing_fw.is_empty() {
        issues.push(format!("Missing firewall rules: {}", missing_fw.join(", ")));
    }

    let missing_nat = missing_by(
        desired.nat_rules.iter().map(|r| r.comment.as_str()).collect(),
        &current.nat_rules,
        "comment",
    );
    if !missing_nat.is_empty() {
        issues.push(format!("Missing NAT rules: {}", missing_nat.join(", ")));
    }

    let missing_peers = missing_by(
        desired.peers.iter().map(|p| p.comment.as_str()).collect(),
        &current.wireguard_peers,
        "comment",
    );
    if !missing_peers.is_empty() {
        issues.push(format!("Missing peer entries: {}", missing_peers.join(", ")));
    }

    // Field-level drift on matched comments.
    let drift = |label: &str,
                 desired_entries: Vec<RouterEntry>,
                 current_rows: &[RouterEntry],
                 fields: &[&str],
                 issues: &mut Vec<String>| {
        let current_index = index_by_comment(current_rows);
        for entry in &desired_entries {
            let comment = comment_of(entry);
            let Some(row) = current_index.get(comment) else {
                continue;
            };
            for field in fields {
                let want = entry.get(*field);
                let have = row.get(*field);
                if want != have {
                    issues.push(format!(
                        "{} {} differs on {}: desired {}, found {}",
                        label,
                        comment,
                        field,
                        want.map(String::as_str).unwrap_or("(unset)"),
                        have.map(String::as_str).unwrap_or("(unset)"),
                    ));
                }
            }
        }
    };

    drift(
        "Firewall rule",
        desired.firewall_rules.iter().map(to_entry).collect(),
        &current.firewall_rules,
        &["chain", "action", "in-interface", "out-interface"],
        &mut issues,
    );
    drift(
        "NAT rule",
        desired.nat_rules.iter().map(to_entry).collect(),
        &current.nat_rules,
        &[
            "chain",
            "protocol",
            "dst-address",
            "dst-port",
            "action",
            "to-addresses",
            "to-ports",
        ],
        &mut issues,
    );
    drift(
        "Route",
        desired.routes.iter().map(to_entry).collect(),
        &current.routes,
        &["dst-address", "gateway"],
        &mut issues,
    );

    issues
}
