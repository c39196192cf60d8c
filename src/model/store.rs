//! In-memory overlay store
//!
//! The persistence boundary of the system. Tables are plain maps behind one
//! `RwLock`; every mutating method takes the write lock for its whole body,
//! which stands in for a transaction: uniqueness checks, allocation and
//! inserts observe a consistent view. Cascade deletes are explicit here.

use crate::allocation;
use crate::conflict::PeerSubnets;
use crate::error::{Result, WirewanError};
use crate::model::*;
use chrono::Utc;
use ipnetwork::{IpNetwork, Ipv4Network};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Fields for creating a peer. The store allocates the tunnel address.
#[derive(Debug, Clone)]
pub struct NewPeer {
    /// Owning WAN
    pub wan_id: Uuid,
    /// Display name
    pub name: String,
    /// Peer kind
    pub peer_type: PeerType,
    /// Base64 public key
    pub public_key: Option<String>,
    /// Encrypted private key
    pub private_key_encrypted: Option<String>,
    /// Public endpoint
    pub endpoint: Option<String>,
    /// WireGuard listen port
    pub listen_port: Option<u16>,
    /// Keepalive seconds
    pub persistent_keepalive: Option<u16>,
    /// Managed-device settings for router peers
    pub managed: Option<ManagedDevice>,
    /// Subnets created together with the peer
    pub subnets: Vec<NewSubnet>,
}

/// Fields for creating a local subnet.
#[derive(Debug, Clone)]
pub struct NewSubnet {
    /// The advertised CIDR
    pub cidr: IpNetwork,
    /// Route into the overlay
    pub is_routed: bool,
    /// Advertise the NAT translation instead
    pub nat_enabled: bool,
    /// NAT translation target
    pub nat_translated_cidr: Option<IpNetwork>,
    /// Free-form description
    pub description: Option<String>,
}

/// Fields for publishing a service. The store allocates the shared address.
#[derive(Debug, Clone)]
pub struct NewService {
    /// Owning peer
    pub peer_id: Uuid,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Address the service listens on locally
    pub local_ip: IpAddr,
    /// Local port; 0 means any port
    pub local_port: u16,
    /// Exposed port; defaults to the local port
    pub shared_port: Option<u16>,
    /// Transport protocol
    pub protocol: ServiceProtocol,
}

/// Optional field changes for a WAN network.
#[derive(Debug, Clone, Default)]
pub struct WanUpdate {
    /// New name
    pub name: Option<String>,
    /// New description
    pub description: Option<Option<String>>,
    /// New tunnel range
    pub tunnel_ip_range: Option<Ipv4Network>,
    /// New shared-services range
    pub shared_services_range: Option<Ipv4Network>,
    /// New topology
    pub topology_type: Option<TopologyType>,
}

#[derive(Default)]
struct Tables {
    wans: HashMap<Uuid, WanNetwork>,
    peers: HashMap<Uuid, Peer>,
    subnets: HashMap<Uuid, LocalSubnet>,
    services: HashMap<Uuid, PublishedService>,
    jobs: HashMap<Uuid, DeploymentJob>,
    api_logs: Vec<ApiCallRecord>,
    history: Vec<ConfigurationHistory>,
    users: HashMap<Uuid, User>,
}

/// The overlay store.
#[derive(Default)]
pub struct Store {
    inner: RwLock<Tables>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // WAN networks
    // ------------------------------------------------------------------

    /// Create a WAN network. Names are unique.
    pub fn create_wan(
        &self,
        name: &str,
        description: Option<String>,
        tunnel_ip_range: Ipv4Network,
        shared_services_range: Ipv4Network,
        topology_type: TopologyType,
    ) -> Result<WanNetwork> {
        let mut t = self.inner.write();
        if t.wans.values().any(|w| w.name == name) {
            return Err(WirewanError::Conflict(
                "WAN network with this name already exists".to_string(),
            ));
        }
        let now = Utc::now();
        let wan = WanNetwork {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description,
            tunnel_ip_range,
            shared_services_range,
            topology_type,
            created_at: now,
            updated_at: now,
        };
        t.wans.insert(wan.id, wan.clone());
        Ok(wan)
    }

    /// List all WAN networks.
    pub fn list_wans(&self) -> Vec<WanNetwork> {
        let t = self.inner.read();
        let mut wans: Vec<_> = t.wans.values().cloned().collect();
        wans.sort_by_key(|w| w.created_at);
        wans
    }

    /// Fetch one WAN network.
    pub fn get_wan(&self, wan_id: Uuid) -> Result<WanNetwork> {
        self.inner
            .read()
            .wans
            .get(&wan_id)
            .cloned()
            .ok_or_else(|| WirewanError::NotFound("WAN network not found".to_string()))
    }

    /// Update a WAN network's fields.
    pub fn update_wan(&self, wan_id: Uuid, update: WanUpdate) -> Result<WanNetwork> {
        let mut t = self.inner.write();
        if let Some(name) = &update.name {
            if t.wans.values().any(|w| w.id != wan_id && &w.name == name) {
                return Err(WirewanError::Conflict(
                    "WAN network with this name already exists".to_string(),
                ));
            }
        }
        let wan = t
            .wans
            .get_mut(&wan_id)
            .ok_or_else(|| WirewanError::NotFound("WAN network not found".to_string()))?;
        if let Some(name) = update.name {
            wan.name = name;
        }
        if let Some(description) = update.description {
            wan.description = description;
        }
        if let Some(range) = update.tunnel_ip_range {
            wan.tunnel_ip_range = range;
        }
        if let Some(range) = update.shared_services_range {
            wan.shared_services_range = range;
        }
        if let Some(topology) = update.topology_type {
            wan.topology_type = topology;
        }
        wan.updated_at = Utc::now();
        Ok(wan.clone())
    }

    /// Delete a WAN network and everything that hangs off it.
    pub fn delete_wan(&self, wan_id: Uuid) -> Result<()> {
        let mut t = self.inner.write();
        if t.wans.remove(&wan_id).is_none() {
            return Err(WirewanError::NotFound("WAN network not found".to_string()));
        }
        let peer_ids: Vec<Uuid> = t
            .peers
            .values()
            .filter(|p| p.wan_id == wan_id)
            .map(|p| p.id)
            .collect();
        for peer_id in peer_ids {
            remove_peer_cascade(&mut t, peer_id);
        }
        Ok(())
    }

    /// Number of peers in a WAN.
    pub fn wan_peer_count(&self, wan_id: Uuid) -> usize {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| p.wan_id == wan_id)
            .count()
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Create a peer, allocating its tunnel address from the WAN's tunnel
    /// range in the same critical section.
    pub fn create_peer(&self, new: NewPeer) -> Result<Peer> {
        let mut t = self.inner.write();
        let wan = t
            .wans
            .get(&new.wan_id)
            .ok_or_else(|| WirewanError::NotFound("WAN network not found".to_string()))?;
        let tunnel_range = wan.tunnel_ip_range;

        let allocated: HashSet<Ipv4Addr> = t
            .peers
            .values()
            .filter(|p| p.wan_id == new.wan_id)
            .filter_map(|p| p.tunnel_ip)
            .collect();
        let tunnel_ip = allocation::allocate(tunnel_range, &allocated).map_err(|_| {
            WirewanError::PoolExhausted("No available tunnel IPs in the WAN network".to_string())
        })?;

        for subnet in &new.subnets {
            validate_nat_translation(subnet)?;
        }

        let now = Utc::now();
        let peer = Peer {
            id: Uuid::new_v4(),
            wan_id: new.wan_id,
            name: new.name,
            peer_type: new.peer_type,
            public_key: new.public_key,
            private_key_encrypted: new.private_key_encrypted,
            tunnel_ip: Some(tunnel_ip),
            endpoint: new.endpoint,
            listen_port: new.listen_port,
            persistent_keepalive: new.persistent_keepalive,
            is_online: false,
            last_seen: None,
            peer_metadata: PeerMetadata::default(),
            managed: new.managed,
            created_at: now,
            updated_at: now,
        };
        for subnet in new.subnets {
            let row = LocalSubnet {
                id: Uuid::new_v4(),
                peer_id: peer.id,
                cidr: subnet.cidr,
                is_routed: subnet.is_routed,
                nat_enabled: subnet.nat_enabled,
                nat_translated_cidr: subnet.nat_translated_cidr,
                description: subnet.description,
            };
            t.subnets.insert(row.id, row);
        }
        t.peers.insert(peer.id, peer.clone());
        Ok(peer)
    }

    /// Fetch one peer.
    pub fn get_peer(&self, peer_id: Uuid) -> Result<Peer> {
        self.inner
            .read()
            .peers
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| WirewanError::NotFound("Peer not found".to_string()))
    }

    /// List peers in a WAN, optionally filtered by type.
    pub fn list_peers(&self, wan_id: Uuid, peer_type: Option<PeerType>) -> Vec<Peer> {
        let t = self.inner.read();
        let mut peers: Vec<_> = t
            .peers
            .values()
            .filter(|p| p.wan_id == wan_id)
            .filter(|p| peer_type.map_or(true, |ty| p.peer_type == ty))
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.created_at);
        peers
    }

    /// Mutate a peer in place. The closure must not touch identity fields
    /// (`id`, `wan_id`, `tunnel_ip`); updates bump `updated_at`.
    pub fn with_peer_mut<R>(&self, peer_id: Uuid, f: impl FnOnce(&mut Peer) -> R) -> Result<R> {
        let mut t = self.inner.write();
        let peer = t
            .peers
            .get_mut(&peer_id)
            .ok_or_else(|| WirewanError::NotFound("Peer not found".to_string()))?;
        let out = f(peer);
        peer.updated_at = Utc::now();
        Ok(out)
    }

    /// Delete a peer and its subnets, services, history and jobs.
    pub fn delete_peer(&self, peer_id: Uuid) -> Result<()> {
        let mut t = self.inner.write();
        if !t.peers.contains_key(&peer_id) {
            return Err(WirewanError::NotFound("Peer not found".to_string()));
        }
        remove_peer_cascade(&mut t, peer_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subnets
    // ------------------------------------------------------------------

    /// Add a local subnet to a peer.
    pub fn add_subnet(&self, peer_id: Uuid, new: NewSubnet) -> Result<LocalSubnet> {
        validate_nat_translation(&new)?;
        let mut t = self.inner.write();
        if !t.peers.contains_key(&peer_id) {
            return Err(WirewanError::NotFound("Peer not found".to_string()));
        }
        let row = LocalSubnet {
            id: Uuid::new_v4(),
            peer_id,
            cidr: new.cidr,
            is_routed: new.is_routed,
            nat_enabled: new.nat_enabled,
            nat_translated_cidr: new.nat_translated_cidr,
            description: new.description,
        };
        t.subnets.insert(row.id, row.clone());
        Ok(row)
    }

    /// Subnets advertised by one peer.
    pub fn subnets_for_peer(&self, peer_id: Uuid) -> Vec<LocalSubnet> {
        self.inner
            .read()
            .subnets
            .values()
            .filter(|s| s.peer_id == peer_id)
            .cloned()
            .collect()
    }

    /// Delete one subnet from a peer.
    pub fn delete_subnet(&self, peer_id: Uuid, subnet_id: Uuid) -> Result<()> {
        let mut t = self.inner.write();
        match t.subnets.get(&subnet_id) {
            Some(s) if s.peer_id == peer_id => {
                t.subnets.remove(&subnet_id);
                Ok(())
            }
            _ => Err(WirewanError::NotFound("Subnet not found".to_string())),
        }
    }

    /// Advertised subnets per peer in a WAN, for conflict detection.
    pub fn peer_subnet_views(&self, wan_id: Uuid) -> Vec<PeerSubnets> {
        let t = self.inner.read();
        t.peers
            .values()
            .filter(|p| p.wan_id == wan_id)
            .map(|p| PeerSubnets {
                peer_id: Some(p.id),
                peer_name: p.name.clone(),
                subnets: t
                    .subnets
                    .values()
                    .filter(|s| s.peer_id == p.id)
                    .map(|s| s.cidr)
                    .collect(),
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Published services
    // ------------------------------------------------------------------

    /// Publish a service, allocating its shared address from the WAN's
    /// shared-services range in the same critical section.
    pub fn create_service(&self, new: NewService) -> Result<PublishedService> {
        let mut t = self.inner.write();
        let peer = t
            .peers
            .get(&new.peer_id)
            .ok_or_else(|| WirewanError::NotFound("Peer not found".to_string()))?;
        let wan_id = peer.wan_id;
        let shared_range = t
            .wans
            .get(&wan_id)
            .ok_or_else(|| WirewanError::NotFound("WAN network not found".to_string()))?
            .shared_services_range;

        let allocated = allocated_service_ips(&t, wan_id);
        let shared_ip = allocation::allocate(shared_range, &allocated).map_err(|_| {
            WirewanError::PoolExhausted("No available IPs in shared services range".to_string())
        })?;

        let service = PublishedService {
            id: Uuid::new_v4(),
            peer_id: new.peer_id,
            name: new.name,
            description: new.description,
            local_ip: new.local_ip,
            local_port: new.local_port,
            shared_ip,
            shared_port: new.shared_port.unwrap_or(new.local_port),
            protocol: new.protocol,
            is_active: true,
            created_at: Utc::now(),
        };
        t.services.insert(service.id, service.clone());
        Ok(service)
    }

    /// Fetch one service.
    pub fn get_service(&self, service_id: Uuid) -> Result<PublishedService> {
        self.inner
            .read()
            .services
            .get(&service_id)
            .cloned()
            .ok_or_else(|| WirewanError::NotFound("Service not found".to_string()))
    }

    /// Services published in a WAN, optionally restricted to one peer.
    pub fn list_services(&self, wan_id: Uuid, peer_id: Option<Uuid>) -> Vec<PublishedService> {
        let t = self.inner.read();
        let wan_peers: HashSet<Uuid> = t
            .peers
            .values()
            .filter(|p| p.wan_id == wan_id)
            .map(|p| p.id)
            .collect();
        let mut services: Vec<_> = t
            .services
            .values()
            .filter(|s| wan_peers.contains(&s.peer_id))
            .filter(|s| peer_id.map_or(true, |id| s.peer_id == id))
            .cloned()
            .collect();
        services.sort_by_key(|s| s.created_at);
        services
    }

    /// Mutate a service in place.
    pub fn with_service_mut<R>(
        &self,
        service_id: Uuid,
        f: impl FnOnce(&mut PublishedService) -> R,
    ) -> Result<R> {
        let mut t = self.inner.write();
        let service = t
            .services
            .get_mut(&service_id)
            .ok_or_else(|| WirewanError::NotFound("Service not found".to_string()))?;
        Ok(f(service))
    }

    /// Delete a service.
    pub fn delete_service(&self, service_id: Uuid) -> Result<()> {
        let mut t = self.inner.write();
        t.services
            .remove(&service_id)
            .map(|_| ())
            .ok_or_else(|| WirewanError::NotFound("Service not found".to_string()))
    }

    /// Tunnel addresses currently allocated in a WAN.
    pub fn allocated_tunnel_ips(&self, wan_id: Uuid) -> HashSet<Ipv4Addr> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| p.wan_id == wan_id)
            .filter_map(|p| p.tunnel_ip)
            .collect()
    }

    /// Shared-service addresses currently allocated in a WAN.
    pub fn allocated_service_ips(&self, wan_id: Uuid) -> HashSet<Ipv4Addr> {
        allocated_service_ips(&self.inner.read(), wan_id)
    }

    // ------------------------------------------------------------------
    // Deployment jobs
    // ------------------------------------------------------------------

    /// Create a job for a peer, refusing while another job for the same
    /// peer is pending or running. This check-and-insert runs under one
    /// write lock, which is what makes per-peer exclusion race-free.
    pub fn create_job_exclusive(
        &self,
        peer_id: Uuid,
        job_type: JobType,
        created_by: Option<Uuid>,
    ) -> Result<DeploymentJob> {
        let mut t = self.inner.write();
        if !t.peers.contains_key(&peer_id) {
            return Err(WirewanError::NotFound("Peer not found".to_string()));
        }
        if t.jobs
            .values()
            .any(|j| j.peer_id == peer_id && j.status.is_active())
        {
            return Err(WirewanError::Conflict(
                "A deployment job is already pending or running for this peer".to_string(),
            ));
        }
        let job = DeploymentJob {
            id: Uuid::new_v4(),
            peer_id,
            job_type,
            status: JobStatus::Pending,
            progress_percent: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            operations_log: Vec::new(),
            backup_config: None,
            created_at: Utc::now(),
            created_by,
        };
        t.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    /// Fetch one job.
    pub fn get_job(&self, job_id: Uuid) -> Result<DeploymentJob> {
        self.inner
            .read()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| WirewanError::NotFound("Deployment job not found".to_string()))
    }

    /// Current status of a job; workers poll this at milestone boundaries.
    pub fn job_status(&self, job_id: Uuid) -> Result<JobStatus> {
        Ok(self.get_job(job_id)?.status)
    }

    /// List jobs, newest first, with optional status and peer filters.
    pub fn list_jobs(
        &self,
        status_filter: Option<JobStatus>,
        peer_id: Option<Uuid>,
    ) -> Vec<DeploymentJob> {
        let t = self.inner.read();
        let mut jobs: Vec<_> = t
            .jobs
            .values()
            .filter(|j| status_filter.map_or(true, |s| j.status == s))
            .filter(|j| peer_id.map_or(true, |id| j.peer_id == id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Transition a job's status. The partial order
    /// pending < running < {completed, failed, cancelled} is enforced;
    /// a terminal job never changes state again.
    pub fn job_transition(&self, job_id: Uuid, new_status: JobStatus) -> Result<()> {
        let mut t = self.inner.write();
        let job = t
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| WirewanError::NotFound("Deployment job not found".to_string()))?;
        if job.status == new_status {
            return Ok(());
        }
        if new_status.rank() <= job.status.rank() {
            return Err(WirewanError::InvalidState(format!(
                "Cannot move job from {} to {}",
                job.status, new_status
            )));
        }
        job.status = new_status;
        match new_status {
            JobStatus::Running => job.started_at = Some(Utc::now()),
            s if s.is_terminal() => job.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Raise a job's progress. Progress never decreases.
    pub fn job_set_progress(&self, job_id: Uuid, percent: u8) -> Result<()> {
        let mut t = self.inner.write();
        let job = t
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| WirewanError::NotFound("Deployment job not found".to_string()))?;
        job.progress_percent = job.progress_percent.max(percent.min(100));
        Ok(())
    }

    /// Capture the pre-apply backup. A second capture is an error: backups
    /// are taken exactly once, before the first write.
    pub fn job_set_backup(&self, job_id: Uuid, backup: serde_json::Value) -> Result<()> {
        let mut t = self.inner.write();
        let job = t
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| WirewanError::NotFound("Deployment job not found".to_string()))?;
        if job.backup_config.is_some() {
            return Err(WirewanError::InvalidState(
                "Backup already captured for this job".to_string(),
            ));
        }
        job.backup_config = Some(backup);
        Ok(())
    }

    /// Append a note to the job's operations log.
    pub fn job_push_operation(&self, job_id: Uuid, entry: serde_json::Value) -> Result<()> {
        let mut t = self.inner.write();
        let job = t
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| WirewanError::NotFound("Deployment job not found".to_string()))?;
        job.operations_log.push(entry);
        Ok(())
    }

    /// Record a job failure: message, optional detail entry, terminal state.
    pub fn job_fail(&self, job_id: Uuid, message: &str, detail: Option<serde_json::Value>) {
        let mut t = self.inner.write();
        if let Some(job) = t.jobs.get_mut(&job_id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = JobStatus::Failed;
            job.error_message = Some(message.to_string());
            if let Some(entry) = detail {
                job.operations_log.push(entry);
            }
            job.completed_at = Some(Utc::now());
        }
    }

    /// Cancel a pending or running job.
    pub fn cancel_job(&self, job_id: Uuid) -> Result<DeploymentJob> {
        let mut t = self.inner.write();
        let job = t
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| WirewanError::NotFound("Deployment job not found".to_string()))?;
        if !job.status.is_active() {
            return Err(WirewanError::InvalidState(format!(
                "Cannot cancel job with status: {}",
                job.status
            )));
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        Ok(job.clone())
    }

    /// Delete a terminal job and its API call logs.
    pub fn delete_job(&self, job_id: Uuid) -> Result<()> {
        let mut t = self.inner.write();
        match t.jobs.get(&job_id) {
            None => Err(WirewanError::NotFound(
                "Deployment job not found".to_string(),
            )),
            Some(job) if job.status.is_active() => Err(WirewanError::InvalidState(
                "Cannot delete a pending or running job. Cancel it first.".to_string(),
            )),
            Some(_) => {
                t.jobs.remove(&job_id);
                t.api_logs.retain(|l| l.job_id != job_id);
                Ok(())
            }
        }
    }

    /// Append audited router API calls to a job.
    pub fn add_api_logs(&self, records: Vec<ApiCallRecord>) {
        let mut t = self.inner.write();
        t.api_logs.extend(records);
    }

    /// Audited calls for a job, in call order.
    pub fn api_logs_for_job(&self, job_id: Uuid) -> Vec<ApiCallRecord> {
        let mut logs: Vec<_> = self
            .inner
            .read()
            .api_logs
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.timestamp);
        logs
    }

    // ------------------------------------------------------------------
    // Configuration history
    // ------------------------------------------------------------------

    /// Record a generated configuration.
    pub fn add_history(
        &self,
        peer_id: Uuid,
        config_type: ConfigType,
        text: String,
        applied: bool,
    ) -> Result<ConfigurationHistory> {
        let mut t = self.inner.write();
        if !t.peers.contains_key(&peer_id) {
            return Err(WirewanError::NotFound("Peer not found".to_string()));
        }
        let now = Utc::now();
        let row = ConfigurationHistory {
            id: Uuid::new_v4(),
            peer_id,
            configuration_text: text,
            config_type,
            generated_at: now,
            applied_at: applied.then_some(now),
        };
        t.history.push(row.clone());
        Ok(row)
    }

    /// Most recent history entry of a given type for a peer.
    pub fn latest_history(
        &self,
        peer_id: Uuid,
        config_type: ConfigType,
    ) -> Option<ConfigurationHistory> {
        self.inner
            .read()
            .history
            .iter()
            .filter(|h| h.peer_id == peer_id && h.config_type == config_type)
            .max_by_key(|h| h.generated_at)
            .cloned()
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Register a user. The first user becomes an administrator regardless
    /// of the requested role.
    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: String,
        requested_role: UserRole,
    ) -> Result<User> {
        let mut t = self.inner.write();
        if t.users
            .values()
            .any(|u| u.username == username || u.email == email)
        {
            return Err(WirewanError::Conflict(
                "Username or email already registered".to_string(),
            ));
        }
        let role = if t.users.is_empty() {
            UserRole::Admin
        } else {
            requested_role
        };
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            role,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    /// Look a user up by login name.
    pub fn find_user_by_username(&self, username: &str) -> Option<User> {
        self.inner
            .read()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    /// Fetch one user.
    pub fn get_user(&self, user_id: Uuid) -> Result<User> {
        self.inner
            .read()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| WirewanError::NotFound("User not found".to_string()))
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Assemble the read-only snapshot the config generator consumes.
    pub fn overlay_snapshot(&self, peer_id: Uuid) -> Result<OverlaySnapshot> {
        let t = self.inner.read();
        let peer = t
            .peers
            .get(&peer_id)
            .cloned()
            .ok_or_else(|| WirewanError::NotFound("Peer not found".to_string()))?;
        let wan = t
            .wans
            .get(&peer.wan_id)
            .cloned()
            .ok_or_else(|| WirewanError::NotFound("WAN network not found".to_string()))?;

        let view = |p: &Peer| PeerView {
            peer: p.clone(),
            subnets: t
                .subnets
                .values()
                .filter(|s| s.peer_id == p.id)
                .cloned()
                .collect(),
            services: t
                .services
                .values()
                .filter(|s| s.peer_id == p.id)
                .cloned()
                .collect(),
        };

        let mut others: Vec<PeerView> = t
            .peers
            .values()
            .filter(|p| p.wan_id == peer.wan_id && p.id != peer.id)
            .map(view)
            .collect();
        others.sort_by_key(|v| v.peer.created_at);

        Ok(OverlaySnapshot {
            wan,
            peer: view(&peer),
            others,
        })
    }

    /// Counters for the metrics endpoint.
    pub fn metrics_counts(&self) -> (usize, usize, usize, HashMap<JobStatus, usize>) {
        let t = self.inner.read();
        let peers_total = t.peers.len();
        let peers_online = t.peers.values().filter(|p| p.is_online).count();
        let services_total = t.services.len();
        let mut jobs: HashMap<JobStatus, usize> = HashMap::new();
        for status in JobStatus::all() {
            jobs.insert(status, 0);
        }
        for job in t.jobs.values() {
            *jobs.entry(job.status).or_insert(0) += 1;
        }
        (peers_total, peers_online, services_total, jobs)
    }
}

fn allocated_service_ips(t: &Tables, wan_id: Uuid) -> HashSet<Ipv4Addr> {
    let wan_peers: HashSet<Uuid> = t
        .peers
        .values()
        .filter(|p| p.wan_id == wan_id)
        .map(|p| p.id)
        .collect();
    t.services
        .values()
        .filter(|s| wan_peers.contains(&s.peer_id))
        .map(|s| s.shared_ip)
        .collect()
}

fn remove_peer_cascade(t: &mut Tables, peer_id: Uuid) {
    t.peers.remove(&peer_id);
    t.subnets.retain(|_, s| s.peer_id != peer_id);
    t.services.retain(|_, s| s.peer_id != peer_id);
    t.history.retain(|h| h.peer_id != peer_id);
    let job_ids: HashSet<Uuid> = t
        .jobs
        .values()
        .filter(|j| j.peer_id == peer_id)
        .map(|j| j.id)
        .collect();
    t.jobs.retain(|_, j| j.peer_id != peer_id);
    t.api_logs
        .retain(|l| l.peer_id != peer_id && !job_ids.contains(&l.job_id));
}

fn validate_nat_translation(subnet: &NewSubnet) -> Result<()> {
    if !subnet.nat_enabled {
        return Ok(());
    }
    match subnet.nat_translated_cidr {
        None => Err(WirewanError::Validation(
            "nat_translated_cidr is required when NAT is enabled".to_string(),
        )),
        Some(translated) if translated.prefix() != subnet.cidr.prefix() => {
            Err(WirewanError::Validation(format!(
                "NAT translation {} must have the same prefix length as {}",
                translated, subnet.cidr
            )))
        }
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_wan() -> (Store, WanNetwork) {
        let store = Store::new();
        let wan = store
            .create_wan(
                "test-wan",
                None,
                "10.0.0.0/29".parse().unwrap(),
                "10.0.5.0/29".parse().unwrap(),
                TopologyType::Mesh,
            )
            .unwrap();
        (store, wan)
    }

    fn new_peer(wan_id: Uuid, name: &str) -> NewPeer {
        NewPeer {
            wan_id,
            name: name.to_string(),
            peer_type: PeerType::Server,
            public_key: Some("pk".to_string()),
            private_key_encrypted: None,
            endpoint: None,
            listen_port: None,
            persistent_keepalive: None,
            managed: None,
            subnets: Vec::new(),
        }
    }

    #[test]
    fn test_wan_name_unique() {
        let (store, _) = store_with_wan();
        let err = store.create_wan(
            "test-wan",
            None,
            "10.1.0.0/24".parse().unwrap(),
            "10.1.5.0/24".parse().unwrap(),
            TopologyType::Mesh,
        );
        assert!(matches!(err, Err(WirewanError::Conflict(_))));
    }

    #[test]
    fn test_tunnel_allocation_sequence_and_exhaustion() {
        let (store, wan) = store_with_wan();
        for (i, name) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            let peer = store.create_peer(new_peer(wan.id, name)).unwrap();
            assert_eq!(
                peer.tunnel_ip.unwrap(),
                Ipv4Addr::new(10, 0, 0, (i + 1) as u8)
            );
        }
        assert!(matches!(
            store.create_peer(new_peer(wan.id, "g")),
            Err(WirewanError::PoolExhausted(_))
        ));
    }

    #[test]
    fn test_no_duplicate_tunnel_ips() {
        let (store, wan) = store_with_wan();
        for name in ["a", "b", "c"] {
            store.create_peer(new_peer(wan.id, name)).unwrap();
        }
        let ips = store.allocated_tunnel_ips(wan.id);
        assert_eq!(ips.len(), 3);
        for ip in &ips {
            assert!(wan.tunnel_ip_range.contains(*ip));
        }
    }

    #[test]
    fn test_service_allocation_unique_in_wan() {
        let (store, wan) = store_with_wan();
        let peer_a = store.create_peer(new_peer(wan.id, "a")).unwrap();
        let peer_b = store.create_peer(new_peer(wan.id, "b")).unwrap();

        let svc = |peer_id, name: &str| NewService {
            peer_id,
            name: name.to_string(),
            description: None,
            local_ip: "192.168.1.10".parse().unwrap(),
            local_port: 80,
            shared_port: None,
            protocol: ServiceProtocol::Tcp,
        };

        let s1 = store.create_service(svc(peer_a.id, "one")).unwrap();
        let s2 = store.create_service(svc(peer_b.id, "two")).unwrap();
        assert_ne!(s1.shared_ip, s2.shared_ip);
        assert!(wan.shared_services_range.contains(s1.shared_ip));
        assert_eq!(s1.shared_port, 80);
    }

    #[test]
    fn test_nat_translation_invariant() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();

        let bad = NewSubnet {
            cidr: "192.168.1.0/24".parse().unwrap(),
            is_routed: true,
            nat_enabled: true,
            nat_translated_cidr: Some("172.16.0.0/16".parse().unwrap()),
            description: None,
        };
        assert!(matches!(
            store.add_subnet(peer.id, bad),
            Err(WirewanError::Validation(_))
        ));

        let good = NewSubnet {
            cidr: "192.168.1.0/24".parse().unwrap(),
            is_routed: true,
            nat_enabled: true,
            nat_translated_cidr: Some("172.16.0.0/24".parse().unwrap()),
            description: None,
        };
        assert!(store.add_subnet(peer.id, good).is_ok());
    }

    #[test]
    fn test_peer_cascade_delete() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();
        store
            .add_subnet(
                peer.id,
                NewSubnet {
                    cidr: "192.168.1.0/24".parse().unwrap(),
                    is_routed: true,
                    nat_enabled: false,
                    nat_translated_cidr: None,
                    description: None,
                },
            )
            .unwrap();
        store
            .create_service(NewService {
                peer_id: peer.id,
                name: "svc".to_string(),
                description: None,
                local_ip: "192.168.1.10".parse().unwrap(),
                local_port: 80,
                shared_port: None,
                protocol: ServiceProtocol::Tcp,
            })
            .unwrap();
        let job = store
            .create_job_exclusive(peer.id, JobType::DeployConfig, None)
            .unwrap();

        store.delete_peer(peer.id).unwrap();
        assert!(store.get_peer(peer.id).is_err());
        assert!(store.subnets_for_peer(peer.id).is_empty());
        assert!(store.list_services(wan.id, None).is_empty());
        assert!(store.get_job(job.id).is_err());
    }

    #[test]
    fn test_wan_cascade_delete() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();
        store.delete_wan(wan.id).unwrap();
        assert!(store.get_wan(wan.id).is_err());
        assert!(store.get_peer(peer.id).is_err());
    }

    #[test]
    fn test_job_exclusion_per_peer() {
        let (store, wan) = store_with_wan();
        let peer_a = store.create_peer(new_peer(wan.id, "a")).unwrap();
        let peer_b = store.create_peer(new_peer(wan.id, "b")).unwrap();

        let job = store
            .create_job_exclusive(peer_a.id, JobType::DeployConfig, None)
            .unwrap();
        // Second job for the same peer is rejected while the first is active
        assert!(matches!(
            store.create_job_exclusive(peer_a.id, JobType::DeployConfig, None),
            Err(WirewanError::Conflict(_))
        ));
        // Other peers are unaffected
        assert!(store
            .create_job_exclusive(peer_b.id, JobType::DeployConfig, None)
            .is_ok());

        // Once terminal, a new job may start
        store.job_transition(job.id, JobStatus::Running).unwrap();
        store.job_transition(job.id, JobStatus::Completed).unwrap();
        assert!(store
            .create_job_exclusive(peer_a.id, JobType::DeployConfig, None)
            .is_ok());
    }

    #[test]
    fn test_job_status_monotonic() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();
        let job = store
            .create_job_exclusive(peer.id, JobType::DeployConfig, None)
            .unwrap();

        store.job_transition(job.id, JobStatus::Running).unwrap();
        store.job_transition(job.id, JobStatus::Completed).unwrap();
        // Terminal jobs never move again
        assert!(store.job_transition(job.id, JobStatus::Running).is_err());
        assert!(store.job_transition(job.id, JobStatus::Failed).is_err());

        let job = store.get_job(job.id).unwrap();
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_job_progress_never_decreases() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();
        let job = store
            .create_job_exclusive(peer.id, JobType::DeployConfig, None)
            .unwrap();

        store.job_set_progress(job.id, 50).unwrap();
        store.job_set_progress(job.id, 20).unwrap();
        assert_eq!(store.get_job(job.id).unwrap().progress_percent, 50);
    }

    #[test]
    fn test_backup_captured_exactly_once() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();
        let job = store
            .create_job_exclusive(peer.id, JobType::DeployConfig, None)
            .unwrap();

        store
            .job_set_backup(job.id, serde_json::json!({"routes": []}))
            .unwrap();
        assert!(store
            .job_set_backup(job.id, serde_json::json!({}))
            .is_err());
    }

    #[test]
    fn test_delete_active_job_forbidden() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();
        let job = store
            .create_job_exclusive(peer.id, JobType::DeployConfig, None)
            .unwrap();

        assert!(store.delete_job(job.id).is_err());
        store.cancel_job(job.id).unwrap();
        assert!(store.delete_job(job.id).is_ok());
    }

    #[test]
    fn test_cancel_only_active_jobs() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();
        let job = store
            .create_job_exclusive(peer.id, JobType::DeployConfig, None)
            .unwrap();
        store.job_transition(job.id, JobStatus::Running).unwrap();
        store.job_transition(job.id, JobStatus::Failed).unwrap();
        assert!(store.cancel_job(job.id).is_err());
    }

    #[test]
    fn test_first_user_is_admin() {
        let store = Store::new();
        let first = store
            .create_user("alice", "alice@example.com", "hash".to_string(), UserRole::Viewer)
            .unwrap();
        assert_eq!(first.role, UserRole::Admin);

        let second = store
            .create_user("bob", "bob@example.com", "hash".to_string(), UserRole::Viewer)
            .unwrap();
        assert_eq!(second.role, UserRole::Viewer);

        assert!(store
            .create_user("alice", "other@example.com", "hash".to_string(), UserRole::Viewer)
            .is_err());
    }

    #[test]
    fn test_overlay_snapshot_excludes_target_from_others() {
        let (store, wan) = store_with_wan();
        let a = store.create_peer(new_peer(wan.id, "a")).unwrap();
        store.create_peer(new_peer(wan.id, "b")).unwrap();

        let snapshot = store.overlay_snapshot(a.id).unwrap();
        assert_eq!(snapshot.peer.peer.id, a.id);
        assert_eq!(snapshot.others.len(), 1);
        assert_eq!(snapshot.wan.id, wan.id);
    }

    #[test]
    fn test_latest_history_by_type() {
        let (store, wan) = store_with_wan();
        let peer = store.create_peer(new_peer(wan.id, "a")).unwrap();
        store
            .add_history(peer.id, ConfigType::MikrotikApi, "old".to_string(), true)
            .unwrap();
        store
            .add_history(peer.id, ConfigType::Wireguard, "wg".to_string(), false)
            .unwrap();
        store
            .add_history(peer.id, ConfigType::MikrotikApi, "new".to_string(), true)
            .unwrap();

        let latest = store
            .latest_history(peer.id, ConfigType::MikrotikApi)
            .unwrap();
        assert_eq!(latest.configuration_text, "new");
    }
}
