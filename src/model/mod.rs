//! Overlay model entities
//!
//! The control plane owns every entity here. Relationships are expressed as
//! foreign-key ids and traversed through explicit store queries; cascade
//! deletion is handled by the store.

pub mod store;

pub use store::Store;

use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Overlay topology shape of a WAN network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyType {
    /// All traffic hairpins through a designated hub peer
    HubSpoke,
    /// Every peer talks to every peer
    Mesh,
    /// Mixed hub and direct links
    Hybrid,
}

/// A named overlay network with its address pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanNetwork {
    /// Entity id
    pub id: Uuid,
    /// Unique display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// CIDR carrying per-peer tunnel addresses
    pub tunnel_ip_range: Ipv4Network,
    /// CIDR carrying published-service addresses
    pub shared_services_range: Ipv4Network,
    /// Topology shape
    pub topology_type: TopologyType,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// What kind of endpoint a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerType {
    /// Managed MikroTik router, driven over its API
    Mikrotik,
    /// Router the operator configures by hand
    GenericRouter,
    /// Plain server
    Server,
    /// Client device
    Client,
    /// Hub peer in hub-spoke topologies
    Hub,
}

/// How the system authenticates to a managed router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Username + password
    Password,
    /// API token
    Token,
}

/// Last observed state of a managed router's API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiStatus {
    /// Never contacted
    Unknown,
    /// Last contact succeeded
    Connected,
    /// Credentials rejected
    AuthFailed,
    /// Could not reach the API
    Unreachable,
}

/// Connection and deployment settings for a managed router, plus the
/// fields observed from the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedDevice {
    /// Management address the API is reached at
    pub management_ip: Option<String>,
    /// API port
    pub api_port: u16,
    /// Credential style
    pub auth_method: AuthMethod,
    /// API username
    pub username: Option<String>,
    /// Encrypted password (secret envelope ciphertext)
    #[serde(default, skip_serializing)]
    pub password_encrypted: Option<String>,
    /// Encrypted API token (secret envelope ciphertext)
    #[serde(default, skip_serializing)]
    pub api_token_encrypted: Option<String>,
    /// Use TLS towards the API
    pub use_ssl: bool,
    /// Verify the router's certificate
    pub verify_cert: bool,
    /// Re-deploy automatically when services change
    pub auto_deploy: bool,
    /// WireGuard interface name on the router
    pub interface_name: Option<String>,
    /// Observed API reachability
    pub api_status: ApiStatus,
    /// Observed router identity string
    pub router_identity: Option<String>,
    /// Observed RouterOS version
    pub routeros_version: Option<String>,
    /// When the API was last checked
    pub last_api_check: Option<DateTime<Utc>>,
}

impl Default for ManagedDevice {
    fn default() -> Self {
        Self {
            management_ip: None,
            api_port: 8728,
            auth_method: AuthMethod::Password,
            username: None,
            password_encrypted: None,
            api_token_encrypted: None,
            use_ssl: true,
            verify_cert: false,
            auto_deploy: false,
            interface_name: None,
            api_status: ApiStatus::Unknown,
            router_identity: None,
            routeros_version: None,
            last_api_check: None,
        }
    }
}

/// Per-peer flag bag. Unknown keys round-trip untouched through `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// Set when the peer's generated config is stale; cleared on fetch
    #[serde(default)]
    pub needs_config_refresh: bool,
    /// Route all traffic (0.0.0.0/0) through peers with endpoints
    #[serde(default)]
    pub route_all_traffic: bool,
    /// Keys this version does not interpret, preserved on write
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One endpoint in the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Entity id
    pub id: Uuid,
    /// Owning WAN
    pub wan_id: Uuid,
    /// Display name
    pub name: String,
    /// Peer kind
    #[serde(rename = "type")]
    pub peer_type: PeerType,
    /// Base64 WireGuard public key
    pub public_key: Option<String>,
    /// Encrypted WireGuard private key (secret envelope ciphertext)
    #[serde(default, skip_serializing)]
    pub private_key_encrypted: Option<String>,
    /// Tunnel address inside the WAN's tunnel range
    pub tunnel_ip: Option<Ipv4Addr>,
    /// Public endpoint, `host:port` or `[v6]:port`
    pub endpoint: Option<String>,
    /// WireGuard listen port
    pub listen_port: Option<u16>,
    /// PersistentKeepalive seconds
    pub persistent_keepalive: Option<u16>,
    /// Last-known liveness
    pub is_online: bool,
    /// When the peer was last seen
    pub last_seen: Option<DateTime<Utc>>,
    /// Flag bag
    #[serde(default)]
    pub peer_metadata: PeerMetadata,
    /// Managed-device settings; present only for managed router peers
    pub managed: Option<ManagedDevice>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Peer {
    /// Whether this peer is a managed router the engine may deploy to.
    pub fn is_managed(&self) -> bool {
        self.peer_type == PeerType::Mikrotik && self.managed.is_some()
    }
}

/// A subnet a peer advertises into the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSubnet {
    /// Entity id
    pub id: Uuid,
    /// Owning peer
    pub peer_id: Uuid,
    /// The advertised CIDR
    pub cidr: IpNetwork,
    /// Whether remote peers should route to this subnet
    pub is_routed: bool,
    /// Advertise the NAT translation instead of the raw CIDR
    pub nat_enabled: bool,
    /// NAT translation, same prefix length as `cidr`
    pub nat_translated_cidr: Option<IpNetwork>,
    /// Free-form description
    pub description: Option<String>,
}

impl LocalSubnet {
    /// The CIDR other peers should route to reach this subnet.
    pub fn advertised_cidr(&self) -> IpNetwork {
        if self.nat_enabled {
            self.nat_translated_cidr.unwrap_or(self.cidr)
        } else {
            self.cidr
        }
    }
}

/// Transport protocol of a published service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProtocol {
    /// TCP only
    Tcp,
    /// UDP only
    Udp,
    /// TCP and UDP
    Both,
}

impl ServiceProtocol {
    /// Protocol names to expand NAT rules over.
    pub fn expand(&self) -> &'static [&'static str] {
        match self {
            ServiceProtocol::Tcp => &["tcp"],
            ServiceProtocol::Udp => &["udp"],
            ServiceProtocol::Both => &["tcp", "udp"],
        }
    }
}

/// A service published into the WAN's shared-services range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedService {
    /// Entity id
    pub id: Uuid,
    /// Owning peer
    pub peer_id: Uuid,
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Address the service listens on inside the peer's site
    pub local_ip: IpAddr,
    /// Local port; 0 means any port
    pub local_port: u16,
    /// Address allocated from the WAN's shared-services range
    pub shared_ip: Ipv4Addr,
    /// Port exposed on the shared address; 0 means any port
    pub shared_port: u16,
    /// Transport protocol
    pub protocol: ServiceProtocol,
    /// Whether the service is currently published
    pub is_active: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// What a deployment job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Convergent apply of the desired state
    DeployConfig,
    /// Push a stored configuration back
    Rollback,
    /// Read-only drift check
    Verify,
    /// Connectivity probe
    TestConnection,
}

/// Lifecycle state of a deployment job. Transitions are monotonic:
/// pending → running → {completed, failed, cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet picked up
    Pending,
    /// Executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by the operator
    Cancelled,
}

impl JobStatus {
    /// Position in the transition partial order.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 2,
        }
    }

    /// Whether the job can still make progress.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether the job has reached a final state.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// All statuses, for metrics enumeration.
    pub fn all() -> [JobStatus; 5] {
        [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One deployment job against a managed router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentJob {
    /// Entity id
    pub id: Uuid,
    /// Target peer
    pub peer_id: Uuid,
    /// What the job does
    pub job_type: JobType,
    /// Lifecycle state
    pub status: JobStatus,
    /// Progress, 0..=100, monotone
    pub progress_percent: u8,
    /// When execution began
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure description
    pub error_message: Option<String>,
    /// Free-form operation notes (warnings, tracebacks)
    pub operations_log: Vec<serde_json::Value>,
    /// Snapshot of managed resources captured before the first write
    pub backup_config: Option<serde_json::Value>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// User who started the job
    pub created_by: Option<Uuid>,
}

/// HTTP method of an audited router API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// Read
    Get,
    /// Create (script execution)
    Post,
    /// Create (resource rows)
    Put,
    /// Update
    Patch,
    /// Delete
    Delete,
}

/// Audit record of a single router API call made during a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallRecord {
    /// Entity id
    pub id: Uuid,
    /// Owning job
    pub job_id: Uuid,
    /// Peer the call targeted
    pub peer_id: Uuid,
    /// HTTP method
    pub method: HttpMethod,
    /// Resource endpoint
    pub endpoint: String,
    /// Request body, if any
    pub request_body: Option<serde_json::Value>,
    /// Response status code (0 when no response was received)
    pub response_status: u16,
    /// Response body, if any
    pub response_body: Option<serde_json::Value>,
    /// Transport or API error
    pub error_message: Option<String>,
    /// When the call happened
    pub timestamp: DateTime<Utc>,
}

/// Kind of generated configuration text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigType {
    /// Standard WireGuard INI
    Wireguard,
    /// RouterOS script
    MikrotikScript,
    /// RouterOS script captured at API deployment time (revert source)
    MikrotikApi,
    /// iptables rules
    Iptables,
    /// nftables rules
    Nftables,
}

/// A generated configuration kept for audit and revert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationHistory {
    /// Entity id
    pub id: Uuid,
    /// Owning peer
    pub peer_id: Uuid,
    /// The generated text
    pub configuration_text: String,
    /// Kind of configuration
    pub config_type: ConfigType,
    /// When the text was generated
    pub generated_at: DateTime<Utc>,
    /// When the text was applied to a device, if ever
    pub applied_at: Option<DateTime<Utc>>,
}

/// Role of a control-plane user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Full control
    Admin,
    /// Day-to-day operations
    Operator,
    /// Read-only
    Viewer,
}

/// A control-plane user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Entity id
    pub id: Uuid,
    /// Unique login name
    pub username: String,
    /// Unique email
    pub email: String,
    /// Argon2 password hash
    #[serde(default, skip_serializing)]
    pub password_hash: String,
    /// Role
    pub role: UserRole,
    /// Whether the account can log in
    pub is_active: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// A peer together with its subnets and services, as the config generator
/// consumes it.
#[derive(Debug, Clone)]
pub struct PeerView {
    /// The peer
    pub peer: Peer,
    /// Its advertised subnets
    pub subnets: Vec<LocalSubnet>,
    /// Its published services
    pub services: Vec<PublishedService>,
}

/// Read-only snapshot of everything the generator needs for one peer.
#[derive(Debug, Clone)]
pub struct OverlaySnapshot {
    /// The WAN the peer belongs to
    pub wan: WanNetwork,
    /// The target peer
    pub peer: PeerView,
    /// Every other peer in the WAN
    pub others: Vec<PeerView>,
}
