//! Router API transport types

use crate::model::AuthMethod;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// One router resource row: native kebab-case field names mapped to string
/// values, with the router-assigned handle under `.id`.
pub type RouterEntry = BTreeMap<String, String>;

/// Resource families exposed by the router API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourcePath {
    /// `/interface/wireguard`
    WireguardInterface,
    /// `/interface/wireguard/peers`
    WireguardPeer,
    /// `/ip/address`
    IpAddress,
    /// `/ip/route`
    IpRoute,
    /// `/ip/firewall/filter`
    FirewallFilter,
    /// `/ip/firewall/nat`
    FirewallNat,
    /// `/system/identity`
    SystemIdentity,
    /// `/system/resource`
    SystemResource,
}

impl ResourcePath {
    /// REST endpoint of the family.
    pub fn endpoint(&self) -> &'static str {
        match self {
            ResourcePath::WireguardInterface => "/interface/wireguard",
            ResourcePath::WireguardPeer => "/interface/wireguard/peers",
            ResourcePath::IpAddress => "/ip/address",
            ResourcePath::IpRoute => "/ip/route",
            ResourcePath::FirewallFilter => "/ip/firewall/filter",
            ResourcePath::FirewallNat => "/ip/firewall/nat",
            ResourcePath::SystemIdentity => "/system/identity",
            ResourcePath::SystemResource => "/system/resource",
        }
    }
}

/// Errors from the router API, classified for status reporting.
#[derive(Error, Debug, Clone)]
pub enum RouterError {
    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The API endpoint refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The call did not complete within the timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// The router answered with something the client could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The router rejected the request
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Router-provided message
        message: String,
    },

    /// The peer has no usable connection parameters
    #[error("Router not configured: {0}")]
    NotConfigured(String),

    /// Anything else
    #[error("Connection failed: {0}")]
    Unknown(String),
}

impl RouterError {
    /// Whether this error means the credentials are wrong (as opposed to
    /// the device being unreachable).
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, RouterError::AuthFailed(_))
    }

    /// HTTP status to record in the audit log, 0 when no response arrived.
    pub fn response_status(&self) -> u16 {
        match self {
            RouterError::AuthFailed(_) => 401,
            RouterError::Api { status, .. } => *status,
            _ => 0,
        }
    }
}

/// Identity read from a successful connection test.
#[derive(Debug, Clone)]
pub struct RouterIdentity {
    /// `/system/identity` name
    pub identity: String,
    /// RouterOS version
    pub version: String,
}

/// Connection parameters for one managed router.
#[derive(Debug, Clone)]
pub struct RouterParams {
    /// Management host or address
    pub host: String,
    /// API port
    pub port: u16,
    /// Username for password auth
    pub username: String,
    /// Decrypted password
    pub password: Option<String>,
    /// Decrypted API token
    pub api_token: Option<String>,
    /// Credential style
    pub auth_method: AuthMethod,
    /// Use TLS
    pub use_ssl: bool,
    /// Verify the router's certificate
    pub verify_cert: bool,
    /// Per-call timeout
    pub timeout: Duration,
}

/// Synchronous CRUD surface over the router's resource families.
///
/// Implemented by the REST transport in production and by in-memory mock
/// routers in tests.
pub trait RouterTransport: Send + Sync {
    /// List all rows of a family.
    fn list(&self, path: ResourcePath) -> Result<Vec<RouterEntry>, RouterError>;

    /// Add a row; returns the created row including its `.id`.
    fn add(&self, path: ResourcePath, body: &RouterEntry) -> Result<RouterEntry, RouterError>;

    /// Update fields of an existing row.
    fn update(&self, path: ResourcePath, id: &str, body: &RouterEntry)
        -> Result<(), RouterError>;

    /// Delete a row by id.
    fn delete(&self, path: ResourcePath, id: &str) -> Result<(), RouterError>;

    /// Execute a script through the device's script-exec surface.
    fn run_script(&self, script: &str) -> Result<(), RouterError>;
}
