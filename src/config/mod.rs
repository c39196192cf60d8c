//! Configuration management
//!
//! Settings are read from an optional TOML file and overridden by
//! environment variables. Required secrets (encryption key and salt) are
//! validated at startup; the process refuses to boot without them.

use crate::error::{Result, WirewanError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Address the control API binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Key material for the secret envelope (required)
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Salt for envelope key derivation, unique per installation (required)
    #[serde(default)]
    pub encryption_salt: Option<String>,

    /// HS256 signing key for bearer tokens
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Bearer token lifetime in minutes
    #[serde(default = "default_token_ttl")]
    pub access_token_expire_minutes: i64,

    /// Default tunnel range for new WAN networks
    #[serde(default = "default_tunnel_range")]
    pub default_tunnel_ip_range: String,

    /// Default shared-services range for new WAN networks
    #[serde(default = "default_shared_range")]
    pub default_shared_services_range: String,

    /// Default WireGuard listen port
    #[serde(default = "default_wireguard_port")]
    pub default_wireguard_port: u16,

    /// Default management API port for managed routers
    #[serde(default = "default_api_port")]
    pub mikrotik_default_api_port: u16,

    /// Default WireGuard interface name on managed routers
    #[serde(default = "default_interface_name")]
    pub mikrotik_default_interface_name: String,

    /// Ceiling on concurrently executing deployments
    #[serde(default = "default_max_deployments")]
    pub max_concurrent_deployments: usize,

    /// Budget for a single deployment, in seconds
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout_seconds: u64,

    /// DNS suffix for published service hostnames
    #[serde(default = "default_dns_suffix")]
    pub dns_suffix: String,

    /// DNS provider API URL; DNS publishing is disabled when unset
    #[serde(default)]
    pub dns_api_url: Option<String>,

    /// DNS provider API token
    #[serde(default)]
    pub dns_api_token: Option<String>,

    /// Verify the DNS provider's TLS certificate
    #[serde(default = "default_true")]
    pub dns_verify_ssl: bool,

    /// Require `approve=true` before a deploy writes to a router
    #[serde(default = "default_true")]
    pub require_deploy_approval: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            encryption_key: None,
            encryption_salt: None,
            jwt_secret: default_jwt_secret(),
            access_token_expire_minutes: default_token_ttl(),
            default_tunnel_ip_range: default_tunnel_range(),
            default_shared_services_range: default_shared_range(),
            default_wireguard_port: default_wireguard_port(),
            mikrotik_default_api_port: default_api_port(),
            mikrotik_default_interface_name: default_interface_name(),
            max_concurrent_deployments: default_max_deployments(),
            deployment_timeout_seconds: default_deployment_timeout(),
            dns_suffix: default_dns_suffix(),
            dns_api_url: None,
            dns_api_token: None,
            dns_verify_ssl: true,
            require_deploy_approval: true,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file, then apply environment
    /// variable overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut settings = match path {
            Some(p) if p.as_ref().exists() => {
                let content = std::fs::read_to_string(p.as_ref()).map_err(|e| {
                    WirewanError::Config(format!(
                        "Failed to read config file {:?}: {}",
                        p.as_ref(),
                        e
                    ))
                })?;
                toml::from_str(&content)?
            }
            _ => Settings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Apply `WIREWAN_*` environment variable overrides.
    fn apply_env(&mut self) {
        if let Ok(v) = env::var("WIREWAN_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Ok(v) = env::var("WIREWAN_ENCRYPTION_KEY") {
            self.encryption_key = Some(v);
        }
        if let Ok(v) = env::var("WIREWAN_ENCRYPTION_SALT") {
            self.encryption_salt = Some(v);
        }
        if let Ok(v) = env::var("WIREWAN_JWT_SECRET") {
            self.jwt_secret = v;
        }
        if let Ok(v) = env::var("WIREWAN_TOKEN_TTL_MINUTES") {
            if let Ok(n) = v.parse() {
                self.access_token_expire_minutes = n;
            }
        }
        if let Ok(v) = env::var("WIREWAN_DEFAULT_TUNNEL_IP_RANGE") {
            self.default_tunnel_ip_range = v;
        }
        if let Ok(v) = env::var("WIREWAN_DEFAULT_SHARED_SERVICES_RANGE") {
            self.default_shared_services_range = v;
        }
        if let Ok(v) = env::var("WIREWAN_MAX_CONCURRENT_DEPLOYMENTS") {
            if let Ok(n) = v.parse() {
                self.max_concurrent_deployments = n;
            }
        }
        if let Ok(v) = env::var("WIREWAN_DEPLOYMENT_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse() {
                self.deployment_timeout_seconds = n;
            }
        }
        if let Ok(v) = env::var("WIREWAN_DNS_SUFFIX") {
            self.dns_suffix = v;
        }
        if let Ok(v) = env::var("WIREWAN_DNS_API_URL") {
            self.dns_api_url = Some(v);
        }
        if let Ok(v) = env::var("WIREWAN_DNS_API_TOKEN") {
            self.dns_api_token = Some(v);
        }
        if let Ok(v) = env::var("WIREWAN_DNS_VERIFY_SSL") {
            self.dns_verify_ssl = v != "false" && v != "0";
        }
        if let Ok(v) = env::var("WIREWAN_REQUIRE_DEPLOY_APPROVAL") {
            self.require_deploy_approval = v != "false" && v != "0";
        }
    }

    /// Validate the settings required to boot.
    ///
    /// The secret envelope cannot operate without key material, so a missing
    /// key or salt is fatal at startup rather than at first use.
    pub fn validate(&self) -> Result<()> {
        if self.encryption_key.as_deref().unwrap_or("").is_empty() {
            return Err(WirewanError::Config(
                "encryption_key is not configured. Set WIREWAN_ENCRYPTION_KEY \
                 or add encryption_key to the config file."
                    .to_string(),
            ));
        }
        if self.encryption_salt.as_deref().unwrap_or("").is_empty() {
            return Err(WirewanError::Config(
                "encryption_salt is not configured. Set WIREWAN_ENCRYPTION_SALT \
                 or add encryption_salt to the config file."
                    .to_string(),
            ));
        }
        if self.max_concurrent_deployments == 0 {
            return Err(WirewanError::Config(
                "max_concurrent_deployments must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_jwt_secret() -> String {
    // Overridden in any real deployment; a random per-process default keeps
    // issued tokens from validating across restarts.
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().gen();
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    URL_SAFE_NO_PAD.encode(bytes)
}

fn default_token_ttl() -> i64 {
    60 * 24 * 7
}

fn default_tunnel_range() -> String {
    "10.0.0.0/24".to_string()
}

fn default_shared_range() -> String {
    "10.0.5.0/24".to_string()
}

fn default_wireguard_port() -> u16 {
    51820
}

fn default_api_port() -> u16 {
    8728
}

fn default_interface_name() -> String {
    "wg-wan-overlay".to_string()
}

fn default_max_deployments() -> usize {
    10
}

fn default_deployment_timeout() -> u64 {
    300
}

fn default_dns_suffix() -> String {
    "lan".to_string()
}

fn default_true() -> bool {
    true
}
