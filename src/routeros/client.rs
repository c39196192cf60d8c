//! Audited router client
//!
//! Wraps a transport and records every call. Composite operations enforce
//! the ownership convention: only rows whose comment begins with the
//! ownership prefix are ever deleted, and removal follows the dependency
//! order NAT → firewall → routes → addresses → peers → interface.
//! Deleting the interface first would invalidate dependent rules and
//! produce partial failures.

use super::types::{
    ResourcePath, RouterEntry, RouterError, RouterIdentity, RouterTransport,
};
use crate::model::HttpMethod;
use crate::COMMENT_PREFIX;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Audit record of one transport call, before it is attached to a job.
#[derive(Debug, Clone)]
pub struct AuditCall {
    /// HTTP method
    pub method: HttpMethod,
    /// Resource endpoint
    pub endpoint: String,
    /// Request body, if any
    pub request_body: Option<serde_json::Value>,
    /// Response status (0 when no response arrived)
    pub response_status: u16,
    /// Response body, if any
    pub response_body: Option<serde_json::Value>,
    /// Error string on failure
    pub error_message: Option<String>,
    /// When the call happened
    pub timestamp: DateTime<Utc>,
}

/// Every managed resource family on a router, as read back with the
/// ownership filter applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagedResources {
    /// WireGuard interfaces
    pub wireguard_interfaces: Vec<RouterEntry>,
    /// WireGuard peers
    pub wireguard_peers: Vec<RouterEntry>,
    /// Interface addresses
    pub ip_addresses: Vec<RouterEntry>,
    /// Routes
    pub routes: Vec<RouterEntry>,
    /// Firewall filter rules
    pub firewall_rules: Vec<RouterEntry>,
    /// NAT rules
    pub nat_rules: Vec<RouterEntry>,
}

/// Comment of a router row, empty when unset.
pub fn comment_of(entry: &RouterEntry) -> &str {
    entry.get("comment").map(String::as_str).unwrap_or("")
}

/// Synchronous, audit-recording client for one managed router.
pub struct RouterClient {
    transport: Box<dyn RouterTransport>,
    audit: Mutex<Vec<AuditCall>>,
}

impl RouterClient {
    /// Wrap a transport.
    pub fn new(transport: Box<dyn RouterTransport>) -> Self {
        Self {
            transport,
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Drain the audit trail accumulated so far.
    pub fn take_audit(&self) -> Vec<AuditCall> {
        std::mem::take(&mut *self.audit.lock())
    }

    fn record<T: Serialize>(
        &self,
        method: HttpMethod,
        endpoint: String,
        request_body: Option<serde_json::Value>,
        result: &Result<T, RouterError>,
    ) {
        let call = match result {
            Ok(value) => AuditCall {
                method,
                endpoint,
                request_body,
                response_status: 200,
                response_body: serde_json::to_value(value).ok(),
                error_message: None,
                timestamp: Utc::now(),
            },
            Err(err) => AuditCall {
                method,
                endpoint,
                request_body,
                response_status: err.response_status(),
                response_body: None,
                error_message: Some(err.to_string()),
                timestamp: Utc::now(),
            },
        };
        self.audit.lock().push(call);
    }

    /// List a family, optionally keeping only rows whose comment contains
    /// the filter substring.
    pub fn list(
        &self,
        path: ResourcePath,
        comment_filter: Option<&str>,
    ) -> Result<Vec<RouterEntry>, RouterError> {
        let result = self.transport.list(path);
        self.record(HttpMethod::Get, path.endpoint().to_string(), None, &result);
        let mut rows = result?;
        if let Some(filter) = comment_filter {
            rows.retain(|row| comment_of(row).contains(filter));
        }
        Ok(rows)
    }

    /// Add a row to a family. Creation goes over PUT on the wire; the
    /// audit record matches.
    pub fn add(&self, path: ResourcePath, body: RouterEntry) -> Result<RouterEntry, RouterError> {
        let request_body = serde_json::to_value(&body).ok();
        let result = self.transport.add(path, &body);
        self.record(
            HttpMethod::Put,
            path.endpoint().to_string(),
            request_body,
            &result,
        );
        result
    }

    /// Update a row in place.
    pub fn update(
        &self,
        path: ResourcePath,
        id: &str,
        body: RouterEntry,
    ) -> Result<(), RouterError> {
        let request_body = serde_json::to_value(&body).ok();
        let result = self.transport.update(path, id, &body);
        self.record(
            HttpMethod::Patch,
            format!("{}/{}", path.endpoint(), id),
            request_body,
            &result,
        );
        result
    }

    /// Delete a row by id.
    pub fn delete(&self, path: ResourcePath, id: &str) -> Result<(), RouterError> {
        let result = self.transport.delete(path, id);
        self.record(
            HttpMethod::Delete,
            format!("{}/{}", path.endpoint(), id),
            None,
            &result,
        );
        result
    }

    /// Connect, read identity and OS version.
    pub fn test_connection(&self) -> Result<RouterIdentity, RouterError> {
        let identity_rows = self.list(ResourcePath::SystemIdentity, None)?;
        let resource_rows = self.list(ResourcePath::SystemResource, None)?;
        let identity = identity_rows
            .first()
            .and_then(|row| row.get("name").cloned())
            .unwrap_or_else(|| "Unknown".to_string());
        let version = resource_rows
            .first()
            .and_then(|row| row.get("version").cloned())
            .unwrap_or_else(|| "Unknown".to_string());
        Ok(RouterIdentity { identity, version })
    }

    /// Read every family, filtered by the ownership prefix.
    pub fn get_managed_resources(&self) -> Result<ManagedResources, RouterError> {
        Ok(ManagedResources {
            wireguard_interfaces: self
                .list(ResourcePath::WireguardInterface, Some(COMMENT_PREFIX))?,
            wireguard_peers: self.list(ResourcePath::WireguardPeer, Some(COMMENT_PREFIX))?,
            ip_addresses: self.list(ResourcePath::IpAddress, Some(COMMENT_PREFIX))?,
            routes: self.list(ResourcePath::IpRoute, Some(COMMENT_PREFIX))?,
            firewall_rules: self.list(ResourcePath::FirewallFilter, Some(COMMENT_PREFIX))?,
            nat_rules: self.list(ResourcePath::FirewallNat, Some(COMMENT_PREFIX))?,
        })
    }

    /// Delete every row of a family whose comment starts with the
    /// ownership prefix. Rows without the prefix are foreign and stay.
    pub fn delete_managed(&self, path: ResourcePath) -> Result<usize, RouterError> {
        let rows = self.list(path, None)?;
        let mut deleted = 0;
        for row in rows {
            if !comment_of(&row).starts_with(COMMENT_PREFIX) {
                continue;
            }
            if let Some(id) = row.get(".id") {
                self.delete(path, id)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Remove all managed resources in dependency order.
    pub fn remove_managed_resources(&self) -> Result<(), RouterError> {
        self.delete_managed(ResourcePath::FirewallNat)?;
        self.delete_managed(ResourcePath::FirewallFilter)?;
        self.delete_managed(ResourcePath::IpRoute)?;
        self.delete_managed(ResourcePath::IpAddress)?;
        self.delete_managed(ResourcePath::WireguardPeer)?;
        self.delete_managed(ResourcePath::WireguardInterface)?;
        Ok(())
    }

    /// Execute a script payload on the device.
    pub fn run_script(&self, script: &str) -> Result<(), RouterError> {
        let result = self.transport.run_script(script);
        self.record(
            HttpMethod::Post,
            "/execute".to_string(),
            Some(serde_json::json!({ "script": script })),
            &result,
        );
        result
    }
}
