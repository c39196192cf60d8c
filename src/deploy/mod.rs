//! Convergent deployment engine
//!
//! Plans, preflights, applies, verifies, reverts and clears router state
//! against the desired configuration of a managed peer. Applies run as
//! background jobs with per-peer mutual exclusion, milestone progress,
//! an exactly-once pre-write backup, and a full audit of every remote
//! call. Foreign router resources (comment without the ownership prefix)
//! are never touched.

mod engine;

pub use engine::DeployEngine;

use crate::routeros::{
    HttpTransport, ManagedResources, RouterError, RouterParams, RouterTransport,
};
use serde::Serialize;

/// Builds transports for managed routers. Swapped for an in-memory
/// implementation in tests.
pub trait RouterConnector: Send + Sync {
    /// Open a transport to the router described by `params`.
    fn connect(&self, params: RouterParams) -> Result<Box<dyn RouterTransport>, RouterError>;
}

/// Production connector speaking the REST transport.
pub struct HttpConnector;

impl RouterConnector for HttpConnector {
    fn connect(&self, params: RouterParams) -> Result<Box<dyn RouterTransport>, RouterError> {
        Ok(Box::new(HttpTransport::new(params)?))
    }
}

/// Per-family change summary computed by set-differencing the ownership
/// comments of desired and current resources.
#[derive(Debug, Clone, Serialize)]
pub struct FamilyPlan {
    /// Resource family name
    pub kind: String,
    /// Desired entries not yet on the router
    pub to_create: usize,
    /// Managed entries on the router with no desired counterpart
    pub to_delete: usize,
    /// Managed entries currently on the router
    pub managed_current: usize,
    /// Entries in the desired state
    pub managed_desired: usize,
}

/// Read-only preview of what an apply would change.
#[derive(Debug, Clone, Serialize)]
pub struct DeployPlan {
    /// Interface the deployment targets (key material redacted)
    pub interface: PlanInterface,
    /// Per-family summaries
    pub summary: PlanSummary,
}

/// Interface description within a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanInterface {
    /// Interface name
    pub name: String,
    /// Listen port
    #[serde(rename = "listen-port")]
    pub listen_port: u16,
    /// Ownership comment
    pub comment: String,
}

/// The plan's family summaries.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    /// Interface addresses
    pub ips: FamilyPlan,
    /// Routes
    pub routes: FamilyPlan,
    /// Firewall filter rules
    pub firewall: FamilyPlan,
    /// NAT rules
    pub nat: FamilyPlan,
    /// WireGuard peers
    pub peers: FamilyPlan,
}

/// One non-fatal finding from a preflight read.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightIssue {
    /// Issue class
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description
    pub description: String,
    /// Ways the operator could resolve it
    pub suggestions: Vec<String>,
}

/// Result of a preflight check. Preflight never writes.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    /// True when no issues were found
    pub success: bool,
    /// The findings
    pub issues: Vec<PreflightIssue>,
}

/// Result of a drift check between desired and deployed state.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// True when the router matches the desired state
    pub in_sync: bool,
    /// Human-readable drift findings
    pub issues: Vec<String>,
    /// The managed resources as currently read from the router
    pub current: ManagedResources,
}

/// Outcome of a connectivity probe, including observed identity.
#[derive(Debug, Clone, Serialize)]
pub struct TestConnectionResult {
    /// Whether the probe succeeded
    pub success: bool,
    /// `/system/identity` name when connected
    pub router_identity: Option<String>,
    /// RouterOS version when connected
    pub routeros_version: Option<String>,
    /// Failure description otherwise
    pub error_message: Option<String>,
}
