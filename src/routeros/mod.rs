//! Managed router API client
//!
//! A thin, synchronous adapter to a managed MikroTik router's REST API,
//! wrapped for asynchronous callers. Every remote call is audited; the
//! deployment engine drains the audit trail into the job's call log.
//!
//! Resources are exchanged as ordered string maps carrying the router's
//! native kebab-case field names plus the `.id` handle. The ownership
//! marker lives in the `comment` field: the client's composite operations
//! only ever touch rows whose comment starts with the prefix.

mod client;
mod handle;
mod http;
mod types;

pub use client::{comment_of, AuditCall, ManagedResources, RouterClient};
pub use handle::RouterHandle;
pub use http::HttpTransport;
pub use types::{
    ResourcePath, RouterEntry, RouterError, RouterIdentity, RouterParams, RouterTransport,
};
