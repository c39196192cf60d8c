//! Shared-service DNS publishing
//!
//! Optional integration that publishes `hostname → shared-ip` records for
//! published services. DNS failures are never allowed to fail the calling
//! operation; every call site logs and moves on.

use crate::config::Settings;
use tracing::{debug, warn};
use uuid::Uuid;

/// Publishes service hostnames to a Pi-hole-style DNS API.
pub struct DnsPublisher {
    api_url: Option<String>,
    token: Option<String>,
    verify_ssl: bool,
    suffix: String,
    client: reqwest::Client,
}

impl DnsPublisher {
    /// Build the publisher from settings. Without a URL and token the
    /// publisher stays inert.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            api_url: settings.dns_api_url.clone(),
            token: settings.dns_api_token.clone(),
            verify_ssl: settings.dns_verify_ssl,
            suffix: settings.dns_suffix.clone(),
            client: reqwest::Client::builder()
                .danger_accept_invalid_certs(!settings.dns_verify_ssl)
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Whether a DNS provider is configured.
    pub fn is_configured(&self) -> bool {
        self.api_url.as_deref().is_some_and(|u| !u.is_empty())
            && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Hostname for a published service:
    /// `slug(service).slug(wan).<first 6 of id>.<suffix>`.
    pub fn build_hostname(&self, service_name: &str, service_id: Uuid, wan_name: &str) -> String {
        let mut parts = vec![slugify(service_name)];
        let wan_part = slugify(wan_name);
        if !wan_part.is_empty() {
            parts.push(wan_part);
        }
        parts.push(service_id.to_string()[..6].to_string());
        parts.push(if self.suffix.is_empty() {
            "lan".to_string()
        } else {
            self.suffix.clone()
        });
        parts.join(".")
    }

    /// Publish a record. Errors are logged, not returned.
    pub async fn add_record(&self, hostname: &str, ip: &str) {
        let Some(url) = self.api_url.as_deref() else {
            return;
        };
        if !self.is_configured() {
            return;
        }
        let result = self
            .client
            .post(url)
            .query(&[
                ("list", "1"),
                ("addhostname", hostname),
                ("addip", ip),
                ("token", self.token.as_deref().unwrap_or("")),
            ])
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(hostname, ip, "published DNS record");
            }
            Ok(response) => {
                warn!(hostname, status = %response.status(), "DNS provider rejected record");
            }
            Err(err) => {
                warn!(hostname, error = %err, "failed to publish DNS record");
            }
        }
    }

    /// Remove a record. Errors are logged, not returned.
    pub async fn delete_record(&self, hostname: &str, ip: &str) {
        let Some(url) = self.api_url.as_deref() else {
            return;
        };
        if !self.is_configured() {
            return;
        }
        let result = self
            .client
            .post(url)
            .query(&[
                ("list", "1"),
                ("delhostname", hostname),
                ("ip", ip),
                ("token", self.token.as_deref().unwrap_or("")),
            ])
            .send()
            .await;
        if let Err(err) = result {
            warn!(hostname, error = %err, "failed to delete DNS record");
        }
    }

    /// Whether TLS verification is enabled towards the provider.
    pub fn verifies_ssl(&self) -> bool {
        self.verify_ssl
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "service".to_string()
    } else {
        slug
    }
}
