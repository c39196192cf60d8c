//! RouterOS REST transport
//!
//! Synchronous HTTP adapter speaking the RouterOS v7 REST API under
//! `/rest`. Rows arrive as JSON objects with string-ish values; everything
//! is normalized to string maps so the rest of the system is independent of
//! the wire encoding.

use super::types::{ResourcePath, RouterEntry, RouterError, RouterParams, RouterTransport};
use crate::model::AuthMethod;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;

/// Blocking REST transport to one router.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    params: RouterParams,
}

impl HttpTransport {
    /// Build a transport from connection parameters.
    pub fn new(params: RouterParams) -> Result<Self, RouterError> {
        if params.host.is_empty() {
            return Err(RouterError::NotConfigured(
                "management IP/hostname is not configured for this peer".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(params.timeout)
            .danger_accept_invalid_certs(!params.verify_cert)
            .build()
            .map_err(|e| RouterError::Unknown(e.to_string()))?;
        let scheme = if params.use_ssl { "https" } else { "http" };
        let base_url = format!("{}://{}:{}/rest", scheme, params.host, params.port);
        Ok(Self {
            client,
            base_url,
            params,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.params.auth_method {
            AuthMethod::Token => request.bearer_auth(self.params.api_token.as_deref().unwrap_or("")),
            AuthMethod::Password => request.basic_auth(
                &self.params.username,
                Some(self.params.password.as_deref().unwrap_or("")),
            ),
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<serde_json::Value, RouterError> {
        let response = self.authorize(request).send().map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().map_err(classify_transport)?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RouterError::AuthFailed(truncate(&body)));
        }
        if !status.is_success() {
            return Err(RouterError::Api {
                status: status.as_u16(),
                message: truncate(&body),
            });
        }
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| RouterError::Protocol(format!("bad JSON from router: {}", e)))
    }

    fn url(&self, path: ResourcePath) -> String {
        format!("{}{}", self.base_url, path.endpoint())
    }
}

impl RouterTransport for HttpTransport {
    fn list(&self, path: ResourcePath) -> Result<Vec<RouterEntry>, RouterError> {
        let value = self.send(self.client.get(self.url(path)))?;
        match value {
            serde_json::Value::Array(rows) => Ok(rows.iter().map(json_to_entry).collect()),
            // /system/identity and /system/resource answer with one object
            serde_json::Value::Object(_) => Ok(vec![json_to_entry(&value)]),
            serde_json::Value::Null => Ok(Vec::new()),
            other => Err(RouterError::Protocol(format!(
                "unexpected response shape: {}",
                other
            ))),
        }
    }

    fn add(&self, path: ResourcePath, body: &RouterEntry) -> Result<RouterEntry, RouterError> {
        let value = self.send(self.client.put(self.url(path)).json(body))?;
        Ok(json_to_entry(&value))
    }

    fn update(
        &self,
        path: ResourcePath,
        id: &str,
        body: &RouterEntry,
    ) -> Result<(), RouterError> {
        let url = format!("{}/{}", self.url(path), id);
        self.send(self.client.patch(url).json(body))?;
        Ok(())
    }

    fn delete(&self, path: ResourcePath, id: &str) -> Result<(), RouterError> {
        let url = format!("{}/{}", self.url(path), id);
        self.send(self.client.delete(url))?;
        Ok(())
    }

    fn run_script(&self, script: &str) -> Result<(), RouterError> {
        let url = format!("{}/execute", self.base_url);
        let body = serde_json::json!({ "script": script });
        self.send(self.client.post(url).json(&body))?;
        Ok(())
    }
}

fn classify_transport(err: reqwest::Error) -> RouterError {
    if err.is_timeout() {
        RouterError::Timeout(err.to_string())
    } else if err.is_connect() {
        RouterError::ConnectionRefused(err.to_string())
    } else {
        RouterError::Unknown(err.to_string())
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    let trimmed = body.trim();
    if trimmed.len() > MAX {
        let cut: String = trimmed.chars().take(MAX).collect();
        format!("{}...", cut)
    } else {
        trimmed.to_string()
    }
}

/// Flatten a JSON row into a string map. RouterOS values are strings on the
/// wire, but numbers and booleans appear after JSON decoding; both are kept
/// as their string rendering.
pub(crate) fn json_to_entry(value: &serde_json::Value) -> RouterEntry {
    let mut entry = RouterEntry::new();
    if let serde_json::Value::Object(map) = value {
        for (key, val) in map {
            let rendered = match val {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            entry.insert(key.clone(), rendered);
        }
    }
    entry
}
