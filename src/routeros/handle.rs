//! Async adapter around the synchronous router client
//!
//! The transport is a synchronous protocol library; calls are offloaded to
//! the blocking pool so concurrent deployments do not starve the request
//! scheduler, and each call is bounded by the configured deployment
//! timeout. Timeouts surface as the `timeout` error class.

use super::client::RouterClient;
use super::types::RouterError;
use crate::error::{Result, WirewanError};
use std::sync::Arc;
use std::time::Duration;

/// Async handle to one router's audited client.
#[derive(Clone)]
pub struct RouterHandle {
    client: Arc<RouterClient>,
    timeout: Duration,
}

impl RouterHandle {
    /// Wrap a client with a per-call timeout.
    pub fn new(client: Arc<RouterClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// The wrapped client, for draining audit records.
    pub fn client(&self) -> &Arc<RouterClient> {
        &self.client
    }

    /// Run one synchronous client operation on the blocking pool.
    pub async fn run<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&RouterClient) -> std::result::Result<R, RouterError> + Send + 'static,
    {
        let client = self.client.clone();
        let task = tokio::task::spawn_blocking(move || op(&client));
        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(WirewanError::RouterApi(RouterError::Timeout(format!(
                "router call exceeded {}s",
                self.timeout.as_secs()
            )))),
            Ok(Err(join_err)) => Err(WirewanError::RouterApi(RouterError::Unknown(format!(
                "router worker failed: {}",
                join_err
            )))),
            Ok(Ok(result)) => result.map_err(WirewanError::RouterApi),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routeros::types::{ResourcePath, RouterEntry, RouterTransport};

    struct SlowTransport;

    impl RouterTransport for SlowTransport {
        fn list(&self, _path: ResourcePath) -> std::result::Result<Vec<RouterEntry>, RouterError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        }

        fn add(
            &self,
            _path: ResourcePath,
            body: &RouterEntry,
        ) -> std::result::Result<RouterEntry, RouterError> {
            Ok(body.clone())
        }

        fn update(
            &self,
            _path: ResourcePath,
            _id: &str,
            _body: &RouterEntry,
        ) -> std::result::Result<(), RouterError> {
            Ok(())
        }

        fn delete(
            &self,
            _path: ResourcePath,
            _id: &str,
        ) -> std::result::Result<(), RouterError> {
            Ok(())
        }

        fn run_script(&self, _script: &str) -> std::result::Result<(), RouterError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported_as_timeout() {
        let client = Arc::new(RouterClient::new(Box::new(SlowTransport)));
        let handle = RouterHandle::new(client, Duration::from_millis(20));
        let result = handle
            .run(|c| c.list(ResourcePath::IpRoute, None))
            .await;
        match result {
            Err(WirewanError::RouterApi(RouterError::Timeout(_))) => {}
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_successful_call_passes_through() {
        let client = Arc::new(RouterClient::new(Box::new(SlowTransport)));
        let handle = RouterHandle::new(client, Duration::from_secs(5));
        let rows = handle
            .run(|c| c.list(ResourcePath::IpRoute, None))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
