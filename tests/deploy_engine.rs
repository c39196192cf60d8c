//! Integration tests for the deployment engine
//!
//! These tests drive plan/preflight/apply/verify/clear against an
//! in-memory mock router. The mock asserts the ownership convention on
//! every destructive call: deleting or updating a row whose comment does
//! not carry the managed prefix panics the worker and fails the test.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use wirewan::config::Settings;
use wirewan::deploy::{DeployEngine, RouterConnector};
use wirewan::model::store::{NewPeer, NewSubnet};
use wirewan::model::{
    ApiStatus, AuthMethod, DeploymentJob, JobStatus, ManagedDevice, PeerType, Store, TopologyType,
    WanNetwork,
};
use wirewan::routeros::{ResourcePath, RouterEntry, RouterError, RouterTransport};
use wirewan::secrets::SecretEnvelope;
use wirewan::wireguard::KeyPair;
use wirewan::{WirewanError, COMMENT_PREFIX};

// ----------------------------------------------------------------------
// Mock router
// ----------------------------------------------------------------------

#[derive(Default)]
struct Gate {
    opened: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.opened.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut opened = self.opened.lock().unwrap();
        while !*opened {
            opened = self.cv.wait(opened).unwrap();
        }
    }
}

#[derive(Default)]
struct RouterState {
    rows: HashMap<ResourcePath, Vec<RouterEntry>>,
    next_id: u64,
    writes: u64,
    scripts: Vec<String>,
    fail_connection: bool,
}

#[derive(Default)]
struct MockRouter {
    state: Mutex<RouterState>,
    gate: Option<Arc<Gate>>,
}

impl MockRouter {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated(gate: Arc<Gate>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RouterState::default()),
            gate: Some(gate),
        })
    }

    fn failing_connection() -> Arc<Self> {
        let router = Self::default();
        router.state.lock().unwrap().fail_connection = true;
        Arc::new(router)
    }

    fn seed(&self, path: ResourcePath, pairs: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let mut entry: RouterEntry = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        entry.insert(".id".to_string(), format!("*{}", state.next_id));
        state.rows.entry(path).or_default().push(entry);
    }

    fn rows(&self, path: ResourcePath) -> Vec<RouterEntry> {
        self.state
            .lock()
            .unwrap()
            .rows
            .get(&path)
            .cloned()
            .unwrap_or_default()
    }

    fn comments(&self, path: ResourcePath) -> Vec<String> {
        self.rows(path)
            .iter()
            .filter_map(|row| row.get("comment").cloned())
            .collect()
    }

    fn writes(&self) -> u64 {
        self.state.lock().unwrap().writes
    }

    fn scripts(&self) -> Vec<String> {
        self.state.lock().unwrap().scripts.clone()
    }

    // Simulate an out-of-band edit on the device.
    fn set_field(&self, path: ResourcePath, name: &str, field: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(rows) = state.rows.get_mut(&path) {
            for row in rows {
                if row.get("name").map(String::as_str) == Some(name) {
                    row.insert(field.to_string(), value.to_string());
                }
            }
        }
    }
}

struct MockTransport(Arc<MockRouter>);

impl RouterTransport for MockTransport {
    fn list(&self, path: ResourcePath) -> Result<Vec<RouterEntry>, RouterError> {
        if let Some(gate) = &self.0.gate {
            gate.wait();
        }
        let state = self.0.state.lock().unwrap();
        if state.fail_connection {
            return Err(RouterError::ConnectionRefused(
                "mock router is down".to_string(),
            ));
        }
        match path {
            ResourcePath::SystemIdentity => {
                let mut row = RouterEntry::new();
                row.insert("name".to_string(), "mock-router".to_string());
                Ok(vec![row])
            }
            ResourcePath::SystemResource => {
                let mut row = RouterEntry::new();
                row.insert("version".to_string(), "7.14.2".to_string());
                Ok(vec![row])
            }
            _ => Ok(state.rows.get(&path).cloned().unwrap_or_default()),
        }
    }

    fn add(&self, path: ResourcePath, body: &RouterEntry) -> Result<RouterEntry, RouterError> {
        let mut state = self.0.state.lock().unwrap();
        state.writes += 1;
        state.next_id += 1;
        let mut entry = body.clone();
        entry.insert(".id".to_string(), format!("*{}", state.next_id));
        if path == ResourcePath::WireguardInterface {
            entry.insert("running".to_string(), "true".to_string());
        }
        state.rows.entry(path).or_default().push(entry.clone());
        Ok(entry)
    }

    fn update(&self, path: ResourcePath, id: &str, body: &RouterEntry) -> Result<(), RouterError> {
        let mut state = self.0.state.lock().unwrap();
        state.writes += 1;
        let rows = state.rows.entry(path).or_default();
        let row = rows
            .iter_mut()
            .find(|row| row.get(".id").map(String::as_str) == Some(id))
            .unwrap_or_else(|| panic!("update of unknown row {}", id));
        let comment = row.get("comment").cloned().unwrap_or_default();
        assert!(
            comment.starts_with(COMMENT_PREFIX),
            "engine updated a foreign resource: {:?}",
            row
        );
        for (key, value) in body {
            row.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn delete(&self, path: ResourcePath, id: &str) -> Result<(), RouterError> {
        let mut state = self.0.state.lock().unwrap();
        state.writes += 1;
        let rows = state.rows.entry(path).or_default();
        let index = rows
            .iter()
            .position(|row| row.get(".id").map(String::as_str) == Some(id))
            .unwrap_or_else(|| panic!("delete of unknown row {}", id));
        let comment = rows[index].get("comment").cloned().unwrap_or_default();
        assert!(
            comment.starts_with(COMMENT_PREFIX),
            "engine deleted a foreign resource: {:?}",
            rows[index]
        );
        rows.remove(index);
        Ok(())
    }

    fn run_script(&self, script: &str) -> Result<(), RouterError> {
        let mut state = self.0.state.lock().unwrap();
        state.writes += 1;
        state.scripts.push(script.to_string());
        Ok(())
    }
}

struct MockConnector(Arc<MockRouter>);

impl RouterConnector for MockConnector {
    fn connect(
        &self,
        _params: wirewan::routeros::RouterParams,
    ) -> Result<Box<dyn RouterTransport>, RouterError> {
        Ok(Box::new(MockTransport(self.0.clone())))
    }
}

// ----------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------

struct TestEnv {
    store: Arc<Store>,
    engine: Arc<DeployEngine>,
    envelope: Arc<SecretEnvelope>,
    wan: WanNetwork,
}

fn test_env(router: Arc<MockRouter>) -> TestEnv {
    let settings = Arc::new(Settings {
        encryption_key: Some("engine-test-key".to_string()),
        encryption_salt: Some("engine-test-salt".to_string()),
        ..Settings::default()
    });
    let envelope = Arc::new(SecretEnvelope::from_settings(&settings).unwrap());
    let store = Arc::new(Store::new());
    let engine = Arc::new(DeployEngine::new(
        store.clone(),
        settings,
        envelope.clone(),
        Arc::new(MockConnector(router)),
    ));
    let wan = store
        .create_wan(
            "engine-wan",
            None,
            "10.0.0.0/24".parse().unwrap(),
            "10.0.5.0/24".parse().unwrap(),
            TopologyType::Mesh,
        )
        .unwrap();
    TestEnv {
        store,
        engine,
        envelope,
        wan,
    }
}

fn managed_peer(env: &TestEnv, name: &str) -> wirewan::model::Peer {
    let keypair = KeyPair::generate();
    env.store
        .create_peer(NewPeer {
            wan_id: env.wan.id,
            name: name.to_string(),
            peer_type: PeerType::Mikrotik,
            public_key: Some(keypair.public.to_base64()),
            private_key_encrypted: Some(
                env.envelope.encrypt(&keypair.private.to_base64()).unwrap(),
            ),
            endpoint: None,
            listen_port: Some(51820),
            persistent_keepalive: None,
            managed: Some(ManagedDevice {
                management_ip: Some("192.0.2.10".to_string()),
                api_port: 443,
                auth_method: AuthMethod::Password,
                username: Some("admin".to_string()),
                password_encrypted: Some(env.envelope.encrypt("router-pass").unwrap()),
                ..ManagedDevice::default()
            }),
            subnets: Vec::new(),
        })
        .unwrap()
}

fn remote_peer(env: &TestEnv, name: &str, subnet: &str) -> wirewan::model::Peer {
    let keypair = KeyPair::generate();
    env.store
        .create_peer(NewPeer {
            wan_id: env.wan.id,
            name: name.to_string(),
            peer_type: PeerType::Server,
            public_key: Some(keypair.public.to_base64()),
            private_key_encrypted: None,
            endpoint: Some("203.0.113.5:51820".to_string()),
            listen_port: None,
            persistent_keepalive: None,
            managed: None,
            subnets: vec![NewSubnet {
                cidr: subnet.parse().unwrap(),
                is_routed: true,
                nat_enabled: false,
                nat_translated_cidr: None,
                description: None,
            }],
        })
        .unwrap()
}

async fn wait_terminal(store: &Store, job_id: uuid::Uuid) -> DeploymentJob {
    for _ in 0..500 {
        let job = store.get_job(job_id).unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached a terminal state");
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn convergent_apply_replaces_managed_and_spares_foreign() {
    let router = MockRouter::new();
    // A foreign firewall rule and a stale managed route are already on
    // the device.
    router.seed(
        ResourcePath::FirewallFilter,
        &[("chain", "input"), ("action", "drop"), ("comment", "operator rule")],
    );
    router.seed(
        ResourcePath::IpRoute,
        &[
            ("dst-address", "172.31.99.0/24"),
            ("gateway", "wg-wan-overlay"),
            ("comment", "WAN-Overlay-Manager:route-to-stale"),
        ],
    );

    let env = test_env(router.clone());
    let peer = managed_peer(&env, "edge-router");
    remote_peer(&env, "branch", "192.168.10.0/24");

    let job = env.engine.start_apply(peer.id, None).unwrap();
    let job = wait_terminal(&env.store, job.id).await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert_eq!(job.progress_percent, 100);

    // Backup captured the stale managed route before it was removed.
    let backup = job.backup_config.expect("backup captured");
    let backup_routes = backup["routes"].as_array().unwrap();
    assert!(backup_routes
        .iter()
        .any(|r| r["dst-address"] == "172.31.99.0/24"));

    // The stale managed route is gone, the desired set is present.
    let route_comments = router.comments(ResourcePath::IpRoute);
    assert!(!route_comments
        .iter()
        .any(|c| c.contains("route-to-stale")));
    assert!(route_comments
        .iter()
        .any(|c| c.contains("route-shared-services-")));
    let routes = router.rows(ResourcePath::IpRoute);
    assert!(routes
        .iter()
        .any(|r| r.get("dst-address").map(String::as_str) == Some("192.168.10.0/24")));

    // The foreign firewall rule survived untouched.
    let firewall = router.rows(ResourcePath::FirewallFilter);
    assert!(firewall
        .iter()
        .any(|r| r.get("comment").map(String::as_str) == Some("operator rule")));
    // And the managed accept rules exist alongside it.
    assert_eq!(
        firewall
            .iter()
            .filter(|r| r
                .get("comment")
                .map(|c| c.starts_with(COMMENT_PREFIX))
                .unwrap_or(false))
            .count(),
        3
    );

    // Peer observed state updated.
    let peer = env.store.get_peer(peer.id).unwrap();
    assert!(peer.is_online);
    let managed = peer.managed.unwrap();
    assert_eq!(managed.api_status, ApiStatus::Connected);
    assert_eq!(managed.router_identity.as_deref(), Some("mock-router"));

    // Every remote call was audited against the job.
    assert!(!env.store.api_logs_for_job(job.id).is_empty());
}

#[tokio::test]
async fn apply_then_verify_detects_external_drift() {
    let router = MockRouter::new();
    let env = test_env(router.clone());
    let peer = managed_peer(&env, "edge-router");

    let job = env.engine.start_apply(peer.id, None).unwrap();
    let job = wait_terminal(&env.store, job.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    // In sync right after apply.
    let report = env.engine.verify(peer.id).await.unwrap();
    assert!(report.in_sync, "unexpected issues: {:?}", report.issues);

    // Someone edits the managed interface's listen-port on the device.
    let writes_before = router.writes();
    router.set_field(
        ResourcePath::WireguardInterface,
        "wg-wan-overlay",
        "listen-port",
        "51999",
    );
    let report = env.engine.verify(peer.id).await.unwrap();
    assert!(!report.in_sync);
    assert!(report
        .issues
        .iter()
        .any(|i| i.contains("listen-port")), "issues: {:?}", report.issues);
    // Verify never writes.
    assert_eq!(router.writes(), writes_before);
}

#[tokio::test]
async fn clear_removes_managed_only_and_is_idempotent() {
    let router = MockRouter::new();
    router.seed(
        ResourcePath::FirewallNat,
        &[("chain", "dstnat"), ("comment", "operator nat")],
    );
    let env = test_env(router.clone());
    let peer = managed_peer(&env, "edge-router");

    let job = env.engine.start_apply(peer.id, None).unwrap();
    wait_terminal(&env.store, job.id).await;

    env.engine.clear(peer.id).await.unwrap();
    for path in [
        ResourcePath::WireguardInterface,
        ResourcePath::WireguardPeer,
        ResourcePath::IpAddress,
        ResourcePath::IpRoute,
        ResourcePath::FirewallFilter,
    ] {
        assert!(
            router
                .rows(path)
                .iter()
                .all(|r| !r.get("comment").map(|c| c.starts_with(COMMENT_PREFIX)).unwrap_or(false)),
            "managed rows left in {:?}",
            path
        );
    }
    // The foreign NAT rule is still there.
    assert!(router
        .rows(ResourcePath::FirewallNat)
        .iter()
        .any(|r| r.get("comment").map(String::as_str) == Some("operator nat")));

    // Clearing an already-clean router succeeds.
    env.engine.clear(peer.id).await.unwrap();
}

#[tokio::test]
async fn second_apply_is_rejected_while_first_is_active() {
    let gate = Arc::new(Gate::default());
    let router = MockRouter::gated(gate.clone());
    let env = test_env(router);
    let peer = managed_peer(&env, "edge-router");

    let first = env.engine.start_apply(peer.id, None).unwrap();
    // The worker is parked on the gate; a second apply must be refused.
    let second = env.engine.start_apply(peer.id, None);
    assert!(matches!(second, Err(WirewanError::Conflict(_))));

    gate.open();
    let job = wait_terminal(&env.store, first.id).await;
    assert_eq!(job.status, JobStatus::Completed);

    // Once terminal, a new apply may start.
    assert!(env.engine.start_apply(peer.id, None).is_ok());
}

#[tokio::test]
async fn cancelled_apply_stops_before_writing() {
    let gate = Arc::new(Gate::default());
    let router = MockRouter::gated(gate.clone());
    let env = test_env(router.clone());
    let peer = managed_peer(&env, "edge-router");

    let job = env.engine.start_apply(peer.id, None).unwrap();
    env.store.cancel_job(job.id).unwrap();
    gate.open();

    let job = wait_terminal(&env.store, job.id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    // The worker noticed at the next milestone boundary and never wrote.
    assert_eq!(router.writes(), 0);
}

#[tokio::test]
async fn failed_connection_fails_job_before_any_write() {
    let router = MockRouter::failing_connection();
    let env = test_env(router.clone());
    let peer = managed_peer(&env, "edge-router");

    let job = env.engine.start_apply(peer.id, None).unwrap();
    let job = wait_terminal(&env.store, job.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.is_some());
    assert!(job.backup_config.is_none());
    assert_eq!(router.writes(), 0);

    let peer = env.store.get_peer(peer.id).unwrap();
    assert_eq!(peer.managed.unwrap().api_status, ApiStatus::Unreachable);
}

#[tokio::test]
async fn plan_counts_create_and_delete_by_comment() {
    let router = MockRouter::new();
    router.seed(
        ResourcePath::IpRoute,
        &[
            ("dst-address", "172.31.99.0/24"),
            ("gateway", "wg-wan-overlay"),
            ("comment", "WAN-Overlay-Manager:route-to-stale"),
        ],
    );
    let env = test_env(router);
    let peer = managed_peer(&env, "edge-router");
    remote_peer(&env, "branch", "192.168.10.0/24");

    let plan = env.engine.plan(peer.id).await.unwrap();
    // Desired: one remote route plus the shared-services route; the stale
    // managed route must go.
    assert_eq!(plan.summary.routes.managed_desired, 2);
    assert_eq!(plan.summary.routes.to_create, 2);
    assert_eq!(plan.summary.routes.to_delete, 1);
    assert_eq!(plan.summary.peers.managed_desired, 1);
}

#[tokio::test]
async fn preflight_reports_foreign_collisions_without_writing() {
    let router = MockRouter::new();
    // Foreign interface with the same name, plus a foreign route to one of
    // the destinations the overlay wants to manage.
    router.seed(
        ResourcePath::WireguardInterface,
        &[("name", "wg-wan-overlay"), ("listen-port", "51820")],
    );
    router.seed(
        ResourcePath::IpRoute,
        &[("dst-address", "10.0.5.0/24"), ("gateway", "ether1")],
    );
    let env = test_env(router.clone());
    let peer = managed_peer(&env, "edge-router");

    let report = env.engine.preflight(peer.id).await.unwrap();
    assert!(!report.success);
    let kinds: Vec<&str> = report.issues.iter().map(|i| i.kind.as_str()).collect();
    assert!(kinds.contains(&"interface-name"));
    assert!(kinds.contains(&"route"));
    assert!(report.issues.iter().all(|i| !i.suggestions.is_empty()));
    assert_eq!(router.writes(), 0);
}

#[tokio::test]
async fn revert_requires_history_then_pushes_script() {
    let router = MockRouter::new();
    let env = test_env(router.clone());
    let peer = managed_peer(&env, "edge-router");

    // Nothing deployed yet: revert has nothing to push.
    assert!(matches!(
        env.engine.revert(peer.id).await,
        Err(WirewanError::NotFound(_))
    ));

    let job = env.engine.start_apply(peer.id, None).unwrap();
    wait_terminal(&env.store, job.id).await;

    env.engine.revert(peer.id).await.unwrap();
    let scripts = router.scripts();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("/interface wireguard"));
}

#[tokio::test]
async fn apply_refused_for_unmanaged_peer() {
    let env = test_env(MockRouter::new());
    let peer = remote_peer(&env, "plain-server", "192.168.20.0/24");
    assert!(matches!(
        env.engine.start_apply(peer.id, None),
        Err(WirewanError::Validation(_))
    ));
}
