//! TTL health registration for the worker and its hosts
//!
//! The worker registers one service for itself and one per provisioned host.
//! Each registration owns a renewal loop that refreshes its TTL check:
//!
//! ```text
//! register -> tick every interval -> update TTL with current health
//!                  ^                        |
//!                  |      check missing     v
//!                  +------- re-register ----+
//! ```
//!
//! - Worker health is `passing` only once the cluster shared secret has been
//!   read, so the worker check doubles as a readiness gate.
//! - Project health comes from a [`HealthCheckFn`] (normally a ping of the
//!   host's container engine) stored with the loop so self-healing can replay
//!   the same check after re-registering.
//!
//! Loops are tokio tasks with child [`CancellationToken`]s of the registry's
//! root token. Deregistering a project cancels its loop; [`HealthRegistry::shutdown`]
//! cancels all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::WorkerConfig;
use crate::driver::{ContainerHostDriver, DriverError};
use crate::metrics;
use crate::registry::{check_id, HealthStatus, RegistryClient, RegistryError, ServiceRegistration};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::secrets::{SecretError, SecretStore};

/// Service name of workers
pub const WORKER_SERVICE_NAME: &str = "windlass_worker";

/// Service name of provisioned hosts
pub const PROJECT_SERVICE_NAME: &str = "windlass_worker_projects";

/// Project TTL as a multiple of the worker TTL
pub const PROJECT_TTL_MULTIPLIER: u32 = 5;

/// Shared secret reads before giving up
pub const SHARED_SECRET_ATTEMPTS: u32 = 5;

/// Delay between shared secret reads
pub const SHARED_SECRET_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Bound on one engine ping
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on resolving a host's address during re-adoption
pub const ADOPTION_IP_TIMEOUT: Duration = Duration::from_secs(10);

/// Message reported for a reachable engine
pub const ENGINE_REACHABLE: &str = "Remote Docker daemon reachable";

/// Health registry errors
#[derive(Debug, Error)]
pub enum HealthError {
    /// Registry call failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The shared secret key is absent
    #[error("key {0} not set")]
    SecretNotSet(String),

    /// Stored project metadata could not be decoded or encoded
    #[error("invalid project metadata: {0}")]
    Metadata(String),

    /// Driver call failed during re-adoption
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Secret store call failed during re-adoption
    #[error(transparent)]
    Secret(#[from] SecretError),
}

impl From<HealthError> for crate::Error {
    fn from(e: HealthError) -> Self {
        match e {
            HealthError::Registry(RegistryError::Http(_)) | HealthError::SecretNotSet(_) => {
                crate::Error::transient(e.to_string())
            }
            other => crate::Error::internal(other.to_string()),
        }
    }
}

/// Kind of TTL registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// The worker itself
    Worker,
    /// A provisioned host
    Project,
}

impl ServiceKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Worker => "worker",
            ServiceKind::Project => "project",
        }
    }

    /// TTL of this kind of check given the worker TTL
    pub fn ttl(&self, worker_ttl: Duration) -> Duration {
        match self {
            ServiceKind::Worker => worker_ttl,
            ServiceKind::Project => worker_ttl * PROJECT_TTL_MULTIPLIER,
        }
    }

    /// Renewal period: half of this kind's TTL
    pub fn renewal_interval(&self, worker_ttl: Duration) -> Duration {
        match self {
            ServiceKind::Worker => worker_ttl / 2,
            ServiceKind::Project => (worker_ttl * PROJECT_TTL_MULTIPLIER) / 2,
        }
    }
}

/// Metadata persisted per project in the registry KV store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    /// Project (host) ID
    pub id: String,
    /// Host address at registration time
    pub ip_address: String,
}

/// Result of one health check run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Output attached to the TTL update
    pub message: String,
    /// Whether the check passed
    pub healthy: bool,
}

impl CheckOutcome {
    /// A passing outcome
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            healthy: true,
        }
    }

    /// A failing outcome
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            healthy: false,
        }
    }
}

/// Health check run on each project renewal tick, given the host's address
pub type HealthCheckFn = Arc<dyn Fn(&str) -> BoxFuture<'static, CheckOutcome> + Send + Sync>;

/// Check that pings a host's container engine through the driver
pub fn ping_check(driver: Arc<dyn ContainerHostDriver>, host: impl Into<String>) -> HealthCheckFn {
    let host = host.into();
    Arc::new(move |_ip: &str| -> BoxFuture<'static, CheckOutcome> {
        let driver = driver.clone();
        let host = host.clone();
        Box::pin(async move {
            match tokio::time::timeout(PING_TIMEOUT, driver.ping(&host)).await {
                Ok(Ok(())) => CheckOutcome::healthy(ENGINE_REACHABLE),
                Ok(Err(e)) => CheckOutcome::unhealthy(e.to_string()),
                Err(_) => CheckOutcome::unhealthy(format!(
                    "ping timed out after {}s",
                    PING_TIMEOUT.as_secs()
                )),
            }
        })
    })
}

/// Settings of the health registry
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Worker service ID, also the KV prefix of project metadata
    pub worker_id: String,
    /// Address advertised for the worker service
    pub advertise_address: String,
    /// Port advertised for the worker service
    pub port: u16,
    /// Worker TTL; projects use [`PROJECT_TTL_MULTIPLIER`] times this
    pub worker_ttl: Duration,
    /// Port advertised for project services
    pub engine_port: u16,
    /// KV key of the cluster shared secret
    pub shared_secret_key: String,
    /// Retry policy of the shared secret read
    pub secret_retry: RetryConfig,
}

impl HealthConfig {
    /// Build from worker settings
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id(),
            advertise_address: config.resolved_advertise_address(),
            port: config.port,
            worker_ttl: config.worker_ttl(),
            engine_port: config.engine_port,
            shared_secret_key: config.shared_secret_key(),
            secret_retry: RetryConfig::fixed(SHARED_SECRET_ATTEMPTS, SHARED_SECRET_RETRY_DELAY),
        }
    }

    /// TTL of project checks
    pub fn project_ttl(&self) -> Duration {
        ServiceKind::Project.ttl(self.worker_ttl)
    }

    /// KV key of a project's metadata
    pub fn metadata_key(&self, id: &str) -> String {
        format!("{}/{}", self.worker_id, id)
    }
}

/// Snapshot of one active registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    /// Service ID
    pub service_id: String,
    /// Worker or project
    pub kind: ServiceKind,
    /// Check TTL
    pub ttl: Duration,
    /// Renewal period
    pub renewal_interval: Duration,
    /// Last renewal error, cleared on success
    pub last_error: Option<String>,
}

/// Outcome of resuming health checks for stored projects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdoptionReport {
    /// Projects whose checks resumed
    pub adopted: usize,
    /// Projects skipped because of an error
    pub failed: usize,
}

struct ProjectEntry {
    ip: String,
    cancel: CancellationToken,
    last_error: Option<String>,
}

struct WorkerEntry {
    cancel: CancellationToken,
    last_error: Option<String>,
}

struct Inner {
    config: HealthConfig,
    registry: Arc<dyn RegistryClient>,
    driver: Arc<dyn ContainerHostDriver>,
    secrets: Arc<dyn SecretStore>,
    shared_secret: RwLock<Option<Zeroizing<String>>>,
    projects: Mutex<HashMap<String, ProjectEntry>>,
    worker: Mutex<Option<WorkerEntry>>,
    metadata_lock: Mutex<()>,
    root: CancellationToken,
}

/// Worker and project TTL registrations
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Inner>,
}

impl HealthRegistry {
    /// Create a registry; nothing is registered until [`HealthRegistry::register`]
    pub fn new(
        config: HealthConfig,
        registry: Arc<dyn RegistryClient>,
        driver: Arc<dyn ContainerHostDriver>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                driver,
                secrets,
                shared_secret: RwLock::new(None),
                projects: Mutex::new(HashMap::new()),
                worker: Mutex::new(None),
                metadata_lock: Mutex::new(()),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Registry settings
    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Register the worker, resume checks for stored projects, start the worker loop
    pub async fn register(&self) -> Result<AdoptionReport, HealthError> {
        self.register_worker().await?;
        let report = self.adopt_projects().await?;
        self.inner.clone().start_worker_loop().await;
        info!(
            worker = %self.inner.config.worker_id,
            adopted = report.adopted,
            failed = report.failed,
            "Worker registered"
        );
        Ok(report)
    }

    /// Register (or re-register) the worker service
    pub async fn register_worker(&self) -> Result<(), HealthError> {
        self.inner.register_worker().await
    }

    /// Resume health checks for every project stored under this worker's KV prefix
    ///
    /// Entries that cannot be decoded, resolved or authenticated are logged
    /// and skipped.
    pub async fn adopt_projects(&self) -> Result<AdoptionReport, HealthError> {
        let prefix = format!("{}/", self.inner.config.worker_id);
        let entries = self.inner.registry.kv_list(&prefix).await?;

        let mut report = AdoptionReport::default();
        for entry in entries {
            let fallback = entry
                .key
                .strip_prefix(&prefix)
                .unwrap_or(&entry.key)
                .trim_end_matches('/')
                .to_string();
            match self.adopt_project(&fallback, &entry.value).await {
                Ok(id) => {
                    info!(project = %id, "Resumed project health check");
                    report.adopted += 1;
                }
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "Skipping stored project");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn adopt_project(&self, key_name: &str, value: &[u8]) -> Result<String, HealthError> {
        let meta: ProjectMetadata =
            serde_json::from_slice(value).map_err(|e| HealthError::Metadata(e.to_string()))?;
        let id = if meta.id.is_empty() {
            key_name.to_string()
        } else {
            meta.id
        };

        let driver = self.inner.driver.clone();
        let ip = tokio::time::timeout(ADOPTION_IP_TIMEOUT, driver.get_container_host_ip(&id))
            .await
            .map_err(|_| DriverError::DeadlineExceeded(format!("resolving address of {}", id)))??;

        let secret = self.inner.secrets.get(&id).await?;
        driver.use_certs(&id, secret.client_credentials()).await?;

        self.register_project(&id, &ip, ping_check(driver, id.clone()))
            .await?;
        Ok(id)
    }

    /// Register a project service, persist its metadata and start its renewal loop
    ///
    /// An existing loop for the same ID is cancelled first.
    pub async fn register_project(
        &self,
        id: &str,
        ip: &str,
        check: HealthCheckFn,
    ) -> Result<(), HealthError> {
        self.inner.register_project_service(id, ip).await?;
        self.inner.clone().start_project_loop(id, ip, check).await;
        info!(project = %id, ip = %ip, "Project registered");
        Ok(())
    }

    /// Stop a project's renewal loop, deregister it and delete its metadata
    pub async fn deregister_project(&self, id: &str) -> Result<(), HealthError> {
        if let Some(entry) = self.inner.projects.lock().await.remove(id) {
            entry.cancel.cancel();
        }
        self.inner.registry.deregister_service(id).await?;
        {
            let _guard = self.inner.metadata_lock.lock().await;
            self.inner
                .registry
                .kv_delete(&self.inner.config.metadata_key(id))
                .await?;
        }
        info!(project = %id, "Project deregistered");
        Ok(())
    }

    /// Read the cluster shared secret, retrying on a fixed schedule
    ///
    /// Gives up after [`SHARED_SECRET_ATTEMPTS`] reads and returns the last
    /// error; the caller retries the whole bootstrap.
    pub async fn get_and_set_shared_secret(&self) -> Result<(), HealthError> {
        let inner = &self.inner;
        let key = inner.config.shared_secret_key.as_str();

        let value = retry_with_backoff(&inner.config.secret_retry, "get_shared_secret", || async move {
            let result = inner.registry.kv_get(key).await;
            metrics::record_secret_fetch(matches!(result, Ok(Some(_))));
            match result {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(HealthError::SecretNotSet(key.to_string())),
                Err(e) => Err(HealthError::from(e)),
            }
        })
        .await?;

        let secret = String::from_utf8(value)
            .map_err(|e| HealthError::Metadata(format!("shared secret is not UTF-8: {}", e)))?;
        *inner.shared_secret.write().await =
            Some(Zeroizing::new(secret.trim_end_matches(['\r', '\n']).to_string()));
        info!("Shared secret loaded");
        Ok(())
    }

    /// The cluster shared secret, once bootstrapped
    pub async fn shared_secret(&self) -> Option<Zeroizing<String>> {
        self.inner.shared_secret.read().await.clone()
    }

    /// Whether a renewal loop is active for the project
    pub async fn has_project(&self, id: &str) -> bool {
        self.inner.projects.lock().await.contains_key(id)
    }

    /// Snapshot of all active registrations
    pub async fn registrations(&self) -> Vec<RegistrationInfo> {
        let worker_ttl = self.inner.config.worker_ttl;
        let mut infos = Vec::new();

        if let Some(worker) = self.inner.worker.lock().await.as_ref() {
            infos.push(RegistrationInfo {
                service_id: self.inner.config.worker_id.clone(),
                kind: ServiceKind::Worker,
                ttl: ServiceKind::Worker.ttl(worker_ttl),
                renewal_interval: ServiceKind::Worker.renewal_interval(worker_ttl),
                last_error: worker.last_error.clone(),
            });
        }

        let projects = self.inner.projects.lock().await;
        let mut ids: Vec<&String> = projects.keys().collect();
        ids.sort();
        for id in ids {
            infos.push(RegistrationInfo {
                service_id: id.clone(),
                kind: ServiceKind::Project,
                ttl: ServiceKind::Project.ttl(worker_ttl),
                renewal_interval: ServiceKind::Project.renewal_interval(worker_ttl),
                last_error: projects[id].last_error.clone(),
            });
        }
        infos
    }

    /// Cancel every renewal loop
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.projects.lock().await.clear();
        self.inner.worker.lock().await.take();
        info!("Health registry stopped");
    }
}

impl Inner {
    fn worker_registration(&self) -> ServiceRegistration {
        ServiceRegistration {
            id: self.config.worker_id.clone(),
            name: WORKER_SERVICE_NAME.to_string(),
            tags: Vec::new(),
            address: self.config.advertise_address.clone(),
            port: self.config.port,
            ttl: ServiceKind::Worker.ttl(self.config.worker_ttl),
        }
    }

    fn project_registration(&self, id: &str, ip: &str) -> ServiceRegistration {
        ServiceRegistration {
            id: id.to_string(),
            name: PROJECT_SERVICE_NAME.to_string(),
            tags: vec![format!("worker:{}", self.config.worker_id)],
            address: ip.to_string(),
            port: self.config.engine_port,
            ttl: self.config.project_ttl(),
        }
    }

    async fn register_worker(&self) -> Result<(), HealthError> {
        self.registry
            .register_service(&self.worker_registration())
            .await?;
        Ok(())
    }

    /// Service registration plus metadata write, without touching the loop
    async fn register_project_service(&self, id: &str, ip: &str) -> Result<(), HealthError> {
        self.registry
            .register_service(&self.project_registration(id, ip))
            .await?;

        let bytes = metadata_bytes(id, ip)?;
        let _guard = self.metadata_lock.lock().await;
        self.registry
            .kv_put(&self.config.metadata_key(id), &bytes)
            .await?;
        Ok(())
    }

    async fn start_worker_loop(self: Arc<Self>) {
        let cancel = self.root.child_token();
        {
            let mut worker = self.worker.lock().await;
            if let Some(previous) = worker.take() {
                previous.cancel.cancel();
            }
            *worker = Some(WorkerEntry {
                cancel: cancel.clone(),
                last_error: None,
            });
        }
        tokio::spawn(self.run_worker_loop(cancel));
    }

    async fn run_worker_loop(self: Arc<Self>, cancel: CancellationToken) {
        let period = ServiceKind::Worker.renewal_interval(self.config.worker_ttl);
        let check = check_id(&self.config.worker_id);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let status = if self.shared_secret.read().await.is_some() {
                HealthStatus::Passing
            } else {
                HealthStatus::Critical
            };

            let result = self.registry.update_ttl(&check, "", status).await;
            let last_error = match result {
                Ok(()) => {
                    debug!(status = %status, "Worker TTL updated");
                    metrics::record_ttl_update(ServiceKind::Worker.as_str(), status.as_str());
                    None
                }
                Err(e) if e.is_check_missing() => {
                    warn!(error = %e, "Worker check missing, re-registering");
                    metrics::record_reregistration(ServiceKind::Worker.as_str());
                    match self.register_worker().await {
                        Ok(()) => None,
                        Err(e) => {
                            error!(error = %e, "Failed to re-register worker");
                            Some(e.to_string())
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to update worker TTL");
                    metrics::record_ttl_update(ServiceKind::Worker.as_str(), "error");
                    Some(e.to_string())
                }
            };

            if let Some(worker) = self.worker.lock().await.as_mut() {
                worker.last_error = last_error;
            }
        }
        debug!("Worker renewal loop stopped");
    }

    async fn start_project_loop(self: Arc<Self>, id: &str, ip: &str, check: HealthCheckFn) {
        let cancel = self.root.child_token();
        {
            let mut projects = self.projects.lock().await;
            if let Some(previous) = projects.remove(id) {
                previous.cancel.cancel();
            }
            projects.insert(
                id.to_string(),
                ProjectEntry {
                    ip: ip.to_string(),
                    cancel: cancel.clone(),
                    last_error: None,
                },
            );
        }
        tokio::spawn(self.run_project_loop(id.to_string(), ip.to_string(), check, cancel));
    }

    async fn run_project_loop(
        self: Arc<Self>,
        id: String,
        ip: String,
        check: HealthCheckFn,
        cancel: CancellationToken,
    ) {
        let period = ServiceKind::Project.renewal_interval(self.config.worker_ttl);
        let check_id = check_id(&id);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = check(ip.as_str()) => outcome,
            };
            let status = if outcome.healthy {
                HealthStatus::Passing
            } else {
                HealthStatus::Critical
            };
            debug!(
                project = %id,
                healthy = outcome.healthy,
                msg = %outcome.message,
                "Engine health check"
            );

            let result = self
                .registry
                .update_ttl(&check_id, &outcome.message, status)
                .await;
            let last_error = match result {
                Ok(()) => {
                    metrics::record_ttl_update(ServiceKind::Project.as_str(), status.as_str());
                    None
                }
                Err(e) if e.is_check_missing() => {
                    warn!(project = %id, error = %e, "Project check missing, re-registering");
                    metrics::record_reregistration(ServiceKind::Project.as_str());
                    self.reregister_project(&id, &cancel).await.err().map(|e| {
                        error!(project = %id, error = %e, "Failed to re-register project");
                        e.to_string()
                    })
                }
                Err(e) => {
                    warn!(project = %id, error = %e, "Failed to update project TTL");
                    metrics::record_ttl_update(ServiceKind::Project.as_str(), "error");
                    Some(e.to_string())
                }
            };

            if let Some(entry) = self.projects.lock().await.get_mut(&id) {
                entry.last_error = last_error;
            }
        }
        debug!(project = %id, "Project renewal loop stopped");
    }

    /// Replay the stored registration of a project whose check went missing
    ///
    /// A deregistration racing with the replay wins: if the loop was
    /// cancelled while the service was being registered, the service is
    /// removed again and no metadata is written.
    async fn reregister_project(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), HealthError> {
        let ip = match self.projects.lock().await.get(id) {
            Some(entry) if !cancel.is_cancelled() => entry.ip.clone(),
            _ => return Ok(()),
        };
        self.registry
            .register_service(&self.project_registration(id, &ip))
            .await?;

        let bytes = metadata_bytes(id, &ip)?;
        {
            // deregister_project cancels before deleting under this lock
            let _guard = self.metadata_lock.lock().await;
            if !cancel.is_cancelled() {
                self.registry
                    .kv_put(&self.config.metadata_key(id), &bytes)
                    .await?;
                info!(project = %id, "Project re-registered");
                return Ok(());
            }
        }

        debug!(project = %id, "Project deregistered during re-registration, undoing");
        self.registry.deregister_service(id).await?;
        Ok(())
    }
}

fn metadata_bytes(id: &str, ip: &str) -> Result<Vec<u8>, HealthError> {
    let meta = ProjectMetadata {
        id: id.to_string(),
        ip_address: ip.to_string(),
    };
    serde_json::to_vec(&meta).map_err(|e| HealthError::Metadata(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::driver::MockContainerHostDriver;
    use crate::registry::MockRegistryClient;
    use crate::secrets::{MockSecretStore, TlsSecret};

    const WORKER_ID: &str = "windlass-worker@node1:9786";

    fn config() -> HealthConfig {
        HealthConfig {
            worker_id: WORKER_ID.to_string(),
            advertise_address: "node1".to_string(),
            port: 9786,
            worker_ttl: Duration::from_secs(10),
            engine_port: 443,
            shared_secret_key: "windlass/secret".to_string(),
            secret_retry: RetryConfig::fixed(SHARED_SECRET_ATTEMPTS, SHARED_SECRET_RETRY_DELAY),
        }
    }

    fn health(registry: MockRegistryClient) -> HealthRegistry {
        HealthRegistry::new(
            config(),
            Arc::new(registry),
            Arc::new(MockContainerHostDriver::new()),
            Arc::new(MockSecretStore::new()),
        )
    }

    fn counting_check(count: Arc<AtomicU32>) -> HealthCheckFn {
        Arc::new(move |_ip: &str| -> BoxFuture<'static, CheckOutcome> {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                CheckOutcome::healthy(ENGINE_REACHABLE)
            })
        })
    }

    fn tls_secret() -> TlsSecret {
        let bundle = crate::pki::PkiIssuer::new().issue("10.0.0.5").unwrap();
        TlsSecret::from(&bundle)
    }

    #[test]
    fn renewal_intervals_are_half_the_ttl() {
        let worker_ttl = Duration::from_secs(10);
        assert_eq!(ServiceKind::Worker.ttl(worker_ttl), Duration::from_secs(10));
        assert_eq!(
            ServiceKind::Worker.renewal_interval(worker_ttl),
            Duration::from_secs(5)
        );
        assert_eq!(ServiceKind::Project.ttl(worker_ttl), Duration::from_secs(50));
        assert_eq!(
            ServiceKind::Project.renewal_interval(worker_ttl),
            Duration::from_secs(25)
        );
    }

    #[test]
    fn metadata_serializes_with_wire_field_names() {
        let meta = ProjectMetadata {
            id: "acme-web".to_string(),
            ip_address: "10.0.0.5".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&meta).unwrap(),
            r#"{"id":"acme-web","ip_address":"10.0.0.5"}"#
        );
        assert_eq!(
            config().metadata_key("acme-web"),
            "windlass-worker@node1:9786/acme-web"
        );
    }

    /// Story: the secret was never written to the KV store; the worker gives
    /// up after five reads three seconds apart and never tries a sixth time
    #[tokio::test(start_paused = true)]
    async fn story_shared_secret_bootstrap_gives_up_after_five_reads() {
        let mut registry = MockRegistryClient::new();
        registry
            .expect_kv_get()
            .withf(|key| key == "windlass/secret")
            .times(5)
            .returning(|_| Ok(None));
        let health = health(registry);

        let start = Instant::now();
        let result = health.get_and_set_shared_secret().await;

        assert!(matches!(result, Err(HealthError::SecretNotSet(key)) if key == "windlass/secret"));
        assert_eq!(start.elapsed(), Duration::from_secs(12));
        assert!(health.shared_secret().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_secret_is_cached_once_read() {
        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();
        let mut registry = MockRegistryClient::new();
        registry.expect_kv_get().times(2).returning(move |_| {
            if r.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RegistryError::Http("connection refused".into()))
            } else {
                Ok(Some(b"s3cret\n".to_vec()))
            }
        });
        let health = health(registry);

        health.get_and_set_shared_secret().await.unwrap();
        assert_eq!(health.shared_secret().await.unwrap().as_str(), "s3cret");
    }

    /// Story: the worker reports critical until the secret arrives, then passing
    #[tokio::test(start_paused = true)]
    async fn story_worker_health_follows_secret_bootstrap() {
        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = statuses.clone();

        let mut registry = MockRegistryClient::new();
        registry
            .expect_register_service()
            .withf(|reg| reg.id == WORKER_ID && reg.name == WORKER_SERVICE_NAME)
            .times(1)
            .returning(|_| Ok(()));
        registry.expect_kv_list().returning(|_| Ok(Vec::new()));
        registry
            .expect_update_ttl()
            .withf(|check, _, _| check == "service:windlass-worker@node1:9786")
            .returning(move |_, _, status| {
                s.lock().unwrap().push(status);
                Ok(())
            });
        registry
            .expect_kv_get()
            .returning(|_| Ok(Some(b"s3cret".to_vec())));
        let health = health(registry);

        let report = health.register().await.unwrap();
        assert_eq!(report, AdoptionReport::default());

        // First tick comes one interval after registration
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(statuses.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        health.get_and_set_shared_secret().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![HealthStatus::Critical, HealthStatus::Passing]
        );
        health.shutdown().await;
    }

    /// Story: the registry agent restarts and forgets the worker's check; the
    /// next renewal re-registers the worker and the one after renews normally
    #[tokio::test(start_paused = true)]
    async fn story_missing_worker_check_is_reregistered() {
        let registrations = Arc::new(AtomicU32::new(0));
        let r = registrations.clone();
        let updates = Arc::new(AtomicU32::new(0));
        let u = updates.clone();

        let mut registry = MockRegistryClient::new();
        registry
            .expect_register_service()
            .withf(|reg| reg.id == WORKER_ID && reg.name == WORKER_SERVICE_NAME)
            .times(2)
            .returning(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        registry.expect_kv_list().returning(|_| Ok(Vec::new()));
        registry
            .expect_update_ttl()
            .withf(|check, _, _| check == "service:windlass-worker@node1:9786")
            .returning(move |check, _, _| {
                if u.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RegistryError::CheckMissing(check.to_string()))
                } else {
                    Ok(())
                }
            });
        let health = health(registry);

        health.register().await.unwrap();
        assert_eq!(registrations.load(Ordering::SeqCst), 1);

        // First renewal at 5s finds the check gone
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(registrations.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(updates.load(Ordering::SeqCst), 2);
        assert_eq!(registrations.load(Ordering::SeqCst), 2);

        let infos = health.registrations().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].kind, ServiceKind::Worker);
        assert_eq!(infos[0].last_error, None);
        health.shutdown().await;
    }

    /// Story: the registry agent restarts and forgets the project's check.
    /// The loop re-registers exactly once and keeps using the original check.
    #[tokio::test(start_paused = true)]
    async fn story_missing_project_check_is_reregistered_once() {
        let updates = Arc::new(AtomicU32::new(0));
        let u = updates.clone();

        let mut registry = MockRegistryClient::new();
        // initial registration + one re-registration
        registry
            .expect_register_service()
            .withf(|reg| {
                reg.id == "acme-web"
                    && reg.name == PROJECT_SERVICE_NAME
                    && reg.ttl == Duration::from_secs(50)
                    && reg.tags == vec![format!("worker:{}", WORKER_ID)]
            })
            .times(2)
            .returning(|_| Ok(()));
        registry
            .expect_kv_put()
            .withf(|key, value| {
                key == "windlass-worker@node1:9786/acme-web"
                    && value == br#"{"id":"acme-web","ip_address":"10.0.0.5"}"#
            })
            .times(2)
            .returning(|_, _| Ok(()));
        registry
            .expect_update_ttl()
            .withf(|check, msg, status| {
                check == "service:acme-web"
                    && msg == ENGINE_REACHABLE
                    && *status == HealthStatus::Passing
            })
            .returning(move |check, _, _| {
                if u.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RegistryError::CheckMissing(check.to_string()))
                } else {
                    Ok(())
                }
            });
        let health = health(registry);

        let checks = Arc::new(AtomicU32::new(0));
        health
            .register_project("acme-web", "10.0.0.5", counting_check(checks.clone()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(25 * 3 + 1)).await;

        assert_eq!(checks.load(Ordering::SeqCst), 3);
        assert_eq!(updates.load(Ordering::SeqCst), 3);
        let infos = health.registrations().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].renewal_interval, Duration::from_secs(25));
        assert_eq!(infos[0].last_error, None);
        health.shutdown().await;
    }

    /// Story: the project is torn down while its loop is replaying the
    /// registration; the teardown wins and no metadata is written back
    #[tokio::test(start_paused = true)]
    async fn story_reregistration_racing_teardown_is_undone() {
        let loop_cancel = CancellationToken::new();
        let teardown = loop_cancel.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut registry = MockRegistryClient::new();
        registry
            .expect_register_service()
            .withf(|reg| reg.id == "acme-web")
            .times(2)
            .returning(move |_| {
                // deregistration lands while the replay is in flight
                if c.fetch_add(1, Ordering::SeqCst) == 1 {
                    teardown.cancel();
                }
                Ok(())
            });
        // only the initial registration writes metadata
        registry.expect_kv_put().times(1).returning(|_, _| Ok(()));
        registry
            .expect_deregister_service()
            .withf(|id| id == "acme-web")
            .times(1)
            .returning(|_| Ok(()));
        registry.expect_update_ttl().returning(|_, _, _| Ok(()));
        let health = health(registry);

        health
            .register_project("acme-web", "10.0.0.5", counting_check(Arc::new(AtomicU32::new(0))))
            .await
            .unwrap();

        health
            .inner
            .reregister_project("acme-web", &loop_cancel)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        health.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_failure_is_recorded_and_loop_continues() {
        let mut registry = MockRegistryClient::new();
        registry.expect_register_service().returning(|_| Ok(()));
        registry.expect_kv_put().returning(|_, _| Ok(()));
        registry
            .expect_update_ttl()
            .returning(|_, _, _| Err(RegistryError::Http("connection refused".into())));
        let health = health(registry);

        let checks = Arc::new(AtomicU32::new(0));
        health
            .register_project("acme-web", "10.0.0.5", counting_check(checks.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(51)).await;

        assert_eq!(checks.load(Ordering::SeqCst), 2);
        let infos = health.registrations().await;
        assert!(infos[0].last_error.as_deref().unwrap().contains("refused"));
        health.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deregistration_stops_the_loop_and_removes_metadata() {
        let mut registry = MockRegistryClient::new();
        registry.expect_register_service().returning(|_| Ok(()));
        registry.expect_kv_put().returning(|_, _| Ok(()));
        registry
            .expect_deregister_service()
            .withf(|id| id == "acme-web")
            .times(1)
            .returning(|_| Ok(()));
        registry
            .expect_kv_delete()
            .withf(|key| key == "windlass-worker@node1:9786/acme-web")
            .times(1)
            .returning(|_| Ok(()));
        registry.expect_update_ttl().never();
        let health = health(registry);

        let checks = Arc::new(AtomicU32::new(0));
        health
            .register_project("acme-web", "10.0.0.5", counting_check(checks.clone()))
            .await
            .unwrap();
        assert!(health.has_project("acme-web").await);

        health.deregister_project("acme-web").await.unwrap();
        assert!(!health.has_project("acme-web").await);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_a_project_replaces_its_loop() {
        let mut registry = MockRegistryClient::new();
        registry.expect_register_service().returning(|_| Ok(()));
        registry.expect_kv_put().returning(|_, _| Ok(()));
        registry.expect_update_ttl().returning(|_, _, _| Ok(()));
        let health = health(registry);

        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        health
            .register_project("acme-web", "10.0.0.5", counting_check(first.clone()))
            .await
            .unwrap();
        health
            .register_project("acme-web", "10.0.0.6", counting_check(second.clone()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        health.shutdown().await;
    }

    /// Story: the worker restarts with two stored projects, one of which has
    /// lost its credentials; the healthy one is adopted, the other skipped
    #[tokio::test(start_paused = true)]
    async fn story_restart_adopts_stored_projects_and_skips_broken_ones() {
        let mut registry = MockRegistryClient::new();
        registry.expect_kv_list().returning(|prefix| {
            assert_eq!(prefix, "windlass-worker@node1:9786/");
            Ok(vec![
                crate::registry::KvEntry {
                    key: "windlass-worker@node1:9786/acme-web".into(),
                    value: br#"{"id":"acme-web","ip_address":"10.0.0.5"}"#.to_vec(),
                },
                crate::registry::KvEntry {
                    key: "windlass-worker@node1:9786/acme-api".into(),
                    value: br#"{"id":"acme-api","ip_address":"10.0.0.6"}"#.to_vec(),
                },
                crate::registry::KvEntry {
                    key: "windlass-worker@node1:9786/garbage".into(),
                    value: b"not json".to_vec(),
                },
            ])
        });
        registry
            .expect_register_service()
            .withf(|reg| reg.id == "acme-web" && reg.address == "10.0.0.7")
            .times(1)
            .returning(|_| Ok(()));
        registry.expect_kv_put().times(1).returning(|_, _| Ok(()));

        let mut driver = MockContainerHostDriver::new();
        driver
            .expect_get_container_host_ip()
            .returning(|name| match name {
                "acme-web" => Ok("10.0.0.7".to_string()),
                _ => Ok("10.0.0.6".to_string()),
            });
        driver
            .expect_use_certs()
            .withf(|name, _| name == "acme-web")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut secrets = MockSecretStore::new();
        let secret = tls_secret();
        secrets.expect_get().returning(move |key| match key {
            "acme-web" => Ok(secret.clone()),
            other => Err(SecretError::NotFound(other.to_string())),
        });

        let health = HealthRegistry::new(
            config(),
            Arc::new(registry),
            Arc::new(driver),
            Arc::new(secrets),
        );

        let report = health.adopt_projects().await.unwrap();
        assert_eq!(report, AdoptionReport { adopted: 1, failed: 2 });
        assert!(health.has_project("acme-web").await);
        assert!(!health.has_project("acme-api").await);
        health.shutdown().await;
    }

    #[tokio::test]
    async fn ping_check_reports_engine_reachability() {
        let mut driver = MockContainerHostDriver::new();
        driver.expect_ping().returning(|name| match name {
            "acme-web" => Ok(()),
            other => Err(DriverError::NoIdentity(other.to_string())),
        });
        let driver: Arc<dyn ContainerHostDriver> = Arc::new(driver);

        let ok = ping_check(driver.clone(), "acme-web")("10.0.0.5").await;
        assert_eq!(ok, CheckOutcome::healthy(ENGINE_REACHABLE));

        let bad = ping_check(driver, "acme-api")("10.0.0.6").await;
        assert!(!bad.healthy);
        assert!(bad.message.contains("acme-api"));
    }

    #[test]
    fn transport_failures_map_to_transient_errors() {
        let err: crate::Error = HealthError::Registry(RegistryError::Http("refused".into())).into();
        assert!(matches!(err, crate::Error::Transient(_)));
        let err: crate::Error = HealthError::Metadata("bad".into()).into();
        assert!(matches!(err, crate::Error::Internal(_)));
    }
}
