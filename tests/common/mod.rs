//! In-memory collaborators for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use windlass::driver::{ClientCredentials, ContainerHostDriver, DriverError};
use windlass::health::{HealthConfig, HealthRegistry};
use windlass::provision::ProvisioningOrchestrator;
use windlass::registry::{
    check_id, HealthStatus, KvEntry, RegistryClient, RegistryError, ServiceRegistration,
};
use windlass::retry::RetryConfig;
use windlass::secrets::{SecretError, SecretStore, TlsSecret};

pub const WORKER_ID: &str = "windlass-worker@node1:9786";
pub const WORKER_TTL: Duration = Duration::from_secs(10);

/// Registry agent keeping services and KV entries in memory
#[derive(Default)]
pub struct FakeRegistry {
    pub services: Mutex<HashMap<String, ServiceRegistration>>,
    pub registrations: Mutex<Vec<String>>,
    pub ttl_updates: Mutex<Vec<(String, String, HealthStatus)>>,
    pub kv: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FakeRegistry {
    /// Forget every service, as a restarted agent would
    pub fn restart_agent(&self) {
        self.services.lock().unwrap().clear();
    }

    pub fn service(&self, id: &str) -> Option<ServiceRegistration> {
        self.services.lock().unwrap().get(id).cloned()
    }

    pub fn registration_count(&self, id: &str) -> usize {
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.as_str() == id)
            .count()
    }

    pub fn kv_value(&self, key: &str) -> Option<Vec<u8>> {
        self.kv.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), RegistryError> {
        self.services
            .lock()
            .unwrap()
            .insert(registration.id.clone(), registration.clone());
        self.registrations.lock().unwrap().push(registration.id.clone());
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), RegistryError> {
        self.services.lock().unwrap().remove(service_id);
        Ok(())
    }

    async fn update_ttl(
        &self,
        check: &str,
        output: &str,
        status: HealthStatus,
    ) -> Result<(), RegistryError> {
        let known = self
            .services
            .lock()
            .unwrap()
            .keys()
            .any(|id| check_id(id) == check);
        if !known {
            return Err(RegistryError::CheckMissing(check.to_string()));
        }
        self.ttl_updates
            .lock()
            .unwrap()
            .push((check.to_string(), output.to_string(), status));
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, RegistryError> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn kv_list(&self, prefix: &str) -> Result<Vec<KvEntry>, RegistryError> {
        Ok(self
            .kv
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn kv_delete(&self, key: &str) -> Result<(), RegistryError> {
        self.kv.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Driver whose hosts get `ip` on the second address poll
pub struct FakeDriver {
    pub ip: String,
    pub hosts: Mutex<HashSet<String>>,
    pub polls: Mutex<HashMap<String, u32>>,
    pub pushed: Mutex<HashMap<String, (String, String, String)>>,
    pub identities: Mutex<HashMap<String, ClientCredentials>>,
    pub proxy_restarts: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            hosts: Mutex::default(),
            polls: Mutex::default(),
            pushed: Mutex::default(),
            identities: Mutex::default(),
            proxy_restarts: Mutex::default(),
        }
    }

    pub fn poll_count(&self, name: &str) -> u32 {
        self.polls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn has_identity(&self, name: &str) -> bool {
        self.identities.lock().unwrap().contains_key(name)
    }

    pub fn drop_identity(&self, name: &str) {
        self.identities.lock().unwrap().remove(name);
    }

    pub fn has_host(&self, name: &str) -> bool {
        self.hosts.lock().unwrap().contains(name)
    }
}

#[async_trait]
impl ContainerHostDriver for FakeDriver {
    async fn ping(&self, name: &str) -> Result<(), DriverError> {
        if self.has_identity(name) {
            Ok(())
        } else {
            Err(DriverError::NoIdentity(name.to_string()))
        }
    }

    async fn create_container_host(&self, name: &str) -> Result<(), DriverError> {
        if !self.hosts.lock().unwrap().insert(name.to_string()) {
            return Err(DriverError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    async fn start_container_host(&self, _name: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stop_container_host(&self, _name: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn delete_container_host(&self, name: &str) -> Result<(), DriverError> {
        if !self.hosts.lock().unwrap().remove(name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn get_container_host_ip(&self, name: &str) -> Result<String, DriverError> {
        loop {
            let poll = {
                let mut polls = self.polls.lock().unwrap();
                let count = polls.entry(name.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            if poll >= 2 {
                return Ok(self.ip.clone());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn push_auth_certs(
        &self,
        name: &str,
        root_cert_pem: &str,
        server_key_pem: &str,
        server_cert_pem: &str,
    ) -> Result<(), DriverError> {
        self.pushed.lock().unwrap().insert(
            name.to_string(),
            (
                root_cert_pem.to_string(),
                server_key_pem.to_string(),
                server_cert_pem.to_string(),
            ),
        );
        Ok(())
    }

    async fn restart_proxy(&self, name: &str) -> Result<(), DriverError> {
        self.proxy_restarts.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn use_certs(&self, name: &str, credentials: ClientCredentials) -> Result<(), DriverError> {
        self.identities
            .lock()
            .unwrap()
            .insert(name.to_string(), credentials);
        Ok(())
    }

    async fn forget_host(&self, name: &str) {
        self.identities.lock().unwrap().remove(name);
    }
}

/// Secret store keeping entries in memory
#[derive(Default)]
pub struct FakeSecrets {
    pub entries: Mutex<HashMap<String, TlsSecret>>,
}

impl FakeSecrets {
    pub fn entry(&self, key: &str) -> Option<TlsSecret> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl SecretStore for FakeSecrets {
    async fn push(&self, key: &str, secret: &TlsSecret) -> Result<(), SecretError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), secret.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<TlsSecret, SecretError> {
        self.entry(key)
            .ok_or_else(|| SecretError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), SecretError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

pub fn health_config() -> HealthConfig {
    HealthConfig {
        worker_id: WORKER_ID.to_string(),
        advertise_address: "node1".to_string(),
        port: 9786,
        worker_ttl: WORKER_TTL,
        engine_port: 443,
        shared_secret_key: "windlass/secret".to_string(),
        secret_retry: RetryConfig::fixed(5, Duration::from_secs(3)),
    }
}

/// A worker wired to the given fakes
pub struct Harness {
    pub registry: Arc<FakeRegistry>,
    pub driver: Arc<FakeDriver>,
    pub secrets: Arc<FakeSecrets>,
    pub health: HealthRegistry,
    pub orchestrator: ProvisioningOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            Arc::new(FakeRegistry::default()),
            Arc::new(FakeDriver::new("10.0.0.5")),
            Arc::new(FakeSecrets::default()),
        )
    }

    /// A fresh worker process over existing collaborators
    pub fn with(
        registry: Arc<FakeRegistry>,
        driver: Arc<FakeDriver>,
        secrets: Arc<FakeSecrets>,
    ) -> Self {
        let health = HealthRegistry::new(
            health_config(),
            registry.clone(),
            driver.clone(),
            secrets.clone(),
        );
        let orchestrator = ProvisioningOrchestrator::new(
            driver.clone(),
            secrets.clone(),
            health.clone(),
            Duration::from_secs(20),
        );
        Self {
            registry,
            driver,
            secrets,
            health,
            orchestrator,
        }
    }
}
