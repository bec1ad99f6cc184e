//! Host provisioning pipeline
//!
//! Turns a bare container host into a reachable, TLS-secured,
//! registry-visible unit. Steps run in strict order and abort on the first
//! failure:
//!
//! ```text
//! create -> start -> discover IP -> issue certs -> push certs -> restart proxy
//!        -> install client identity -> store certs -> register project
//! ```
//!
//! The whole run is bounded by one deadline, so IP discovery (which retries
//! inside the driver) cannot outlive the request. What happens to a host
//! whose run failed after creation is governed by [`FailurePolicy`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tracing::{info, instrument, warn};

use crate::driver::{ClientCredentials, ContainerHostDriver, DriverError};
use crate::error::{Error, ProvisionStep};
use crate::health::{ping_check, HealthRegistry};
use crate::metrics;
use crate::pki::PkiIssuer;
use crate::project::HostIdentity;
use crate::secrets::{SecretStore, TlsSecret};

/// Bound on cleanup after a failed run
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on tearing down a host on request
pub const DEPROVISION_TIMEOUT: Duration = Duration::from_secs(60);

/// What to do with a host whose provisioning failed after it was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Stop and delete the host before returning the error
    #[default]
    Destroy,
    /// Leave the host for operator cleanup
    Retain,
}

/// A successfully provisioned host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedHost {
    /// Host name (`<namespace>-<name>`)
    pub name: String,
    /// Address the host's engine is reachable at
    pub ip_address: String,
}

/// Runs the provisioning pipeline against injected collaborators
pub struct ProvisioningOrchestrator {
    driver: Arc<dyn ContainerHostDriver>,
    secrets: Arc<dyn SecretStore>,
    health: HealthRegistry,
    issuer: PkiIssuer,
    timeout: Duration,
    policy: FailurePolicy,
}

impl ProvisioningOrchestrator {
    /// Create an orchestrator with the default failure policy
    pub fn new(
        driver: Arc<dyn ContainerHostDriver>,
        secrets: Arc<dyn SecretStore>,
        health: HealthRegistry,
        timeout: Duration,
    ) -> Self {
        Self {
            driver,
            secrets,
            health,
            issuer: PkiIssuer::new(),
            timeout,
            policy: FailurePolicy::default(),
        }
    }

    /// Set the failure policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Deadline of one run
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Failure policy in effect
    pub fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Health registry the pipeline registers hosts with
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Provision the host for `identity`
    ///
    /// A taken host name is reported as [`Error::Conflict`] and leaves the
    /// existing host untouched. Any other failure is an
    /// [`Error::Provisioning`] naming the step that broke.
    #[instrument(skip(self, identity), fields(host = %identity.host_name()))]
    pub async fn provision_host(&self, identity: &HostIdentity) -> Result<ProvisionedHost, Error> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let host = identity.host_name();

        info!("Provisioning container host");
        let result = self.run(&host, deadline).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(provisioned) => {
                metrics::record_provision("success", elapsed);
                info!(ip = %provisioned.ip_address, elapsed_secs = elapsed, "Container host provisioned");
            }
            Err(Error::Conflict(_)) => {
                metrics::record_provision("conflict", elapsed);
                warn!("Container host already exists");
            }
            Err(e) => {
                metrics::record_provision("failure", elapsed);
                warn!(error = %e, step = ?e.step().map(|s| s.as_str()), "Provisioning failed");
            }
        }
        result
    }

    async fn run(&self, host: &str, deadline: Instant) -> Result<ProvisionedHost, Error> {
        match timeout_at(deadline, self.driver.create_container_host(host)).await {
            Ok(Ok(())) => {}
            Ok(Err(DriverError::AlreadyExists(_))) => {
                return Err(Error::conflict(format!(
                    "container host {} already exists",
                    host
                )));
            }
            Ok(Err(e)) => return Err(Error::provisioning(ProvisionStep::CreateHost, e.to_string())),
            Err(_) => return Err(deadline_exceeded(ProvisionStep::CreateHost)),
        }

        let result = self.configure(host, deadline).await;
        if let Err(e) = &result {
            match self.policy {
                FailurePolicy::Destroy => self.cleanup(host, e.step()).await,
                FailurePolicy::Retain => {
                    warn!(host = %host, "Leaving partially provisioned host for operator cleanup")
                }
            }
        }
        result
    }

    /// Every step after creation
    async fn configure(&self, host: &str, deadline: Instant) -> Result<ProvisionedHost, Error> {
        let driver = &self.driver;

        step(
            deadline,
            ProvisionStep::StartHost,
            driver.start_container_host(host),
        )
        .await?;

        let ip = step(
            deadline,
            ProvisionStep::DiscoverIp,
            driver.get_container_host_ip(host),
        )
        .await?;

        let bundle = self
            .issuer
            .issue(&ip)
            .map_err(|e| Error::provisioning(ProvisionStep::IssueCertificates, e.to_string()))?;

        step(
            deadline,
            ProvisionStep::PushCertificates,
            driver.push_auth_certs(
                host,
                &bundle.root_cert_pem,
                &bundle.server_key_pem,
                &bundle.server_cert_pem,
            ),
        )
        .await?;

        step(deadline, ProvisionStep::RestartProxy, driver.restart_proxy(host)).await?;

        step(
            deadline,
            ProvisionStep::InstallClientIdentity,
            driver.use_certs(host, ClientCredentials::from(&bundle)),
        )
        .await?;

        step(
            deadline,
            ProvisionStep::StoreCertificates,
            self.secrets.push(host, &TlsSecret::from(&bundle)),
        )
        .await?;

        step(
            deadline,
            ProvisionStep::RegisterProject,
            self.health
                .register_project(host, &ip, ping_check(driver.clone(), host)),
        )
        .await?;

        Ok(ProvisionedHost {
            name: host.to_string(),
            ip_address: ip,
        })
    }

    /// Best-effort teardown of a host whose run failed; errors are logged only
    async fn cleanup(&self, host: &str, failed: Option<ProvisionStep>) {
        warn!(host = %host, "Destroying partially provisioned host");

        let teardown = async {
            if failed == Some(ProvisionStep::RegisterProject) {
                if let Err(e) = self.health.deregister_project(host).await {
                    warn!(host = %host, error = %e, "Cleanup: failed to deregister project");
                }
            }
            if matches!(
                failed,
                Some(ProvisionStep::StoreCertificates | ProvisionStep::RegisterProject)
            ) {
                if let Err(e) = self.secrets.delete(host).await {
                    warn!(host = %host, error = %e, "Cleanup: failed to delete stored certificates");
                }
            }
            self.driver.forget_host(host).await;
            self.stop_and_delete(host).await
        };

        match tokio::time::timeout(CLEANUP_TIMEOUT, teardown).await {
            Ok(Ok(())) => info!(host = %host, "Partially provisioned host destroyed"),
            Ok(Err(e)) => warn!(host = %host, error = %e, "Cleanup: failed to destroy host"),
            Err(_) => warn!(host = %host, "Cleanup timed out"),
        }
    }

    async fn stop_and_delete(&self, host: &str) -> Result<(), DriverError> {
        match self.driver.stop_container_host(host).await {
            Ok(()) | Err(DriverError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.driver.delete_container_host(host).await
    }

    /// Tear down a provisioned host
    ///
    /// Stops its health check, deletes its registry entries, stops and
    /// deletes the host, then removes its stored certificates and client
    /// identity. A host that is already gone is not an error.
    #[instrument(skip(self, identity), fields(host = %identity.host_name()))]
    pub async fn deprovision_host(&self, identity: &HostIdentity) -> Result<(), Error> {
        let host = identity.host_name();
        info!("Deprovisioning container host");

        let teardown = async {
            self.health.deregister_project(&host).await?;

            match self.stop_and_delete(&host).await {
                Ok(()) | Err(DriverError::NotFound(_)) => {}
                Err(e) => return Err(Error::internal(format!("failed to delete container host: {}", e))),
            }

            self.secrets
                .delete(&host)
                .await
                .map_err(|e| Error::transient(e.to_string()))?;
            self.driver.forget_host(&host).await;
            Ok(())
        };

        tokio::time::timeout(DEPROVISION_TIMEOUT, teardown)
            .await
            .map_err(|_| Error::internal(format!("deprovisioning {} timed out", host)))??;

        info!("Container host deprovisioned");
        Ok(())
    }
}

fn deadline_exceeded(step: ProvisionStep) -> Error {
    Error::provisioning(step, "deadline exceeded")
}

/// Run one step under the run's deadline, naming the step on failure
async fn step<T, E, F>(deadline: Instant, step: ProvisionStep, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::provisioning(step, e.to_string())),
        Err(_) => Err(deadline_exceeded(step)),
    }
}
