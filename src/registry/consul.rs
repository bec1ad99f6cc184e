//! Consul agent HTTP API client

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{HealthStatus, KvEntry, RegistryClient, RegistryError, ServiceRegistration};
use crate::config::WorkerConfig;

/// Consul connection settings
#[derive(Clone)]
pub struct ConsulConfig {
    /// Agent base URL
    pub url: String,
    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,
}

impl ConsulConfig {
    /// Build from worker settings
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            url: config.consul_url.trim_end_matches('/').to_string(),
            token: config.consul_token.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    check: AgentServiceCheck,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "TTL")]
    ttl: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckUpdate<'a> {
    status: &'a str,
    output: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

/// Go-style duration string accepted by Consul
fn consul_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Map a failed TTL update onto the registry taxonomy
fn classify_update_error(check_id: &str, status: StatusCode, body: &str) -> RegistryError {
    let lower = body.to_ascii_lowercase();
    if status == StatusCode::NOT_FOUND
        || lower.contains("does not have associated ttl")
        || lower.contains("unknown check")
    {
        return RegistryError::CheckMissing(check_id.to_string());
    }
    RegistryError::Api {
        status: status.as_u16(),
        message: body.to_string(),
    }
}

/// Registry client for a local Consul agent
pub struct ConsulClient {
    config: ConsulConfig,
    http: reqwest::Client,
}

impl ConsulClient {
    /// Create a client
    pub fn new(config: ConsulConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.config.url, path));
        match &self.config.token {
            Some(token) => builder.header("X-Consul-Token", token),
            None => builder,
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(RegistryError::Api { status, message })
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn register_service(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<(), RegistryError> {
        let body = AgentServiceRegistration {
            id: &registration.id,
            name: &registration.name,
            tags: &registration.tags,
            address: &registration.address,
            port: registration.port,
            check: AgentServiceCheck {
                ttl: consul_duration(registration.ttl),
            },
        };
        let response = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .json(&body)
            .send()
            .await?;
        Self::expect_success(response).await?;
        debug!(service = %registration.id, ttl = ?registration.ttl, "Registered service");
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), RegistryError> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/service/deregister/{}", service_id),
            )
            .send()
            .await?;
        // The agent already forgot the service
        if response.status() == StatusCode::NOT_FOUND {
            debug!(service = %service_id, "Service unknown to the agent, nothing to deregister");
            return Ok(());
        }
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: HealthStatus,
    ) -> Result<(), RegistryError> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/check/update/{}", check_id),
            )
            .json(&CheckUpdate {
                status: status.as_str(),
                output,
            })
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        let code = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify_update_error(check_id, code, &body))
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>, RegistryError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{}", key))
            .query(&[("raw", "")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_success(response).await?;
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<(), RegistryError> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/v1/kv/{}", key))
            .body(value.to_vec())
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn kv_list(&self, prefix: &str) -> Result<Vec<KvEntry>, RegistryError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{}", prefix))
            .query(&[("recurse", "")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let pairs: Vec<KvPair> = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| RegistryError::Decode(e.to_string()))?;

        pairs
            .into_iter()
            .map(|pair| {
                let value = match pair.value {
                    Some(encoded) => base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| RegistryError::Decode(format!("{}: {}", pair.key, e)))?,
                    None => Vec::new(),
                };
                Ok(KvEntry {
                    key: pair.key,
                    value,
                })
            })
            .collect()
    }

    async fn kv_delete(&self, key: &str) -> Result<(), RegistryError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/v1/kv/{}", key))
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    use axum::body::Bytes;
    use axum::extract::{Path, Query, State};
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    #[derive(Default)]
    struct FakeConsul {
        services: Mutex<HashMap<String, Value>>,
        checks: Mutex<HashMap<String, (String, String)>>,
        kv: Mutex<BTreeMap<String, Vec<u8>>>,
        tokens: Mutex<Vec<String>>,
    }

    async fn register(
        State(fake): State<Arc<FakeConsul>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        if let Some(token) = headers.get("X-Consul-Token").and_then(|v| v.to_str().ok()) {
            fake.tokens.lock().unwrap().push(token.to_string());
        }
        let id = body["ID"].as_str().unwrap_or_default().to_string();
        fake.checks
            .lock()
            .unwrap()
            .insert(format!("service:{}", id), (String::new(), "critical".to_string()));
        fake.services.lock().unwrap().insert(id, body);
        StatusCode::OK
    }

    async fn deregister(
        State(fake): State<Arc<FakeConsul>>,
        Path(id): Path<String>,
    ) -> axum::response::Response {
        fake.checks.lock().unwrap().remove(&format!("service:{}", id));
        match fake.services.lock().unwrap().remove(&id) {
            Some(_) => StatusCode::OK.into_response(),
            None => (
                StatusCode::NOT_FOUND,
                format!("Unknown service ID \"{}\". Ensure that the service ID is passed, not the service name.", id),
            )
                .into_response(),
        }
    }

    async fn update(
        State(fake): State<Arc<FakeConsul>>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        let mut checks = fake.checks.lock().unwrap();
        match checks.get_mut(&id) {
            Some(check) => {
                *check = (
                    body["Output"].as_str().unwrap_or_default().to_string(),
                    body["Status"].as_str().unwrap_or_default().to_string(),
                );
                StatusCode::OK.into_response()
            }
            None => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("CheckID \"{}\" does not have associated TTL", id),
            )
                .into_response(),
        }
    }

    async fn kv_read(
        State(fake): State<Arc<FakeConsul>>,
        Path(key): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        let kv = fake.kv.lock().unwrap();
        if query.contains_key("recurse") {
            let pairs: Vec<Value> = kv
                .iter()
                .filter(|(k, _)| k.starts_with(&key))
                .map(|(k, v)| {
                    json!({"Key": k, "Value": base64::engine::general_purpose::STANDARD.encode(v)})
                })
                .collect();
            if pairs.is_empty() {
                return StatusCode::NOT_FOUND.into_response();
            }
            return Json(pairs).into_response();
        }
        match kv.get(&key) {
            Some(value) => value.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn kv_write(State(fake): State<Arc<FakeConsul>>, Path(key): Path<String>, body: Bytes) -> &'static str {
        fake.kv.lock().unwrap().insert(key, body.to_vec());
        "true"
    }

    async fn kv_remove(State(fake): State<Arc<FakeConsul>>, Path(key): Path<String>) -> &'static str {
        fake.kv.lock().unwrap().remove(&key);
        "true"
    }

    async fn start_fake(token: Option<&str>) -> (ConsulClient, Arc<FakeConsul>) {
        let fake = Arc::new(FakeConsul::default());
        let router = Router::new()
            .route("/v1/agent/service/register", put(register))
            .route("/v1/agent/service/deregister/{id}", put(deregister))
            .route("/v1/agent/check/update/{id}", put(update))
            .route("/v1/kv/{*key}", get(kv_read).put(kv_write).delete(kv_remove))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let client = ConsulClient::new(ConsulConfig {
            url: format!("http://{}", addr),
            token: token.map(str::to_string),
        });
        (client, fake)
    }

    fn project_registration() -> ServiceRegistration {
        ServiceRegistration {
            id: "acme-web".to_string(),
            name: "windlass_worker_projects".to_string(),
            tags: vec!["worker:windlass-worker@node1:9786".to_string()],
            address: "10.0.0.5".to_string(),
            port: 443,
            ttl: Duration::from_secs(50),
        }
    }

    #[tokio::test]
    async fn registration_sends_ttl_check_and_token() {
        let (client, fake) = start_fake(Some("acl")).await;
        client
            .register_service(&project_registration())
            .await
            .unwrap();

        let services = fake.services.lock().unwrap();
        let body = &services["acme-web"];
        assert_eq!(body["Name"], "windlass_worker_projects");
        assert_eq!(body["Port"], 443);
        assert_eq!(body["Address"], "10.0.0.5");
        assert_eq!(body["Check"]["TTL"], "50s");
        assert_eq!(body["Tags"][0], "worker:windlass-worker@node1:9786");
        assert_eq!(*fake.tokens.lock().unwrap(), vec!["acl".to_string()]);
    }

    #[tokio::test]
    async fn ttl_update_sets_status_and_output() {
        let (client, fake) = start_fake(None).await;
        client
            .register_service(&project_registration())
            .await
            .unwrap();
        client
            .update_ttl("service:acme-web", "Remote Docker daemon reachable", HealthStatus::Passing)
            .await
            .unwrap();

        assert_eq!(
            fake.checks.lock().unwrap()["service:acme-web"],
            (
                "Remote Docker daemon reachable".to_string(),
                "passing".to_string()
            )
        );
    }

    /// Story: the agent restarted and forgot our check; the update is
    /// classified so the caller knows to re-register
    #[tokio::test]
    async fn story_update_of_forgotten_check_is_check_missing() {
        let (client, _) = start_fake(None).await;
        assert_eq!(
            client
                .update_ttl("service:acme-web", "", HealthStatus::Passing)
                .await,
            Err(RegistryError::CheckMissing("service:acme-web".to_string()))
        );
    }

    #[tokio::test]
    async fn deregistration_removes_service() {
        let (client, fake) = start_fake(None).await;
        client
            .register_service(&project_registration())
            .await
            .unwrap();
        client.deregister_service("acme-web").await.unwrap();
        assert!(fake.services.lock().unwrap().is_empty());
    }

    /// Story: the agent restarted and forgot the service before teardown;
    /// deregistering it is still a success
    #[tokio::test]
    async fn story_deregistering_an_unknown_service_succeeds() {
        let (client, fake) = start_fake(None).await;
        assert_eq!(client.deregister_service("acme-web").await, Ok(()));
        assert!(fake.services.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn kv_roundtrip_list_and_delete() {
        let (client, _) = start_fake(None).await;
        let worker = "windlass-worker@node1:9786";

        assert_eq!(client.kv_get("windlass/secret").await.unwrap(), None);
        assert!(client.kv_list(worker).await.unwrap().is_empty());

        client.kv_put("windlass/secret", b"s3cret").await.unwrap();
        client
            .kv_put(&format!("{}/acme-web", worker), br#"{"id":"acme-web"}"#)
            .await
            .unwrap();

        assert_eq!(
            client.kv_get("windlass/secret").await.unwrap(),
            Some(b"s3cret".to_vec())
        );
        let entries = client.kv_list(worker).await.unwrap();
        assert_eq!(
            entries,
            vec![KvEntry {
                key: format!("{}/acme-web", worker),
                value: br#"{"id":"acme-web"}"#.to_vec(),
            }]
        );

        client
            .kv_delete(&format!("{}/acme-web", worker))
            .await
            .unwrap();
        assert!(client.kv_list(worker).await.unwrap().is_empty());
    }

    #[test]
    fn durations_use_consul_syntax() {
        assert_eq!(consul_duration(Duration::from_secs(10)), "10s");
        assert_eq!(consul_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn unknown_check_message_is_classified() {
        assert!(classify_update_error(
            "service:x",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unknown check ID \"service:x\""
        )
        .is_check_missing());
        assert!(!classify_update_error("service:x", StatusCode::INTERNAL_SERVER_ERROR, "rpc error")
            .is_check_missing());
    }
}
