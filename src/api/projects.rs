//! Project handlers

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::AppState;
use crate::project::{HostIdentity, ProjectRequest};
use crate::provision::ProvisionedHost;
use crate::Error;

/// `POST /projects`: validate the identity, then provision its host
///
/// The pipeline runs on its own task so a client that disconnects mid-run
/// does not cancel it; its deadline and failure cleanup still apply.
pub async fn create_project(
    State(state): State<AppState>,
    payload: Result<Json<ProjectRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionedHost>), Error> {
    let Json(request) = payload.map_err(|rejection| Error::validation(rejection.body_text()))?;
    let identity = request.identity()?;
    debug!(
        project = %identity,
        containers = request.containers.len(),
        "Create project request received"
    );

    let orchestrator = state.orchestrator.clone();
    let run_identity = identity.clone();
    let host = tokio::spawn(async move { orchestrator.provision_host(&run_identity).await })
        .await
        .map_err(|e| Error::internal(format!("provisioning task failed: {}", e)))??;
    info!(project = %identity, host = %host.name, "Project created");
    Ok((StatusCode::CREATED, Json(host)))
}

/// `DELETE /projects/{namespace}/{name}`: tear down the project's host
pub async fn delete_project(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Value>, Error> {
    let identity = HostIdentity::new(namespace, name)?;
    state.orchestrator.deprovision_host(&identity).await?;
    info!(project = %identity, "Project deleted");
    Ok(Json(json!({ "name": identity.host_name() })))
}
