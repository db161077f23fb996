use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use sagaflow_core::{
    events::Event, CompensationReport, DefinitionKey, InstanceId, WorkflowDefinition,
    WorkflowInstance, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn parse_instance_id(raw: &str) -> ApiResult<InstanceId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid instance ID: {}", raw)))
}

/// Submit a definition and start an instance of it
pub async fn submit_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitInstanceRequest>,
) -> ApiResult<(StatusCode, Json<SubmitInstanceResponse>)> {
    let key = req.definition.key();
    let instance_id = state.engine.submit(req.definition, req.input).await?;

    tracing::info!("Accepted instance {} of {}", instance_id, key);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitInstanceResponse {
            instance_id,
            definition: key,
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitInstanceRequest {
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitInstanceResponse {
    pub instance_id: InstanceId,
    pub definition: DefinitionKey,
}

/// List all instances
pub async fn list_instances(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListInstancesResponse>> {
    let mut instances = Vec::new();
    for instance_id in state.engine.list_instances().await? {
        let instance = state.engine.status(instance_id).await?;
        instances.push(InstanceSummary {
            id: instance.id,
            definition: instance.definition,
            status: instance.status,
            updated_at: instance.updated_at,
        });
    }
    instances.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    Ok(Json(ListInstancesResponse { instances }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListInstancesResponse {
    pub instances: Vec<InstanceSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub definition: DefinitionKey,
    pub status: WorkflowStatus,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Get a specific instance
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<InstanceResponse>> {
    let instance_id = parse_instance_id(&instance_id)?;
    let instance = state.engine.status(instance_id).await?;
    let compensation = instance.compensation_report();

    Ok(Json(InstanceResponse {
        instance,
        compensation,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceResponse {
    #[serde(flatten)]
    pub instance: WorkflowInstance,
    pub compensation: CompensationReport,
}

/// Get the transition log of an instance
pub async fn get_instance_events(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<GetInstanceEventsResponse>> {
    let instance_id = parse_instance_id(&instance_id)?;
    let events = state.engine.events(instance_id).await?;

    Ok(Json(GetInstanceEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetInstanceEventsResponse {
    pub events: Vec<Event>,
}

/// Cancel a running instance
pub async fn cancel_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<CancelInstanceRequest>,
) -> ApiResult<(StatusCode, Json<InstanceStatusResponse>)> {
    let instance_id = parse_instance_id(&instance_id)?;
    let reason = req
        .reason
        .unwrap_or_else(|| "cancelled through the API".to_string());

    state.engine.cancel(instance_id, reason).await?;
    let status = state.engine.status(instance_id).await?.status;

    Ok((
        StatusCode::ACCEPTED,
        Json(InstanceStatusResponse {
            instance_id,
            status,
        }),
    ))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CancelInstanceRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Resume an instance from its log
pub async fn resume_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<InstanceStatusResponse>> {
    let instance_id = parse_instance_id(&instance_id)?;
    let status = state.engine.drive(instance_id).await?;

    Ok(Json(InstanceStatusResponse {
        instance_id,
        status,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceStatusResponse {
    pub instance_id: InstanceId,
    pub status: WorkflowStatus,
}
