use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use super::{ok, ApiJson, SharedState};
use crate::api::error::{ApiError, ApiResult};
use crate::deploy::{normalize_domains, UpdateAppRequest};
use crate::runtime::{RestartPolicy, VolumeMount};
use crate::store::apps::{App, AppInfo, AppSource, AppType};
use crate::store::OAuthPolicy;

/// Declared state for a new app; observable state starts out `pending`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppRequest {
    pub name: String,
    #[serde(flatten)]
    pub source: AppSource,
    #[serde(rename = "type", default)]
    pub app_type: AppType,
    pub internal_port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub oauth: Option<OAuthPolicy>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerLogs {
    pub name: String,
    pub tail: u32,
    pub logs: String,
}

pub async fn list(State(state): State<SharedState>) -> ApiResult<Response> {
    let apps = state.deployer.apps.list()?;
    let infos: Vec<AppInfo> = apps.iter().map(AppInfo::from).collect();
    Ok(ok(infos))
}

pub async fn get_one(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let app = state
        .deployer
        .apps
        .get(&name)?
        .ok_or_else(|| ApiError::not_found(format!("app '{}' not found", name)))?;
    Ok(ok(app))
}

pub async fn create(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<CreateAppRequest>,
) -> ApiResult<Response> {
    let mut app = App::new(
        request.name,
        request.source,
        request.app_type,
        request.internal_port,
    );
    app.env = request.env;
    app.volumes = request.volumes;
    app.restart_policy = request.restart_policy;
    app.domains = normalize_domains(request.domains)?;
    app.oauth = request.oauth.map(|policy| policy.normalized());

    let app = state.deployer.create_app(app).await?;
    Ok(ok(app))
}

pub async fn update(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    ApiJson(request): ApiJson<UpdateAppRequest>,
) -> ApiResult<Response> {
    let app = state.deployer.update_app(&name, request).await?;
    Ok(ok(app))
}

pub async fn remove(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.deployer.delete_app(&name).await?;
    Ok(ok(json!(null)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployParams {
    #[serde(default)]
    pub no_cache: bool,
}

pub async fn deploy(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(params): Query<DeployParams>,
) -> ApiResult<Response> {
    let app = state.deployer.deploy_app(&name, params.no_cache).await?;
    Ok(ok(app))
}

pub async fn stop(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let app = state.deployer.stop_app(&name).await?;
    Ok(ok(app))
}

pub async fn restart(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let app = state.deployer.restart_app(&name).await?;
    Ok(ok(app))
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    #[serde(default = "default_tail")]
    pub tail: u32,
}

fn default_tail() -> u32 {
    100
}

pub async fn logs(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(params): Query<LogParams>,
) -> ApiResult<Response> {
    let logs = state.deployer.app_logs(&name, params.tail).await?;
    Ok(ok(ContainerLogs {
        name,
        tail: params.tail,
        logs,
    }))
}
