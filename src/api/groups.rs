use axum::extract::{Path, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;

use super::{ok, ApiJson, SharedState};
use crate::api::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub emails: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmailsRequest {
    pub emails: BTreeSet<String>,
}

pub async fn list(State(state): State<SharedState>) -> ApiResult<Response> {
    Ok(ok(state.groups.list()))
}

pub async fn get_one(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let group = state
        .groups
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("group '{}' not found", name)))?;
    Ok(ok(group))
}

pub async fn create(
    State(state): State<SharedState>,
    ApiJson(request): ApiJson<CreateGroupRequest>,
) -> ApiResult<Response> {
    match state.groups.create(&request.name, request.emails) {
        Ok(group) => Ok(ok(group)),
        Err(e) => {
            let message = e.to_string();
            if message.contains("already exists") || message.contains("name") {
                Err(ApiError::bad_request(message))
            } else {
                Err(ApiError::Internal(e))
            }
        }
    }
}

pub async fn remove(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    if !state.groups.delete(&name)? {
        return Err(ApiError::not_found(format!("group '{}' not found", name)));
    }
    Ok(ok(json!(null)))
}

pub async fn add_emails(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    ApiJson(request): ApiJson<EmailsRequest>,
) -> ApiResult<Response> {
    let group = state
        .groups
        .add_emails(&name, &request.emails)?
        .ok_or_else(|| ApiError::not_found(format!("group '{}' not found", name)))?;
    Ok(ok(group))
}

pub async fn remove_emails(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    ApiJson(request): ApiJson<EmailsRequest>,
) -> ApiResult<Response> {
    let group = state
        .groups
        .remove_emails(&name, &request.emails)?
        .ok_or_else(|| ApiError::not_found(format!("group '{}' not found", name)))?;
    Ok(ok(group))
}
