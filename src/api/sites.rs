use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;

use super::{ok, ApiJson, SharedState};
use crate::api::error::{ApiError, ApiResult};
use crate::store::sites::SiteInfo;
use crate::store::{OAuthPolicy, PolicyPatch};

pub async fn list(State(state): State<SharedState>) -> ApiResult<Response> {
    let sites = state.deployer.sites.list()?;
    let infos: Vec<SiteInfo> = sites.iter().map(SiteInfo::from).collect();
    Ok(ok(infos))
}

/// Upload a zip bundle for a subdomain. Optional headers attach an access
/// policy at deploy time: `X-Site-OAuth-Emails` (CSV) and
/// `X-Site-OAuth-Domain`.
pub async fn upload(
    State(state): State<SharedState>,
    Path(subdomain): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/zip") {
        return Err(ApiError::bad_request(format!(
            "expected Content-Type application/zip, got '{}'",
            content_type
        )));
    }

    let max = state.config().max_upload_size;
    if body.len() as u64 > max {
        return Err(ApiError::bad_request(format!(
            "upload of {} bytes exceeds the maximum of {} bytes",
            body.len(),
            max
        )));
    }

    let policy = policy_from_headers(&headers)?;
    if policy.is_some() && !state.deployer.oauth_enabled() {
        return Err(ApiError::bad_request(
            "cannot set an access policy: OIDC is not configured",
        ));
    }

    let meta = state.deployer.publish_site(&subdomain, &body, policy).await?;
    Ok(ok(SiteInfo::from(&meta)))
}

fn policy_from_headers(headers: &HeaderMap) -> ApiResult<Option<OAuthPolicy>> {
    let emails = headers
        .get("x-site-oauth-emails")
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::bad_request("X-Site-OAuth-Emails is not valid UTF-8"))
        })
        .transpose()?
        .map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|email| !email.is_empty())
                .map(str::to_lowercase)
                .collect::<BTreeSet<String>>()
        });
    let domain = headers
        .get("x-site-oauth-domain")
        .map(|value| {
            value
                .to_str()
                .map_err(|_| ApiError::bad_request("X-Site-OAuth-Domain is not valid UTF-8"))
        })
        .transpose()?
        .map(|domain| domain.trim().to_lowercase())
        .filter(|domain| !domain.is_empty());

    if emails.is_none() && domain.is_none() {
        return Ok(None);
    }
    Ok(Some(OAuthPolicy {
        allowed_emails: emails,
        allowed_domain: domain,
        allowed_groups: None,
    }))
}

pub async fn remove(
    State(state): State<SharedState>,
    Path(subdomain): Path<String>,
) -> ApiResult<Response> {
    state.deployer.delete_site(&subdomain).await?;
    Ok(ok(json!(null)))
}

pub async fn download(
    State(state): State<SharedState>,
    Path(subdomain): Path<String>,
) -> ApiResult<Response> {
    let bytes = state
        .deployer
        .sites
        .zip_site(&subdomain)?
        .ok_or_else(|| ApiError::not_found(format!("site '{}' not found", subdomain)))?;

    let response = Response::builder()
        .header(CONTENT_TYPE, "application/zip")
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.zip\"", subdomain),
        )
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(response)
}

pub async fn patch_auth(
    State(state): State<SharedState>,
    Path(subdomain): Path<String>,
    ApiJson(patch): ApiJson<PolicyPatch>,
) -> ApiResult<Response> {
    state.deployer.patch_site_policy(&subdomain, patch).await?;
    Ok(ok(json!(null)))
}

pub async fn versions(
    State(state): State<SharedState>,
    Path(subdomain): Path<String>,
) -> ApiResult<Response> {
    if !state.deployer.sites.exists(&subdomain) {
        return Err(ApiError::not_found(format!(
            "site '{}' not found",
            subdomain
        )));
    }
    Ok(ok(state.deployer.sites.versions(&subdomain)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    pub version: Option<u32>,
}

pub async fn rollback(
    State(state): State<SharedState>,
    Path(subdomain): Path<String>,
    body: Option<ApiJson<RollbackRequest>>,
) -> ApiResult<Response> {
    let version = body.and_then(|ApiJson(request)| request.version);
    let meta = state.deployer.rollback_site(&subdomain, version).await?;
    Ok(ok(SiteInfo::from(&meta)))
}
