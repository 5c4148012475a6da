pub mod apps;
pub mod error;
pub mod groups;
pub mod sites;

use axum::extract::{DefaultBodyLimit, FromRequest, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::authz::{self, AuthDecision};
use crate::config::oauth::{self as oauth_config, OAuthServerConfig};
use crate::config::AgentConfig;
use crate::deploy::Deployer;
use crate::store::groups::GroupStore;
use error::{ApiError, ApiResult};

pub struct AppState {
    pub deployer: Deployer,
    pub groups: GroupStore,
}

impl AppState {
    pub fn config(&self) -> &AgentConfig {
        &self.deployer.config
    }
}

pub type SharedState = Arc<AppState>;

/// Standard success envelope; errors use the mirror shape with `error`.
pub fn ok<T: Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

/// JSON extractor that reports malformed bodies through the envelope
/// instead of axum's plain-text rejection.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::bad_request(rejection.body_text())),
        }
    }
}

async fn require_api_key(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if provided != Some(state.config().api_key.as_str()) {
        return ApiError::Unauthorized("invalid or missing API key".to_string()).into_response();
    }
    next.run(request).await
}

pub fn router(state: SharedState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/oauth/status", get(oauth_status))
        .route("/auth/check", get(auth_check));

    let protected = Router::new()
        .route("/sites", get(sites::list))
        .route("/sites/:subdomain", post(sites::upload).delete(sites::remove))
        .route("/sites/:subdomain/download", get(sites::download))
        .route("/sites/:subdomain/auth", patch(sites::patch_auth))
        .route("/sites/:subdomain/versions", get(sites::versions))
        .route("/sites/:subdomain/rollback", post(sites::rollback))
        .route("/apps", get(apps::list).post(apps::create))
        .route(
            "/apps/:name",
            get(apps::get_one).patch(apps::update).delete(apps::remove),
        )
        .route("/apps/:name/deploy", post(apps::deploy))
        .route("/apps/:name/stop", post(apps::stop))
        .route("/apps/:name/restart", post(apps::restart))
        .route("/apps/:name/logs", get(apps::logs))
        .route("/groups", get(groups::list).post(groups::create))
        .route("/groups/:name", get(groups::get_one).delete(groups::remove))
        .route(
            "/groups/:name/emails",
            post(groups::add_emails).delete(groups::remove_emails),
        )
        .route("/status", get(status))
        .route(
            "/oauth/config",
            put(set_oauth_config).delete(remove_oauth_config),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let body_limit = state.config().max_upload_size as usize + 64 * 1024;
    Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Response {
    ok(json!({ "status": "ok" }))
}

async fn oauth_status(State(state): State<SharedState>) -> Response {
    ok(json!({ "enabled": state.deployer.oauth_enabled() }))
}

/// Forward-auth endpoint the proxy consults for every request to a
/// protected resource. No envelope and no API key: the proxy is the only
/// intended caller and acts on the status code alone.
async fn auth_check(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let host = header_str(&headers, "x-forwarded-host")
        .or_else(|| header_str(&headers, "host"))
        .unwrap_or_default();
    let email = header_str(&headers, "x-forwarded-email")
        .or_else(|| header_str(&headers, "x-auth-request-email"));

    let decision = match authz::check(
        &host,
        email.as_deref(),
        &state.config().domain,
        &state.deployer.apps,
        &state.deployer.sites,
        &state.groups,
    ) {
        Ok(decision) => decision,
        Err(e) => return ApiError::Internal(e).into_response(),
    };

    match decision {
        AuthDecision::Allow => StatusCode::OK.into_response(),
        AuthDecision::Unauthenticated => {
            (StatusCode::UNAUTHORIZED, "authentication required").into_response()
        }
        AuthDecision::Denied { email, host } => (
            StatusCode::FORBIDDEN,
            [(CONTENT_TYPE, "text/html; charset=utf-8")],
            authz::denied_page(&email, &host, &state.config().domain),
        )
            .into_response(),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Managed-container state plus observed TLS status per router.
async fn status(State(state): State<SharedState>) -> Response {
    let containers = state.deployer.edge.container_statuses().await;
    let tls = match state.deployer.edge.tls_report().await {
        Ok(report) => report,
        Err(e) => {
            warn!("TLS report unavailable: {:#}", e);
            BTreeMap::new()
        }
    };
    ok(json!({ "containers": containers, "tls": tls }))
}

async fn set_oauth_config(
    State(state): State<SharedState>,
    ApiJson(config): ApiJson<OAuthServerConfig>,
) -> ApiResult<Response> {
    config
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    oauth_config::save(&state.config().data_dir, &config)?;
    *state
        .deployer
        .oauth
        .write()
        .unwrap_or_else(|p| p.into_inner()) = Some(config.clone());

    state.deployer.edge.restart_sidecar(Some(&config)).await?;
    state.deployer.refresh_edge().await?;
    Ok(ok(json!(null)))
}

async fn remove_oauth_config(State(state): State<SharedState>) -> ApiResult<Response> {
    oauth_config::remove(&state.config().data_dir)?;
    *state
        .deployer
        .oauth
        .write()
        .unwrap_or_else(|p| p.into_inner()) = None;

    state.deployer.edge.restart_sidecar(None).await?;
    state.deployer.refresh_edge().await?;
    Ok(ok(json!(null)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeController;
    use crate::git::Git;
    use crate::runtime::Docker;
    use crate::store::apps::AppStore;
    use crate::store::sites::SiteStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::io::Write;
    use std::sync::RwLock;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    fn test_state(dir: &std::path::Path, oidc: bool) -> SharedState {
        let config = AgentConfig {
            domain: "op.example".to_string(),
            acme_email: "admin@op.example".to_string(),
            api_key: KEY.to_string(),
            data_dir: dir.to_path_buf(),
            http_port: 80,
            https_port: 443,
            api_port: 3000,
            max_upload_size: 1024 * 1024,
        };
        let oauth = oidc.then(|| OAuthServerConfig {
            issuer_url: "https://accounts.example.com".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            cookie_secret: "cookie".to_string(),
            cookie_domain: ".op.example".to_string(),
        });

        let docker = Docker::new(config.data_dir.clone());
        let edge = Arc::new(EdgeController::new(config.clone(), docker.clone()));
        let deployer = Deployer::new(
            config.clone(),
            docker,
            Git::new(config.data_dir.clone()),
            AppStore::new(&config.data_dir),
            SiteStore::new(&config.data_dir),
            edge,
            Arc::new(RwLock::new(oauth)),
        );
        let groups = GroupStore::load(&config.data_dir).unwrap();
        Arc::new(AppState { deployer, groups })
    }

    fn zip_bundle(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer
                .start_file(name.to_string(), zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    async fn send(state: &SharedState, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(json!(null));
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn upload_zip(subdomain: &str, bundle: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/sites/{}", subdomain))
            .header("x-api-key", KEY)
            .header("content-type", "application/zip")
            .body(Body::from(bundle))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public_but_everything_else_is_gated() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);

        let (status, body) = send(
            &state,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");

        let (status, body) = send(
            &state,
            Request::builder().uri("/sites").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &state,
            Request::builder()
                .uri("/sites")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(
            &state,
            Request::builder()
                .uri("/oauth/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["enabled"], false);
    }

    #[tokio::test]
    async fn app_creation_validates_names_and_sources() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);

        let good = json!({"name": "web", "image": "nginx:alpine", "internalPort": 80});
        let (status, body) = send(&state, post_json("/apps", good.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "pending");
        assert_eq!(body["data"]["image"], "nginx:alpine");

        let (status, body) = send(&state, post_json("/apps", good)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("already in use"));

        let reserved = json!({"name": "api", "image": "nginx:alpine", "internalPort": 80});
        let (status, body) = send(&state, post_json("/apps", reserved)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("reserved"));

        let both = json!({
            "name": "dual",
            "image": "nginx:alpine",
            "git": {"repoUrl": "https://example.com/a.git"},
            "internalPort": 80,
        });
        let (status, body) = send(&state, post_json("/apps", both)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("exactly one"));

        let uppercase = json!({"name": "Web", "image": "nginx:alpine", "internalPort": 80});
        let (status, body) = send(&state, post_json("/apps", uppercase)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("lowercase"));
    }

    #[tokio::test]
    async fn site_upload_lists_and_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);

        let bundle = zip_bundle(&[("index.html", b"hello"), ("a/b.html", b"deep")]);
        let (status, body) = send(&state, upload_zip("s1", bundle)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["subdomain"], "s1");
        assert_eq!(body["data"]["fileCount"], 2);

        let (status, body) = send(&state, get("/sites")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["subdomain"], "s1");

        // the mirrored app record is visible on the apps surface
        let (_, body) = send(&state, get("/apps/s1")).await;
        assert_eq!(body["data"]["type"], "static");
        assert_eq!(body["data"]["status"], "running");

        // the proxy config gained the site router
        let yaml =
            std::fs::read_to_string(dir.path().join("traefik/dynamic.yml")).unwrap();
        assert!(yaml.contains("site-s1"));
        assert!(yaml.contains("nginx-service"));
    }

    #[tokio::test]
    async fn site_redeploy_preserves_created_at_and_increments_history() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);

        let (_, first) = send(&state, upload_zip("s1", zip_bundle(&[("index.html", b"v1")]))).await;
        assert_eq!(first["success"], true);
        let (_, app1) = send(&state, get("/apps/s1")).await;

        let (_, second) =
            send(&state, upload_zip("s1", zip_bundle(&[("index.html", b"v2")]))).await;
        assert_eq!(second["success"], true);
        let (_, app2) = send(&state, get("/apps/s1")).await;

        assert_eq!(app1["data"]["createdAt"], app2["data"]["createdAt"]);
        let before =
            chrono::DateTime::parse_from_rfc3339(app1["data"]["updatedAt"].as_str().unwrap())
                .unwrap();
        let after =
            chrono::DateTime::parse_from_rfc3339(app2["data"]["updatedAt"].as_str().unwrap())
                .unwrap();
        assert!(after > before);

        let (_, versions) = send(&state, get("/sites/s1/versions")).await;
        assert_eq!(versions["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn site_upload_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);

        // wrong content type
        let request = Request::builder()
            .method("POST")
            .uri("/sites/s1")
            .header("x-api-key", KEY)
            .header("content-type", "text/plain")
            .body(Body::from("not a zip"))
            .unwrap();
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("application/zip"));

        // reserved name
        let (status, _) = send(&state, upload_zip("api", zip_bundle(&[("i.html", b"x")]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // malformed archive
        let (status, body) = send(&state, upload_zip("s1", b"garbage".to_vec())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("zip"));

        // policy headers without OIDC
        let request = Request::builder()
            .method("POST")
            .uri("/sites/s1")
            .header("x-api-key", KEY)
            .header("content-type", "application/zip")
            .header("x-site-oauth-domain", "x.com")
            .body(Body::from(zip_bundle(&[("i.html", b"x")])))
            .unwrap();
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn site_policy_patch_requires_oidc_then_protects_the_router() {
        let dir = tempfile::tempdir().unwrap();

        // without OIDC: 400 "not configured"
        let state = test_state(dir.path(), false);
        send(&state, upload_zip("s1", zip_bundle(&[("index.html", b"x")]))).await;
        let patch = Request::builder()
            .method("PATCH")
            .uri("/sites/s1/auth")
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .body(Body::from(json!({"allowedDomain": "x.com"}).to_string()))
            .unwrap();
        let (status, body) = send(&state, patch).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("not configured"));

        // with OIDC: accepted, and the router carries the middleware chain
        let state = test_state(dir.path(), true);
        let patch = Request::builder()
            .method("PATCH")
            .uri("/sites/s1/auth")
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .body(Body::from(json!({"allowedDomain": "x.com"}).to_string()))
            .unwrap();
        let (status, _) = send(&state, patch).await;
        assert_eq!(status, StatusCode::OK);

        let yaml = std::fs::read_to_string(dir.path().join("traefik/dynamic.yml")).unwrap();
        assert!(yaml.contains("oauth2-errors"));
        assert!(yaml.contains("siteio-auth"));

        // removing every field drops the policy entirely
        let clear = Request::builder()
            .method("PATCH")
            .uri("/sites/s1/auth")
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .body(Body::from(json!({"allowedDomain": ""}).to_string()))
            .unwrap();
        let (status, _) = send(&state, clear).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state
            .deployer
            .sites
            .get_metadata("s1")
            .unwrap()
            .unwrap()
            .oauth
            .is_none());

        let (status, _) = send(
            &state,
            Request::builder()
                .method("PATCH")
                .uri("/sites/missing/auth")
                .header("x-api-key", KEY)
                .header("content-type", "application/json")
                .body(Body::from(json!({"remove": true}).to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auth_check_runs_the_decision_table_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), true);
        send(&state, upload_zip("bar", zip_bundle(&[("index.html", b"x")]))).await;
        let patch = Request::builder()
            .method("PATCH")
            .uri("/sites/bar/auth")
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .body(Body::from(json!({"allowedEmails": ["alice@x"]}).to_string()))
            .unwrap();
        send(&state, patch).await;

        let check = |host: &str, email: Option<&str>| {
            let mut builder = Request::builder()
                .uri("/auth/check")
                .header("x-forwarded-host", host);
            if let Some(email) = email {
                builder = builder.header("x-forwarded-email", email);
            }
            builder.body(Body::empty()).unwrap()
        };

        let app = router(state.clone());
        let response = app.clone().oneshot(check("bar.op.example", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(check("bar.op.example", Some("ALICE@X")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(check("bar.op.example", Some("bob@x")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        let html = String::from_utf8(
            response
                .into_body()
                .collect()
                .await
                .unwrap()
                .to_bytes()
                .to_vec(),
        )
        .unwrap();
        assert!(html.contains("bob@x"));
        assert!(html.contains("https://auth.op.example/oauth2/sign_out?rd="));

        // api subdomain and unknown resources pass through
        let response = app
            .clone()
            .oneshot(check("api.op.example", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(check("ghost.op.example", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn site_delete_cascades_to_the_mirror_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);
        send(&state, upload_zip("s1", zip_bundle(&[("index.html", b"x")]))).await;

        let request = Request::builder()
            .method("DELETE")
            .uri("/sites/s1")
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&state, get("/apps/s1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let yaml = std::fs::read_to_string(dir.path().join("traefik/dynamic.yml")).unwrap();
        assert!(!yaml.contains("site-s1"));

        let request = Request::builder()
            .method("DELETE")
            .uri("/sites/s1")
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn site_download_round_trips_the_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);
        send(&state, upload_zip("s1", zip_bundle(&[("index.html", b"payload")]))).await;

        let response = router(state.clone())
            .oneshot(get("/sites/s1/download"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/zip"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        let mut file = archive.by_name("index.html").unwrap();
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut contents).unwrap();
        assert_eq!(contents, b"payload");

        let (status, _) = send(&state, get("/sites/ghost/download")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rollback_endpoint_restores_and_rejects_unknown_versions() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);
        send(&state, upload_zip("s1", zip_bundle(&[("index.html", b"v1")]))).await;
        send(&state, upload_zip("s1", zip_bundle(&[("index.html", b"v2")]))).await;

        let (status, body) = send(&state, post_json("/sites/s1/rollback", json!({"version": 1}))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(
            std::fs::read(dir.path().join("sites/s1/index.html")).unwrap(),
            b"v1"
        );

        let (status, _) =
            send(&state, post_json("/sites/s1/rollback", json!({"version": 42}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn group_crud_flows_through_the_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);

        let (status, body) = send(
            &state,
            post_json("/groups", json!({"name": "Admins", "emails": ["A@x.com"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["name"], "admins");

        let (status, _) = send(&state, post_json("/groups", json!({"name": "admins"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &state,
            post_json("/groups/admins/emails", json!({"emails": ["b@x.com"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["emails"].as_array().unwrap().len(), 2);

        let request = Request::builder()
            .method("DELETE")
            .uri("/groups/admins/emails")
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .body(Body::from(json!({"emails": ["a@x.com"]}).to_string()))
            .unwrap();
        let (status, body) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["emails"], json!(["b@x.com"]));

        let (status, _) = send(&state, get("/groups/ghost")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method("DELETE")
            .uri("/groups/admins")
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&state, get("/groups")).await;
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn app_restart_without_container_says_deploy_first() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);
        // only reachable when no docker daemon is needed for the check
        let app = json!({"name": "web", "image": "nginx:alpine", "internalPort": 80});
        send(&state, post_json("/apps", app)).await;

        let (status, body) = send(&state, post_json("/apps/web/restart", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("deploy first"));
    }
}
