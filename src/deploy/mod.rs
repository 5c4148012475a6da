use anyhow::{anyhow, Context};
use chrono::Utc;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::config::oauth::OAuthServerConfig;
use crate::config::AgentConfig;
use crate::edge::EdgeController;
use crate::git::Git;
use crate::locks::NameLocks;
use crate::runtime::{self, labels, Docker, RunConfig};
use crate::store::apps::{App, AppSource, AppStatus, AppStore, AppType};
use crate::store::sites::{SiteMetadata, SiteStore};
use crate::store::{validate_name, OAuthPolicy, PolicyPatch};

/// Per-resource state machine: takes apps and sites from declared to
/// running and back, keeping the mirrored records and the proxy
/// configuration consistent. Same-name operations are serialized through
/// the lock registry.
pub struct Deployer {
    pub config: AgentConfig,
    pub docker: Docker,
    pub git: Git,
    pub apps: AppStore,
    pub sites: SiteStore,
    pub edge: Arc<EdgeController>,
    pub oauth: Arc<RwLock<Option<OAuthServerConfig>>>,
    locks: NameLocks,
}

impl Deployer {
    pub fn new(
        config: AgentConfig,
        docker: Docker,
        git: Git,
        apps: AppStore,
        sites: SiteStore,
        edge: Arc<EdgeController>,
        oauth: Arc<RwLock<Option<OAuthServerConfig>>>,
    ) -> Self {
        Self {
            config,
            docker,
            git,
            apps,
            sites,
            edge,
            oauth,
            locks: NameLocks::new(),
        }
    }

    pub fn oauth_enabled(&self) -> bool {
        self.oauth
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Rewrite the proxy's dynamic configuration from the current site
    /// list.
    pub async fn refresh_edge(&self) -> ApiResult<()> {
        let sites = self.sites.list()?;
        self.edge.refresh(&sites, self.oauth_enabled()).await?;
        Ok(())
    }

    pub async fn create_app(&self, app: App) -> ApiResult<App> {
        validate_name(&app.name).map_err(|e| ApiError::bad_request(e.to_string()))?;
        if let Some(oauth) = &app.oauth {
            if !oauth.is_cleared() && !self.oauth_enabled() {
                return Err(ApiError::bad_request(
                    "cannot set an access policy: OIDC is not configured",
                ));
            }
        }

        let _guard = self.locks.acquire(&app.name).await;
        if self.apps.get(&app.name)?.is_some() || self.sites.exists(&app.name) {
            return Err(ApiError::bad_request(format!(
                "name '{}' is already in use",
                app.name
            )));
        }
        Ok(self.apps.create(app)?)
    }

    pub async fn update_app(&self, name: &str, update: UpdateAppRequest) -> ApiResult<App> {
        let _guard = self.locks.acquire(name).await;
        let mut app = self
            .apps
            .get(name)?
            .ok_or_else(|| ApiError::not_found(format!("app '{}' not found", name)))?;

        match (update.image, update.git) {
            (Some(_), Some(_)) => {
                return Err(ApiError::bad_request(
                    "exactly one of image or git must be set, not both",
                ))
            }
            (Some(image), None) => app.source = AppSource::Image(image),
            (None, Some(git)) => app.source = AppSource::Git(git),
            (None, None) => {}
        }

        if let Some(port) = update.internal_port {
            app.internal_port = port;
        }
        if let Some(env) = update.env {
            app.env = env;
        }
        if let Some(volumes) = update.volumes {
            app.volumes = volumes;
        }
        if let Some(policy) = update.restart_policy {
            app.restart_policy = policy;
        }
        let domains_changed = update.domains.is_some();
        if let Some(domains) = update.domains {
            app.domains = normalize_domains(domains)?;
        }

        let oauth_changed = update.oauth.is_some();
        if let Some(oauth) = update.oauth {
            match oauth {
                Some(policy) => {
                    if !self.oauth_enabled() {
                        return Err(ApiError::bad_request(
                            "cannot set an access policy: OIDC is not configured",
                        ));
                    }
                    app.oauth = Some(policy.normalized());
                }
                None => app.oauth = None,
            }
        }

        self.apps.save(&mut app)?;

        // Mirrored site records follow the app's policy and extra domains.
        if app.app_type == AppType::Static && (oauth_changed || domains_changed) {
            self.sites.update_oauth(name, app.oauth.clone())?;
            let extra = if app.domains.is_empty() {
                None
            } else {
                Some(app.domains.clone())
            };
            self.sites.update_domains(name, extra)?;
            self.refresh_edge().await?;
        }

        Ok(app)
    }

    /// Take an app from declared to running: clone/build or pull, replace
    /// any existing container, record the outcome. Failures persist
    /// `failed` before surfacing.
    pub async fn deploy_app(&self, name: &str, no_cache: bool) -> ApiResult<App> {
        let _guard = self.locks.acquire(name).await;
        let mut app = self
            .apps
            .get(name)?
            .ok_or_else(|| ApiError::not_found(format!("app '{}' not found", name)))?;
        if app.app_type == AppType::Static {
            return Err(ApiError::bad_request(
                "static sites are published through the sites endpoint",
            ));
        }

        match self.run_deploy(&mut app, no_cache).await {
            Ok(()) => {
                self.apps.save(&mut app)?;
                info!("deployed app '{}'", name);
                Ok(app)
            }
            Err(e) => {
                app.status = AppStatus::Failed;
                if let Err(save_err) = self.apps.save(&mut app) {
                    warn!("failed to record deploy failure for '{}': {}", name, save_err);
                }
                Err(e)
            }
        }
    }

    async fn run_deploy(&self, app: &mut App, no_cache: bool) -> ApiResult<()> {
        if !self.docker.is_available().await {
            return Err(ApiError::Internal(anyhow!(
                "container runtime is not available"
            )));
        }
        self.docker.ensure_network().await?;

        let container = runtime::container_name(&app.name);
        if self.docker.container_exists(&container).await {
            self.docker.remove(&container).await?;
        }

        let image_to_run = match app.source.clone() {
            AppSource::Git(source) => {
                self.git
                    .clone_repo(&app.name, &source.repo_url, &source.branch)
                    .await?;

                let mut context_path = self.git.repo_path(&app.name);
                if let Some(context) = &source.context {
                    context_path = context_path.join(context);
                }
                let dockerfile = context_path.join(&source.dockerfile);
                if !dockerfile.is_file() {
                    return Err(ApiError::bad_request(format!(
                        "Dockerfile not found at {}",
                        dockerfile.display()
                    )));
                }

                let tag = runtime::image_tag(&app.name);
                self.docker
                    .build(&crate::runtime::BuildConfig {
                        context_path,
                        dockerfile: source.dockerfile.clone(),
                        tag: tag.clone(),
                        build_args: Default::default(),
                        no_cache,
                    })
                    .await?;

                app.commit_hash = Some(self.git.commit_hash(&app.name).await?);
                app.last_build_at = Some(Utc::now());
                tag
            }
            AppSource::Image(image) => {
                self.docker.pull(&image).await?;
                image
            }
        };

        let domains = app.effective_domains(&self.config.domain);
        let require_auth = app.oauth.is_some() && self.oauth_enabled();
        let labels = labels::traefik_labels(&app.name, &domains, app.internal_port, require_auth);

        runtime::ensure_volume_dirs(&self.docker, &app.name, &app.volumes)
            .context("failed to prepare volume directories")?;
        let binds = app
            .volumes
            .iter()
            .map(|mount| self.docker.bind_spec(&app.name, mount))
            .collect();

        let container_id = self
            .docker
            .run(&RunConfig {
                name: container,
                image: image_to_run,
                env: app.env.clone(),
                binds,
                restart_policy: app.restart_policy,
                network: runtime::NETWORK.to_string(),
                labels,
                ..Default::default()
            })
            .await?;

        app.status = AppStatus::Running;
        app.container_id = Some(container_id);
        app.deployed_at = Some(Utc::now());
        Ok(())
    }

    pub async fn stop_app(&self, name: &str) -> ApiResult<App> {
        let _guard = self.locks.acquire(name).await;
        let mut app = self
            .apps
            .get(name)?
            .ok_or_else(|| ApiError::not_found(format!("app '{}' not found", name)))?;
        if app.app_type == AppType::Static {
            return Err(ApiError::bad_request(
                "static sites are published through the sites endpoint",
            ));
        }

        let container = runtime::container_name(name);
        if self.docker.container_exists(&container).await {
            self.docker.stop(&container).await?;
        }
        app.status = AppStatus::Stopped;
        self.apps.save(&mut app)?;
        Ok(app)
    }

    pub async fn restart_app(&self, name: &str) -> ApiResult<App> {
        let _guard = self.locks.acquire(name).await;
        let mut app = self
            .apps
            .get(name)?
            .ok_or_else(|| ApiError::not_found(format!("app '{}' not found", name)))?;
        if app.app_type == AppType::Static {
            return Err(ApiError::bad_request(
                "static sites are published through the sites endpoint",
            ));
        }

        let container = runtime::container_name(name);
        if !self.docker.container_exists(&container).await {
            return Err(ApiError::bad_request(format!(
                "app '{}' has no container; deploy first",
                name
            )));
        }
        self.docker.restart(&container).await?;
        app.status = AppStatus::Running;
        self.apps.save(&mut app)?;
        Ok(app)
    }

    /// Delete an app and everything it owns. Cleanup is best-effort: a
    /// stuck artifact must not keep the record alive.
    pub async fn delete_app(&self, name: &str) -> ApiResult<()> {
        let _guard = self.locks.acquire(name).await;
        let app = self
            .apps
            .get(name)?
            .ok_or_else(|| ApiError::not_found(format!("app '{}' not found", name)))?;

        if app.app_type == AppType::Static {
            // Mirrored record: cascade through the site side.
            if let Err(e) = self.sites.delete(name) {
                warn!("failed to remove site '{}': {:#}", name, e);
            }
            self.apps.delete(name)?;
            self.refresh_edge().await?;
            return Ok(());
        }

        let container = runtime::container_name(name);
        if let Err(e) = self.docker.remove(&container).await {
            warn!("failed to remove container {}: {}", container, e);
        }
        if let Err(e) = self.git.remove(name) {
            warn!("failed to remove clone for '{}': {}", name, e);
        }
        if matches!(app.source, AppSource::Git(_)) {
            let tag = runtime::image_tag(name);
            if let Err(e) = self.docker.remove_image(&tag).await {
                warn!("failed to remove image {}: {}", tag, e);
            }
        }
        self.apps.delete(name)?;
        Ok(())
    }

    pub async fn app_logs(&self, name: &str, tail: u32) -> ApiResult<String> {
        let app = self
            .apps
            .get(name)?
            .ok_or_else(|| ApiError::not_found(format!("app '{}' not found", name)))?;
        if app.app_type == AppType::Static {
            return Err(ApiError::bad_request("static sites have no container logs"));
        }

        let container = runtime::container_name(name);
        if !self.docker.container_exists(&container).await {
            return Err(ApiError::bad_request(format!(
                "app '{}' has no container; deploy first",
                name
            )));
        }
        Ok(self.docker.logs(&container, tail).await?)
    }

    /// Publish or replace a site: unpack the bundle, mirror the app record
    /// and surface the new router to the proxy.
    pub async fn publish_site(
        &self,
        subdomain: &str,
        zip_bytes: &[u8],
        header_policy: Option<OAuthPolicy>,
    ) -> ApiResult<SiteMetadata> {
        validate_name(subdomain).map_err(|e| ApiError::bad_request(e.to_string()))?;

        let _guard = self.locks.acquire(subdomain).await;
        if let Some(existing) = self.apps.get(subdomain)? {
            if existing.app_type != AppType::Static {
                return Err(ApiError::bad_request(format!(
                    "name '{}' is already in use by an app",
                    subdomain
                )));
            }
        }

        SiteStore::validate_bundle(zip_bytes).map_err(|e| ApiError::bad_request(format!("{:#}", e)))?;

        let previous = self.sites.get_metadata(subdomain)?;
        let policy = header_policy
            .map(|p| p.normalized())
            .or_else(|| previous.and_then(|m| m.oauth));

        let meta = self
            .sites
            .extract_and_store(subdomain, zip_bytes, policy.clone())?;

        match self.apps.get(subdomain)? {
            Some(mut mirror) => {
                mirror.oauth = policy;
                mirror.status = AppStatus::Running;
                mirror.deployed_at = Some(Utc::now());
                self.apps.save(&mut mirror)?;
            }
            None => {
                self.apps.create(App::static_site(
                    subdomain,
                    &self.sites.site_dir(subdomain),
                    policy,
                ))?;
            }
        }

        self.refresh_edge().await?;
        info!("published site '{}'", subdomain);
        Ok(meta)
    }

    pub async fn delete_site(&self, subdomain: &str) -> ApiResult<()> {
        let _guard = self.locks.acquire(subdomain).await;
        if !self.sites.delete(subdomain)? {
            return Err(ApiError::not_found(format!(
                "site '{}' not found",
                subdomain
            )));
        }
        self.apps.delete(subdomain)?;
        self.refresh_edge().await?;
        Ok(())
    }

    /// Restore a retained snapshot; defaults to the newest one.
    pub async fn rollback_site(
        &self,
        subdomain: &str,
        version: Option<u32>,
    ) -> ApiResult<SiteMetadata> {
        let _guard = self.locks.acquire(subdomain).await;
        if !self.sites.exists(subdomain) {
            return Err(ApiError::not_found(format!(
                "site '{}' not found",
                subdomain
            )));
        }

        let versions = self.sites.versions(subdomain)?;
        let target = match version {
            Some(v) => {
                if !versions.iter().any(|info| info.version == v) {
                    return Err(ApiError::not_found(format!(
                        "version {} not found for site '{}'",
                        v, subdomain
                    )));
                }
                v
            }
            None => versions
                .first()
                .map(|info| info.version)
                .ok_or_else(|| {
                    ApiError::bad_request(format!("site '{}' has no history", subdomain))
                })?,
        };

        let meta = self.sites.rollback(subdomain, target)?;
        if let Some(mut mirror) = self.apps.get(subdomain)? {
            mirror.deployed_at = Some(Utc::now());
            self.apps.save(&mut mirror)?;
        }
        info!("rolled back site '{}' to v{}", subdomain, target);
        Ok(meta)
    }

    /// Merge a policy patch into a site, keeping the mirrored app record in
    /// step and updating the proxy's middleware chain.
    pub async fn patch_site_policy(&self, subdomain: &str, patch: PolicyPatch) -> ApiResult<()> {
        let _guard = self.locks.acquire(subdomain).await;
        let meta = self
            .sites
            .get_metadata(subdomain)?
            .ok_or_else(|| ApiError::not_found(format!("site '{}' not found", subdomain)))?;

        let effective = patch.apply(meta.oauth.as_ref());
        if effective.is_some() && !self.oauth_enabled() {
            return Err(ApiError::bad_request(
                "cannot set an access policy: OIDC is not configured",
            ));
        }

        self.sites.update_oauth(subdomain, effective.clone())?;
        if let Some(mut mirror) = self.apps.get(subdomain)? {
            mirror.oauth = effective;
            self.apps.save(&mut mirror)?;
        }
        self.refresh_edge().await?;
        Ok(())
    }
}

/// Partial update for an app record; `name` and `createdAt` are immutable.
/// A `null` oauth clears the policy, an absent one leaves it untouched.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAppRequest {
    pub image: Option<String>,
    pub git: Option<crate::store::apps::GitSource>,
    pub internal_port: Option<u16>,
    pub env: Option<std::collections::BTreeMap<String, String>>,
    pub volumes: Option<Vec<crate::runtime::VolumeMount>>,
    pub restart_policy: Option<crate::runtime::RestartPolicy>,
    pub domains: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub oauth: Option<Option<OAuthPolicy>>,
}

/// Distinguishes an absent field from an explicit `null`.
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    serde::Deserialize::deserialize(deserializer).map(Some)
}

/// Lowercase and sanity-check a domain list.
pub fn normalize_domains(domains: Vec<String>) -> ApiResult<Vec<String>> {
    let mut normalized = Vec::with_capacity(domains.len());
    for domain in domains {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty()
            || domain.contains('/')
            || domain.contains(':')
            || domain.contains(char::is_whitespace)
            || !domain.contains('.')
        {
            return Err(ApiError::bad_request(format!(
                "'{}' is not a valid domain name",
                domain
            )));
        }
        normalized.push(domain);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_distinguishes_null_from_absent_oauth() {
        let absent: UpdateAppRequest = serde_json::from_str("{}").unwrap();
        assert!(absent.oauth.is_none());

        let null: UpdateAppRequest = serde_json::from_str(r#"{"oauth": null}"#).unwrap();
        assert_eq!(null.oauth, Some(None));

        let set: UpdateAppRequest =
            serde_json::from_str(r#"{"oauth": {"allowedDomain": "x.com"}}"#).unwrap();
        assert_eq!(
            set.oauth.unwrap().unwrap().allowed_domain.as_deref(),
            Some("x.com")
        );
    }

    #[test]
    fn domains_are_lowercased_and_checked() {
        assert_eq!(
            normalize_domains(vec![" Web.Example.COM ".to_string()]).unwrap(),
            vec!["web.example.com"]
        );
        assert!(normalize_domains(vec!["".to_string()]).is_err());
        assert!(normalize_domains(vec!["no-dots".to_string()]).is_err());
        assert!(normalize_domains(vec!["http://x.com".to_string()]).is_err());
    }
}
