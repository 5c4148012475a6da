pub mod dynamic;
pub mod tls;

use anyhow::{bail, Context, Result};
use minijinja::Environment;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::oauth::OAuthServerConfig;
use crate::config::AgentConfig;
use crate::runtime::{Docker, RestartPolicy, RunConfig, NETWORK};
use crate::store::sites::SiteMetadata;
use tls::TlsStatus;

const TRAEFIK_STATIC_TEMPLATE: &str = include_str!("../../templates/traefik.yml.j2");
const NGINX_DEFAULT_CONF: &str = include_str!("../../templates/nginx-default.conf.j2");

pub const TRAEFIK_CONTAINER: &str = "siteio-traefik";
pub const STATIC_CONTAINER: &str = "siteio-static";
pub const SIDECAR_CONTAINER: &str = "siteio-oauth2-proxy";

pub const TRAEFIK_IMAGE: &str = "traefik:v3.1";
pub const STATIC_IMAGE: &str = "nginx:alpine";
pub const SIDECAR_IMAGE: &str = "quay.io/oauth2-proxy/oauth2-proxy:v7.6.0";

const READY_POLL: Duration = Duration::from_millis(500);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const ADMIN_URL: &str = "http://127.0.0.1:8080";

/// Summary of one managed container for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedContainer {
    pub running: bool,
    pub status: String,
}

/// Owns the proxy configuration files and the three managed infrastructure
/// containers: the edge proxy, the shared static server and the OIDC
/// sidecar.
pub struct EdgeController {
    config: AgentConfig,
    docker: Docker,
    write_lock: Mutex<()>,
    admin_url: String,
}

impl EdgeController {
    pub fn new(config: AgentConfig, docker: Docker) -> Self {
        Self {
            config,
            docker,
            write_lock: Mutex::new(()),
            admin_url: ADMIN_URL.to_string(),
        }
    }

    fn traefik_dir(&self) -> PathBuf {
        self.config.data_dir.join("traefik")
    }

    fn certs_dir(&self) -> PathBuf {
        self.config.data_dir.join("certs")
    }

    fn nginx_dir(&self) -> PathBuf {
        self.config.data_dir.join("nginx")
    }

    fn dynamic_path(&self) -> PathBuf {
        self.traefik_dir().join("dynamic.yml")
    }

    /// Control-plane URL as seen from inside the proxy's network namespace.
    fn control_plane_url(&self) -> String {
        format!("http://host.docker.internal:{}", self.config.api_port)
    }

    fn static_server_url(&self) -> String {
        format!("http://{}:80", STATIC_CONTAINER)
    }

    fn sidecar_url(&self) -> String {
        format!("http://{}:4180", SIDECAR_CONTAINER)
    }

    /// Bring up the managed containers from a cold start. Stale containers
    /// of the same names are removed first.
    pub async fn start(
        &self,
        oauth: Option<&OAuthServerConfig>,
        sites: &[SiteMetadata],
    ) -> Result<()> {
        info!("starting edge controller");
        self.write_static_config()?;
        self.write_nginx_config()?;
        self.ensure_acme_store()?;
        self.write_dynamic(sites, oauth.is_some()).await?;

        self.docker
            .ensure_network()
            .await
            .context("failed to ensure the shared network")?;

        for name in [SIDECAR_CONTAINER, STATIC_CONTAINER, TRAEFIK_CONTAINER] {
            let _ = self.docker.remove(name).await;
        }

        self.launch_traefik().await?;
        self.wait_running(TRAEFIK_CONTAINER).await?;
        self.launch_static_server().await?;
        self.wait_running(STATIC_CONTAINER).await?;

        if let Some(config) = oauth {
            self.launch_sidecar(config).await?;
            self.wait_running(SIDECAR_CONTAINER).await?;
        }

        info!("edge containers running");
        Ok(())
    }

    /// Stop the managed containers in reverse launch order. Best-effort:
    /// a stuck container must not block shutdown.
    pub async fn stop(&self) {
        info!("stopping edge containers");
        for name in [SIDECAR_CONTAINER, STATIC_CONTAINER, TRAEFIK_CONTAINER] {
            if self.docker.container_exists(name).await {
                if let Err(e) = self.docker.stop(name).await {
                    warn!("failed to stop {}: {}", name, e);
                }
            }
        }
    }

    /// Apply a changed OIDC config: replace (or remove) the sidecar.
    pub async fn restart_sidecar(&self, oauth: Option<&OAuthServerConfig>) -> Result<()> {
        let _ = self.docker.remove(SIDECAR_CONTAINER).await;
        if let Some(config) = oauth {
            self.launch_sidecar(config).await?;
            self.wait_running(SIDECAR_CONTAINER).await?;
        }
        Ok(())
    }

    /// Rewrite the dynamic proxy configuration from the current site list.
    pub async fn refresh(&self, sites: &[SiteMetadata], oauth_enabled: bool) -> Result<()> {
        self.write_dynamic(sites, oauth_enabled).await
    }

    async fn write_dynamic(&self, sites: &[SiteMetadata], oauth_enabled: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let config = dynamic::build(
            &self.config.domain,
            sites,
            oauth_enabled,
            &self.control_plane_url(),
            &self.static_server_url(),
            &self.sidecar_url(),
        );
        let yaml = serde_yaml::to_string(&config).context("failed to serialize dynamic config")?;

        let dir = self.traefik_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        // The proxy watches this file; never let it observe a partial write.
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .context("failed to create temp dynamic config")?;
        tmp.write_all(yaml.as_bytes())
            .context("failed to write dynamic config")?;
        tmp.persist(self.dynamic_path())
            .context("failed to replace dynamic config")?;
        Ok(())
    }

    fn write_static_config(&self) -> Result<()> {
        let mut env = Environment::new();
        env.add_template("traefik.yml", TRAEFIK_STATIC_TEMPLATE)?;
        let template = env.get_template("traefik.yml")?;
        let rendered = template.render(minijinja::context! {
            acme_email => &self.config.acme_email,
            network => NETWORK,
        })?;

        let dir = self.traefik_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        fs::write(dir.join("traefik.yml"), rendered).context("failed to write traefik.yml")?;
        Ok(())
    }

    fn write_nginx_config(&self) -> Result<()> {
        let dir = self.nginx_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        fs::write(dir.join("default.conf"), NGINX_DEFAULT_CONF)
            .context("failed to write nginx config")?;
        Ok(())
    }

    /// The cert store belongs to the proxy; we only guarantee it exists
    /// with the permissions ACME insists on.
    fn ensure_acme_store(&self) -> Result<()> {
        let dir = self.certs_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let acme = dir.join("acme.json");
        if !acme.exists() {
            fs::write(&acme, b"").context("failed to create acme.json")?;
        }
        fs::set_permissions(&acme, fs::Permissions::from_mode(0o600))
            .context("failed to restrict acme.json")?;
        Ok(())
    }

    async fn launch_traefik(&self) -> Result<()> {
        let run = RunConfig {
            name: TRAEFIK_CONTAINER.to_string(),
            image: TRAEFIK_IMAGE.to_string(),
            binds: vec![
                "/var/run/docker.sock:/var/run/docker.sock:ro".to_string(),
                format!("{}:/etc/traefik", self.traefik_dir().display()),
                format!("{}:/certs", self.certs_dir().display()),
            ],
            restart_policy: RestartPolicy::UnlessStopped,
            network: NETWORK.to_string(),
            ports: vec![
                format!("{}:80", self.config.http_port),
                format!("{}:443", self.config.https_port),
                "127.0.0.1:8080:8080".to_string(),
            ],
            extra_hosts: vec!["host.docker.internal:host-gateway".to_string()],
            ..Default::default()
        };
        self.docker.run(&run).await.context("failed to start the edge proxy")?;
        Ok(())
    }

    async fn launch_static_server(&self) -> Result<()> {
        let run = RunConfig {
            name: STATIC_CONTAINER.to_string(),
            image: STATIC_IMAGE.to_string(),
            binds: vec![
                format!("{}:/sites:ro", self.config.data_dir.join("sites").display()),
                format!(
                    "{}:/etc/nginx/conf.d/default.conf:ro",
                    self.nginx_dir().join("default.conf").display()
                ),
            ],
            restart_policy: RestartPolicy::UnlessStopped,
            network: NETWORK.to_string(),
            ..Default::default()
        };
        self.docker
            .run(&run)
            .await
            .context("failed to start the static server")?;
        Ok(())
    }

    async fn launch_sidecar(&self, oauth: &OAuthServerConfig) -> Result<()> {
        let mut env = BTreeMap::new();
        env.insert("OAUTH2_PROXY_PROVIDER".to_string(), "oidc".to_string());
        env.insert(
            "OAUTH2_PROXY_OIDC_ISSUER_URL".to_string(),
            oauth.issuer_url.clone(),
        );
        env.insert("OAUTH2_PROXY_CLIENT_ID".to_string(), oauth.client_id.clone());
        env.insert(
            "OAUTH2_PROXY_CLIENT_SECRET".to_string(),
            oauth.client_secret.clone(),
        );
        env.insert(
            "OAUTH2_PROXY_COOKIE_SECRET".to_string(),
            oauth.cookie_secret.clone(),
        );
        env.insert(
            "OAUTH2_PROXY_COOKIE_DOMAINS".to_string(),
            oauth.cookie_domain.clone(),
        );
        env.insert(
            "OAUTH2_PROXY_WHITELIST_DOMAINS".to_string(),
            format!(".{}", self.config.domain),
        );
        env.insert("OAUTH2_PROXY_SET_XAUTHREQUEST".to_string(), "true".to_string());
        env.insert("OAUTH2_PROXY_REVERSE_PROXY".to_string(), "true".to_string());
        env.insert("OAUTH2_PROXY_EMAIL_DOMAINS".to_string(), "*".to_string());
        env.insert("OAUTH2_PROXY_COOKIE_SECURE".to_string(), "true".to_string());
        env.insert(
            "OAUTH2_PROXY_HTTP_ADDRESS".to_string(),
            "0.0.0.0:4180".to_string(),
        );
        // No fixed redirect URL: it is derived from each request's host,
        // which is what lets one sidecar serve every subdomain.
        env.insert(
            "OAUTH2_PROXY_UPSTREAMS".to_string(),
            self.control_plane_url(),
        );

        let run = RunConfig {
            name: SIDECAR_CONTAINER.to_string(),
            image: SIDECAR_IMAGE.to_string(),
            env,
            restart_policy: RestartPolicy::UnlessStopped,
            network: NETWORK.to_string(),
            extra_hosts: vec!["host.docker.internal:host-gateway".to_string()],
            ..Default::default()
        };
        self.docker
            .run(&run)
            .await
            .context("failed to start the OIDC sidecar")?;
        Ok(())
    }

    /// Poll until the container reports `Running`; on timeout, surface its
    /// recent logs so the operator sees why it never came up.
    async fn wait_running(&self, name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        loop {
            if self.docker.is_running(name).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let logs = self
                    .docker
                    .logs(name, 50)
                    .await
                    .unwrap_or_else(|e| format!("<no logs: {}>", e));
                bail!("container {} did not reach Running state: {}", name, logs.trim());
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// State of the managed containers for status reporting.
    pub async fn container_statuses(&self) -> BTreeMap<String, ManagedContainer> {
        let mut statuses = BTreeMap::new();
        for name in [TRAEFIK_CONTAINER, STATIC_CONTAINER, SIDECAR_CONTAINER] {
            let summary = match self.docker.inspect(name).await {
                Ok(info) => ManagedContainer {
                    running: info.state.running,
                    status: info.state.status,
                },
                Err(_) => ManagedContainer {
                    running: false,
                    status: "absent".to_string(),
                },
            };
            statuses.insert(name.to_string(), summary);
        }
        statuses
    }

    /// Per-router TLS status, observed with real connections.
    pub async fn tls_report(&self) -> Result<BTreeMap<String, TlsStatus>> {
        tls::router_tls_status(&self.admin_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_config(data_dir: &Path) -> AgentConfig {
        AgentConfig {
            domain: "op".to_string(),
            acme_email: "admin@op".to_string(),
            api_key: "k".to_string(),
            data_dir: data_dir.to_path_buf(),
            http_port: 80,
            https_port: 443,
            api_port: 3000,
            max_upload_size: 1024,
        }
    }

    fn controller(data_dir: &Path) -> EdgeController {
        EdgeController::new(test_config(data_dir), Docker::new(data_dir.to_path_buf()))
    }

    #[test]
    fn static_config_renders_the_acme_email_and_network() {
        let dir = tempfile::tempdir().unwrap();
        let edge = controller(dir.path());
        edge.write_static_config().unwrap();

        let rendered = fs::read_to_string(dir.path().join("traefik/traefik.yml")).unwrap();
        assert!(rendered.contains("email: admin@op"));
        assert!(rendered.contains("network: siteio"));
        assert!(rendered.contains("exposedByDefault: false"));
        assert!(rendered.contains("httpChallenge"));
    }

    #[test]
    fn nginx_config_extracts_the_leading_host_label() {
        let dir = tempfile::tempdir().unwrap();
        let edge = controller(dir.path());
        edge.write_nginx_config().unwrap();

        let conf = fs::read_to_string(dir.path().join("nginx/default.conf")).unwrap();
        assert!(conf.contains("server_name ~^(?<subdomain>[a-z0-9-]+)\\."));
        assert!(conf.contains("root /sites/$subdomain;"));
        assert!(conf.contains("return 404;"));
    }

    #[test]
    fn acme_store_is_created_locked_down() {
        let dir = tempfile::tempdir().unwrap();
        let edge = controller(dir.path());
        edge.ensure_acme_store().unwrap();

        let path = dir.path().join("certs/acme.json");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // idempotent, content untouched
        fs::write(&path, b"{\"account\":1}").unwrap();
        edge.ensure_acme_store().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"account\":1}");
    }

    #[tokio::test]
    async fn dynamic_config_is_written_atomically_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let edge = controller(dir.path());

        edge.write_dynamic(&[], false).await.unwrap();
        let yaml = fs::read_to_string(edge.dynamic_path()).unwrap();
        assert!(yaml.contains("Host(`api.op`)"));

        // a rewrite replaces, never appends
        edge.write_dynamic(&[], true).await.unwrap();
        let yaml = fs::read_to_string(edge.dynamic_path()).unwrap();
        assert!(yaml.contains("oauth2-catchall"));
        assert_eq!(yaml.matches("api:").count(), 1);
    }
}
