use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::runtime::{RestartPolicy, VolumeMount};
use crate::store::{validate_name, OAuthPolicy};

/// Image backing the shared static-file server and every mirrored site app.
pub const STATIC_SERVER_IMAGE: &str = "nginx:alpine";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    #[default]
    Container,
    Static,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSource {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

/// Where an app's bits come from. The wire shape stays the optional pair
/// `{image?, git?}` for compatibility; deserialization rejects both or
/// neither being present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSource", into = "RawSource")]
pub enum AppSource {
    Image(String),
    Git(GitSource),
}

#[derive(Serialize, Deserialize)]
struct RawSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git: Option<GitSource>,
}

impl TryFrom<RawSource> for AppSource {
    type Error = String;

    fn try_from(raw: RawSource) -> Result<Self, Self::Error> {
        match (raw.image, raw.git) {
            (Some(image), None) if !image.trim().is_empty() => Ok(AppSource::Image(image)),
            (None, Some(git)) if !git.repo_url.trim().is_empty() => Ok(AppSource::Git(git)),
            (Some(_), Some(_)) => Err("exactly one of image or git must be set, not both".into()),
            _ => Err("exactly one of image or git must be set".into()),
        }
    }
}

impl From<AppSource> for RawSource {
    fn from(source: AppSource) -> Self {
        match source {
            AppSource::Image(image) => RawSource {
                image: Some(image),
                git: None,
            },
            AppSource::Git(git) => RawSource {
                image: None,
                git: Some(git),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    #[default]
    Pending,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthPolicy>,
    #[serde(default)]
    pub status: AppStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// Fresh declared record; observable state starts at `pending`.
    pub fn new(
        name: String,
        source: AppSource,
        app_type: AppType,
        internal_port: u16,
    ) -> Self {
        let now = Utc::now();
        Self {
            name,
            source,
            app_type,
            internal_port,
            env: BTreeMap::new(),
            volumes: Vec::new(),
            restart_policy: RestartPolicy::default(),
            domains: Vec::new(),
            oauth: None,
            status: AppStatus::Pending,
            container_id: None,
            deployed_at: None,
            commit_hash: None,
            last_build_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mirror record for a deployed site: the extracted directory mounted
    /// read-only into the shared static server.
    pub fn static_site(name: &str, site_dir: &Path, oauth: Option<OAuthPolicy>) -> Self {
        let mut app = App::new(
            name.to_string(),
            AppSource::Image(STATIC_SERVER_IMAGE.to_string()),
            AppType::Static,
            80,
        );
        app.volumes = vec![VolumeMount {
            host_name: site_dir.to_string_lossy().to_string(),
            mount_path: "/usr/share/nginx/html".to_string(),
            readonly: true,
        }];
        app.oauth = oauth;
        app.status = AppStatus::Running;
        app.deployed_at = Some(Utc::now());
        app
    }

    /// Domains the app is reachable at, defaulting to its subdomain of the
    /// operator zone.
    pub fn effective_domains(&self, operator_domain: &str) -> Vec<String> {
        if self.domains.is_empty() {
            vec![format!("{}.{}", self.name, operator_domain)]
        } else {
            self.domains.clone()
        }
    }
}

/// Summary view for list endpoints: everything except env and volumes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    #[serde(flatten)]
    pub source: AppSource,
    #[serde(rename = "type")]
    pub app_type: AppType,
    pub internal_port: u16,
    pub restart_policy: RestartPolicy,
    pub domains: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthPolicy>,
    pub status: AppStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&App> for AppInfo {
    fn from(app: &App) -> Self {
        Self {
            name: app.name.clone(),
            source: app.source.clone(),
            app_type: app.app_type,
            internal_port: app.internal_port,
            restart_policy: app.restart_policy,
            domains: app.domains.clone(),
            oauth: app.oauth.clone(),
            status: app.status,
            container_id: app.container_id.clone(),
            deployed_at: app.deployed_at,
            commit_hash: app.commit_hash.clone(),
            last_build_at: app.last_build_at,
            created_at: app.created_at,
            updated_at: app.updated_at,
        }
    }
}

/// One JSON record per app under `<data>/apps/`.
#[derive(Debug, Clone)]
pub struct AppStore {
    dir: PathBuf,
}

impl AppStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("apps"),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn get(&self, name: &str) -> Result<Option<App>> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let app = serde_json::from_str(&content)
            .with_context(|| format!("corrupt app record {}", path.display()))?;
        Ok(Some(app))
    }

    pub fn list(&self) -> Result<Vec<App>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut apps = Vec::new();
        for entry in fs::read_dir(&self.dir).context("failed to list app records")? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let app: App = serde_json::from_str(&content)
                    .with_context(|| format!("corrupt app record {}", path.display()))?;
                apps.push(app);
            }
        }
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }

    pub fn create(&self, app: App) -> Result<App> {
        validate_name(&app.name)?;
        if self.record_path(&app.name).exists() {
            bail!("app '{}' already exists", app.name);
        }
        self.write(&app)?;
        Ok(app)
    }

    /// Persist a mutation; `name` and `createdAt` are never touched here and
    /// `updatedAt` always moves forward.
    pub fn save(&self, app: &mut App) -> Result<()> {
        app.updated_at = Utc::now();
        self.write(app)
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    fn write(&self, app: &App) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.record_path(&app.name);
        let content = serde_json::to_string_pretty(app)?;
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
