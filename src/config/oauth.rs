use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

const CONFIG_FILE: &str = "oauth-config.json";

/// Operator OIDC settings for the sidecar proxy. All five fields are
/// required; a missing file or any empty field disables OIDC entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthServerConfig {
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub cookie_secret: String,
    pub cookie_domain: String,
}

impl OAuthServerConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("issuerUrl", &self.issuer_url),
            ("clientId", &self.client_id),
            ("clientSecret", &self.client_secret),
            ("cookieSecret", &self.cookie_secret),
            ("cookieDomain", &self.cookie_domain),
        ] {
            if value.trim().is_empty() {
                bail!("oauth config field {} cannot be empty", field);
            }
        }
        Ok(())
    }
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Load the OIDC config if present and complete; anything else means
/// OIDC is disabled.
pub fn load(data_dir: &Path) -> Option<OAuthServerConfig> {
    let path = config_path(data_dir);
    let content = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<OAuthServerConfig>(&content) {
        Ok(config) => match config.validate() {
            Ok(()) => Some(config),
            Err(e) => {
                warn!("ignoring {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            warn!("ignoring malformed {}: {}", path.display(), e);
            None
        }
    }
}

pub fn save(data_dir: &Path, config: &OAuthServerConfig) -> Result<()> {
    config.validate()?;
    let path = config_path(data_dir);
    let content = serde_json::to_string_pretty(config)?;
    fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", path.display()))?;
    Ok(())
}

pub fn remove(data_dir: &Path) -> Result<()> {
    let path = config_path(data_dir);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
