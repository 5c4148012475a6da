pub mod oauth;

use anyhow::{bail, Context, Result};
use rand::RngCore;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_DATA_DIR: &str = "/data";
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1024;
const API_KEY_FILE: &str = "api-key";

/// Agent configuration, sourced entirely from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Wildcard zone the agent publishes under; resources default to
    /// `<name>.<domain>`.
    pub domain: String,
    /// Registration email for the ACME resolver.
    pub acme_email: String,
    /// Shared key required on every control-plane request.
    pub api_key: String,
    pub data_dir: PathBuf,
    /// Host port published to the proxy's HTTP entrypoint.
    pub http_port: u16,
    /// Host port published to the proxy's HTTPS entrypoint.
    pub https_port: u16,
    /// Port the control plane itself listens on.
    pub api_port: u16,
    /// Upper bound for site bundle uploads, in bytes.
    pub max_upload_size: u64,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let domain = required_env("DOMAIN")?.to_lowercase();
        if domain.contains('/') || domain.contains(':') || !domain.contains('.') {
            bail!("DOMAIN must be a bare DNS zone, got '{}'", domain);
        }

        let acme_email = required_env("EMAIL")?;
        let data_dir = PathBuf::from(optional_env("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));

        let http_port = port_env("HTTP_PORT", 80)?;
        let https_port = port_env("HTTPS_PORT", 443)?;
        let api_port = port_env("PORT", 3000)?;

        let max_upload_size = match optional_env("MAX_UPLOAD_SIZE") {
            Some(raw) => parse_size(&raw)
                .with_context(|| format!("invalid MAX_UPLOAD_SIZE '{}'", raw))?,
            None => DEFAULT_MAX_UPLOAD_SIZE,
        };

        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let api_key = match optional_env("API_KEY") {
            Some(key) => key,
            None => load_or_generate_api_key(&data_dir)?,
        };

        Ok(Self {
            domain,
            acme_email,
            api_key,
            data_dir,
            http_port,
            https_port,
            api_port,
            max_upload_size,
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    match optional_env(name) {
        Some(value) => Ok(value),
        None => bail!("environment variable {} is required", name),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn port_env(name: &str, default: u16) -> Result<u16> {
    match optional_env(name) {
        Some(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("{} must be a port number, got '{}'", name, raw)),
        None => Ok(default),
    }
}

/// Parse a human-readable size such as `50MB`, `512KB` or a bare byte count.
pub fn parse_size(raw: &str) -> Result<u64> {
    let trimmed = raw.trim().to_uppercase();
    let (digits, multiplier) = if let Some(n) = trimmed.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = trimmed.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = trimmed.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = trimmed.strip_suffix('B') {
        (n, 1)
    } else {
        (trimmed.as_str(), 1)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not a size", raw))?;
    Ok(value * multiplier)
}

/// Read the persisted API key, generating a 32-byte hex key on first start.
fn load_or_generate_api_key(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(API_KEY_FILE);
    if path.exists() {
        let key = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let key = key.trim().to_string();
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let key = hex::encode(bytes);

    fs::write(&path, &key).with_context(|| format!("failed to write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", path.display()))?;
    info!("generated new API key at {}", path.display());
    Ok(key)
}
