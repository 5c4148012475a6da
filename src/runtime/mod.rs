pub mod labels;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Prefix for every container and image the agent manages.
pub const CONTAINER_PREFIX: &str = "siteio-";
/// User-defined bridge network shared by the proxy and all workloads.
pub const NETWORK: &str = "siteio";

/// Every runtime operation fails the same way: the docker subcommand that
/// ran and whatever it printed on stderr.
#[derive(Debug, Error)]
#[error("docker {command} failed: {stderr}")]
pub struct RuntimeError {
    pub command: String,
    pub stderr: String,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

pub fn container_name(app_name: &str) -> String {
    format!("{}{}", CONTAINER_PREFIX, app_name)
}

/// Local image tag for apps built from a git source.
pub fn image_tag(app_name: &str) -> String {
    format!("{}{}:latest", CONTAINER_PREFIX, app_name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    UnlessStopped,
    OnFailure,
    No,
}

impl RestartPolicy {
    pub fn as_flag(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::No => "no",
        }
    }
}

/// A single bind mount. `host_name` is either an absolute host path or the
/// name of a per-app directory managed under `<data>/volumes/<app>/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub host_name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    pub context_path: PathBuf,
    /// Dockerfile path relative to the build context.
    pub dockerfile: String,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    pub no_cache: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// On-host container name.
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Already-resolved `host:container[:ro]` bind specs.
    pub binds: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub network: String,
    pub labels: BTreeMap<String, String>,
    /// Published ports, `[host-ip:]host:container`. Only the managed
    /// infrastructure containers use these.
    pub ports: Vec<String>,
    /// `host:ip` entries, e.g. the host-gateway alias.
    pub extra_hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub state: ContainerState,
    pub image: String,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub running: bool,
    pub status: String,
    pub started_at: String,
    pub exit_code: i64,
}

#[derive(Debug, Deserialize)]
struct RawInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: RawState,
    #[serde(rename = "Config")]
    config: RawConfig,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: RawNetworkSettings,
}

#[derive(Debug, Deserialize)]
struct RawState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "StartedAt", default)]
    started_at: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: i64,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "Image")]
    image: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: Option<BTreeMap<String, serde_json::Value>>,
}

/// Thin adapter over the docker CLI. Owns container and image lifecycles;
/// everything else consumes its typed results.
#[derive(Debug, Clone)]
pub struct Docker {
    data_dir: PathBuf,
}

impl Docker {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Host path backing a named volume for an app.
    pub fn volume_host_path(&self, app_name: &str, host_name: &str) -> PathBuf {
        self.data_dir.join("volumes").join(app_name).join(host_name)
    }

    /// Turn a declared mount into a `host:container[:ro]` bind spec.
    pub fn bind_spec(&self, app_name: &str, mount: &VolumeMount) -> String {
        let host = if mount.host_name.starts_with('/') {
            PathBuf::from(&mount.host_name)
        } else {
            self.volume_host_path(app_name, &mount.host_name)
        };
        let mut spec = format!("{}:{}", host.display(), mount.mount_path);
        if mount.readonly {
            spec.push_str(":ro");
        }
        spec
    }

    async fn exec(&self, args: &[&str]) -> RuntimeResult<String> {
        debug!("docker {}", args.join(" "));

        let command = args.first().copied().unwrap_or_default().to_string();
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError {
                command: command.clone(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(RuntimeError {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Probe the daemon; false when docker is missing or not responding.
    pub async fn is_available(&self) -> bool {
        self.exec(&["info", "--format", "{{.ServerVersion}}"])
            .await
            .is_ok()
    }

    /// Idempotently create the shared bridge network.
    pub async fn ensure_network(&self) -> RuntimeResult<()> {
        if self.exec(&["network", "inspect", NETWORK]).await.is_ok() {
            return Ok(());
        }
        self.exec(&["network", "create", NETWORK]).await?;
        Ok(())
    }

    pub async fn pull(&self, image: &str) -> RuntimeResult<()> {
        self.exec(&["pull", image]).await?;
        Ok(())
    }

    pub async fn build(&self, config: &BuildConfig) -> RuntimeResult<()> {
        let dockerfile = config.context_path.join(&config.dockerfile);
        let dockerfile = dockerfile.to_string_lossy().to_string();
        let context = config.context_path.to_string_lossy().to_string();

        let mut args = vec!["build", "-t", &config.tag, "-f", &dockerfile];
        if config.no_cache {
            args.push("--no-cache");
        }
        let build_args: Vec<String> = config
            .build_args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        for pair in &build_args {
            args.push("--build-arg");
            args.push(pair);
        }
        args.push(&context);

        self.exec(&args).await?;
        Ok(())
    }

    /// Start a detached container and return the runtime's container id.
    pub async fn run(&self, config: &RunConfig) -> RuntimeResult<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            config.name.clone(),
            "--restart".into(),
            config.restart_policy.as_flag().into(),
            "--network".into(),
            config.network.clone(),
        ];
        for (key, value) in &config.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        for bind in &config.binds {
            args.push("-v".into());
            args.push(bind.clone());
        }
        for (key, value) in &config.labels {
            args.push("-l".into());
            args.push(format!("{}={}", key, value));
        }
        for port in &config.ports {
            args.push("-p".into());
            args.push(port.clone());
        }
        for host in &config.extra_hosts {
            args.push("--add-host".into());
            args.push(host.clone());
        }
        args.push(config.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.exec(&arg_refs).await?;
        Ok(stdout.trim().to_string())
    }

    pub async fn stop(&self, name: &str) -> RuntimeResult<()> {
        self.exec(&["stop", name]).await?;
        Ok(())
    }

    /// Force-remove a container; a container that is already gone is fine.
    pub async fn remove(&self, name: &str) -> RuntimeResult<()> {
        match self.exec(&["rm", "-f", name]).await {
            Ok(_) => Ok(()),
            Err(e) if e.stderr.contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn restart(&self, name: &str) -> RuntimeResult<()> {
        self.exec(&["restart", name]).await?;
        Ok(())
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.exec(&["inspect", "--format", "{{.State.Running}}", name])
            .await
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    pub async fn container_exists(&self, name: &str) -> bool {
        self.exec(&["inspect", "--format", "{{.Id}}", name])
            .await
            .is_ok()
    }

    pub async fn inspect(&self, name: &str) -> RuntimeResult<ContainerInfo> {
        let stdout = self.exec(&["inspect", name]).await?;
        let mut parsed: Vec<RawInspect> =
            serde_json::from_str(&stdout).map_err(|e| RuntimeError {
                command: "inspect".into(),
                stderr: format!("unparseable inspect output: {}", e),
            })?;
        let raw = parsed.pop().ok_or_else(|| RuntimeError {
            command: "inspect".into(),
            stderr: format!("no such container: {}", name),
        })?;

        Ok(ContainerInfo {
            id: raw.id,
            state: ContainerState {
                running: raw.state.running,
                status: raw.state.status,
                started_at: raw.state.started_at,
                exit_code: raw.state.exit_code,
            },
            image: raw.config.image,
            ports: raw
                .network_settings
                .ports
                .unwrap_or_default()
                .keys()
                .cloned()
                .collect(),
        })
    }

    /// Replay the last `tail` lines of a container's output, both streams
    /// interleaved the way docker emits them.
    pub async fn logs(&self, name: &str, tail: u32) -> RuntimeResult<String> {
        let tail = tail.to_string();
        let args = ["logs", "--tail", &tail, name];
        debug!("docker {}", args.join(" "));

        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| RuntimeError {
                command: "logs".into(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(RuntimeError {
                command: "logs".into(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(combined)
    }

    pub async fn image_exists(&self, tag: &str) -> bool {
        self.exec(&["image", "inspect", tag]).await.is_ok()
    }

    pub async fn remove_image(&self, tag: &str) -> RuntimeResult<()> {
        match self.exec(&["rmi", tag]).await {
            Ok(_) => Ok(()),
            Err(e) if e.stderr.contains("No such image") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Ensure the host directories behind an app's named volumes exist.
pub fn ensure_volume_dirs(docker: &Docker, app_name: &str, mounts: &[VolumeMount]) -> std::io::Result<()> {
    for mount in mounts {
        if !mount.host_name.starts_with('/') {
            std::fs::create_dir_all(docker.volume_host_path(app_name, &mount.host_name))?;
        }
    }
    Ok(())
}
