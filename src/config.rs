use crate::clienv;
use crate::kernel::devices::DeviceInfo;
use crate::kernel::ring_buffer::DEFAULT_CAPACITY;
use crate::kernel::services::ServiceDefinition;
use crate::kernel::vault::VaultConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon settings: `kernel.toml`, then environment overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub socket_path: PathBuf,
    /// Holds the process snapshot
    pub state_dir: PathBuf,
    /// Let connections that never called `identify` control processes
    pub trust_unidentified: bool,
    /// Default ring capacity per stream subscription
    pub stream_buffer_bytes: usize,
    /// Client-side request timeout
    pub request_timeout_ms: u64,
    /// Devices registered at startup
    pub devices: Vec<DeviceInfo>,
    /// Services registered at startup and started in dependency order
    pub services: Vec<ServiceDefinition>,
    /// Secrets and runtime tokens the vault starts with
    pub vault: VaultConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(clienv::DEFAULT_SOCKET_PATH),
            state_dir: clienv::state_dir(),
            trust_unidentified: true,
            stream_buffer_bytes: DEFAULT_CAPACITY,
            request_timeout_ms: 5000,
            devices: Vec::new(),
            services: Vec::new(),
            vault: VaultConfig::default(),
        }
    }
}

impl KernelConfig {
    /// $KAIRO_KERNEL_CONFIG or ~/.config/kairo/kernel.toml, with env overrides
    pub fn load() -> Result<Self> {
        let config = Self::load_from(&clienv::config_path())?;
        Ok(config.with_overrides(
            clienv::socket_path_override(),
            clienv::state_dir_override(),
            clienv::trust_unidentified(),
        ))
    }

    /// A missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading kernel config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            socket = %config.socket_path.display(),
            services = config.services.len(),
            devices = config.devices.len(),
            secrets = config.vault.secrets.len(),
            "Kernel config loaded"
        );
        Ok(config)
    }

    pub fn with_overrides(
        mut self,
        socket_path: Option<PathBuf>,
        state_dir: Option<PathBuf>,
        trust_unidentified: Option<bool>,
    ) -> Self {
        if let Some(path) = socket_path {
            self.socket_path = path;
        }
        if let Some(dir) = state_dir {
            self.state_dir = dir;
        }
        if let Some(trust) = trust_unidentified {
            self.trust_unidentified = trust;
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::health::HealthCheckKind;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = KernelConfig::load_from(&dir.path().join("none.toml")).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/kairo-kernel.sock"));
        assert!(config.trust_unidentified);
        assert_eq!(config.stream_buffer_bytes, 1024 * 1024);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_services_and_devices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.toml");
        fs::write(
            &path,
            r#"
socket_path = "/run/kairo.sock"
trust_unidentified = false

[[devices]]
id = "cam0"
type = "camera"
path = "/dev/video0"

[[services]]
id = "db"
command = ["postgres", "-D", "/var/lib/pg"]
healthCheck = { type = "tcp", target = "5432", intervalMs = 1000 }

[[services]]
id = "api"
command = ["api-server"]
dependencies = ["db"]
restartPolicy = { maxAttempts = 3, backoffMs = [100, 500] }
"#,
        )
        .unwrap();

        let config = KernelConfig::load_from(&path).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/kairo.sock"));
        assert!(!config.trust_unidentified);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.services.len(), 2);
        assert_eq!(
            config.services[0].health_check.as_ref().unwrap().kind,
            HealthCheckKind::Tcp
        );
        assert_eq!(config.services[1].dependencies, vec!["db"]);
        assert_eq!(config.services[1].restart.as_ref().unwrap().max_attempts, 3);
    }

    #[test]
    fn test_parse_vault_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.toml");
        fs::write(
            &path,
            r#"
[[vault.secrets]]
handle = "vault:openai"
type = "api_key"
env = "OPENAI_API_KEY"

[[vault.secrets]]
handle = "vault:db"
value = "hunter2"

[[vault.tokens]]
token = "rt_ci"
skill = "ci-runner"
"#,
        )
        .unwrap();

        let config = KernelConfig::load_from(&path).unwrap();
        let secrets = &config.vault.secrets;
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets[0].kind, "api_key");
        assert_eq!(secrets[0].env.as_deref(), Some("OPENAI_API_KEY"));
        assert_eq!(secrets[1].kind, "generic");
        assert_eq!(secrets[1].value.as_deref(), Some("hunter2"));
        assert_eq!(config.vault.tokens[0].skill, "ci-runner");
        assert!(KernelConfig::default().vault.secrets.is_empty());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.toml");
        fs::write(&path, "socket_path = [").unwrap();
        assert!(KernelConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_overrides_win() {
        let config = KernelConfig::default().with_overrides(
            Some(PathBuf::from("/tmp/other.sock")),
            None,
            Some(false),
        );
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
        assert!(!config.trust_unidentified);
    }
}
