use std::path::PathBuf;

/// Environment variables read by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    KairoKernelSocket,
    KairoKernelConfig,
    KairoKernelStateDir,
    KairoTrustUnidentified,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::KairoKernelSocket => "KAIRO_KERNEL_SOCKET",
            EnvVar::KairoKernelConfig => "KAIRO_KERNEL_CONFIG",
            EnvVar::KairoKernelStateDir => "KAIRO_KERNEL_STATE_DIR",
            EnvVar::KairoTrustUnidentified => "KAIRO_TRUST_UNIDENTIFIED",
        }
    }
}

const KAIRO_SUBDIR: &str = "kairo";
const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/kairo-kernel.sock";

/// Non-empty value of `name`
pub fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Kernel socket path ($KAIRO_KERNEL_SOCKET or /tmp/kairo-kernel.sock)
pub fn socket_path() -> PathBuf {
    let path = socket_path_override().unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    tracing::trace!(path = %path.display(), "Kernel socket path");
    path
}

pub fn socket_path_override() -> Option<PathBuf> {
    env_opt(EnvVar::KairoKernelSocket.as_str()).map(PathBuf::from)
}

/// Kernel config file ($KAIRO_KERNEL_CONFIG or ~/.config/kairo/kernel.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::KairoKernelConfig.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(KAIRO_SUBDIR)
                .join("kernel.toml")
        });
    tracing::trace!(path = %path.display(), "Kernel config path");
    path
}

/// State directory for the process snapshot ($KAIRO_KERNEL_STATE_DIR or ~/.local/share/kairo)
pub fn state_dir() -> PathBuf {
    let dir = state_dir_override().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
            .join(KAIRO_SUBDIR)
    });
    tracing::trace!(dir = %dir.display(), "Kernel state directory");
    dir
}

pub fn state_dir_override() -> Option<PathBuf> {
    env_opt(EnvVar::KairoKernelStateDir.as_str()).map(PathBuf::from)
}

/// $KAIRO_TRUST_UNIDENTIFIED, if set
pub fn trust_unidentified() -> Option<bool> {
    let val = env_opt(EnvVar::KairoTrustUnidentified.as_str()).map(|v| is_truthy(&v));
    tracing::trace!(value = ?val, "KAIRO_TRUST_UNIDENTIFIED env var");
    val
}
