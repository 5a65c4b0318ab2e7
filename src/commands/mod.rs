pub(crate) mod call;
pub(crate) mod daemon;
pub(crate) mod services;

use anyhow::Result;
use kairo_kernel::config::KernelConfig;
use std::path::PathBuf;

/// Config from `--config` (with env overrides) or the default location
pub(crate) fn load_config(path: Option<PathBuf>) -> Result<KernelConfig> {
    match path {
        Some(path) => Ok(KernelConfig::load_from(&path)?.with_overrides(
            kairo_kernel::clienv::socket_path_override(),
            kairo_kernel::clienv::state_dir_override(),
            kairo_kernel::clienv::trust_unidentified(),
        )),
        None => KernelConfig::load(),
    }
}
