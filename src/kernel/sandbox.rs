use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-process resource ceilings applied at spawn time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    /// Address space in MiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// Sandbox policy handed to the wrapper as-is. The kernel never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxPolicy(pub serde_json::Value);

/// Maps a command plus policy to the command line that is actually executed
pub trait SandboxWrapper: Send + Sync {
    fn wrap(
        &self,
        command: &[String],
        policy: Option<&SandboxPolicy>,
        limits: Option<&ResourceLimits>,
    ) -> Vec<String>;
}

/// Applies resource limits with `ulimit` in a POSIX shell and passes sandbox
/// policies through untouched.
#[derive(Debug, Clone)]
pub struct UlimitWrapper {
    shell: String,
}

impl UlimitWrapper {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
        }
    }
}

impl Default for UlimitWrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxWrapper for UlimitWrapper {
    fn wrap(
        &self,
        command: &[String],
        _policy: Option<&SandboxPolicy>,
        limits: Option<&ResourceLimits>,
    ) -> Vec<String> {
        let Some(limits) = limits.filter(|l| !l.is_empty()) else {
            return command.to_vec();
        };
        if command.is_empty() {
            return Vec::new();
        }

        let mut script = String::new();
        if let Some(cpu) = limits.cpu {
            script.push_str(&format!("ulimit -t {}; ", cpu));
        }
        if let Some(memory) = limits.memory {
            // ulimit -v takes KiB
            script.push_str(&format!("ulimit -v {}; ", memory.saturating_mul(1024)));
        }
        script.push_str("exec ");
        script.push_str(&shell_words::join(command));

        debug!("Wrapping command with limits: {}", script);
        vec![self.shell.clone(), "-c".to_string(), script]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_limits_is_passthrough() {
        let wrapper = UlimitWrapper::new();
        let command = cmd(&["echo", "hi"]);
        assert_eq!(wrapper.wrap(&command, None, None), command);
        assert_eq!(
            wrapper.wrap(&command, None, Some(&ResourceLimits::default())),
            command
        );
    }

    #[test]
    fn test_limits_wrap_in_shell() {
        let wrapper = UlimitWrapper::new();
        let limits = ResourceLimits {
            cpu: Some(5),
            memory: Some(64),
        };
        let wrapped = wrapper.wrap(&cmd(&["echo", "hello world"]), None, Some(&limits));
        assert_eq!(wrapped[0], "/bin/sh");
        assert_eq!(wrapped[1], "-c");
        assert_eq!(
            wrapped[2],
            "ulimit -t 5; ulimit -v 65536; exec echo 'hello world'"
        );
    }

    #[test]
    fn test_policy_alone_is_not_interpreted() {
        let wrapper = UlimitWrapper::new();
        let policy = SandboxPolicy(serde_json::json!({"network": false}));
        let command = cmd(&["ls"]);
        assert_eq!(wrapper.wrap(&command, Some(&policy), None), command);
    }
}
