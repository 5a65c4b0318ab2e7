//! Secret vault seam
//!
//! Skills never see secrets directly: they hold opaque handles and resolve
//! them with the runtime token the kernel issued to them. The daemon seeds
//! its vault from the `[vault]` section of `kernel.toml`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info, warn};

pub trait Vault: Send + Sync {
    /// Resolve `handle` on behalf of the holder of `token`
    fn resolve_with_token(&self, token: &str, handle: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHandle {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Secrets and tokens loaded at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub secrets: Vec<SecretEntry>,
    pub tokens: Vec<TokenGrant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretEntry {
    /// Handle skills resolve, e.g. `vault:openai`
    pub handle: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub value: Option<String>,
    /// Read the value from this environment variable instead
    #[serde(default)]
    pub env: Option<String>,
}

fn default_kind() -> String {
    "generic".to_string()
}

impl SecretEntry {
    fn resolve(&self) -> Option<String> {
        if let Some(value) = &self.value {
            return Some(value.clone());
        }
        let var = self.env.as_deref()?;
        match std::env::var(var) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(handle = %self.handle, "Secret variable {} unavailable: {}", var, e);
                None
            }
        }
    }
}

/// A pre-shared runtime token for a skill started outside the kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub skill: String,
}

#[derive(Default)]
struct VaultState {
    secrets: HashMap<String, String>,
    /// token -> skill id
    tokens: HashMap<String, String>,
    revoked: HashSet<String>,
}

/// In-memory vault with runtime tokens
#[derive(Default)]
pub struct MemoryVault {
    state: RwLock<VaultState>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configured secrets and tokens. Returns how many secrets were stored.
    pub fn seed(&self, config: &VaultConfig) -> usize {
        let mut stored = 0;
        for entry in &config.secrets {
            match entry.resolve() {
                Some(value) => {
                    self.store_as(entry.handle.clone(), value, entry.kind.clone());
                    stored += 1;
                }
                None => warn!(handle = %entry.handle, "Secret has no value, skipping"),
            }
        }
        for grant in &config.tokens {
            self.grant_token(grant.token.clone(), grant.skill.clone());
        }
        stored
    }

    /// Store under a generated handle
    pub fn store(&self, value: impl Into<String>, kind: impl Into<String>) -> VaultHandle {
        let id = format!("vault:{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        self.store_as(id, value, kind)
    }

    /// Store under a caller-chosen handle, replacing any previous value
    pub fn store_as(
        &self,
        id: impl Into<String>,
        value: impl Into<String>,
        kind: impl Into<String>,
    ) -> VaultHandle {
        let handle = VaultHandle {
            id: id.into(),
            kind: kind.into(),
        };
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .secrets
            .insert(handle.id.clone(), value.into());
        info!("Stored secret {}", handle.id);
        handle
    }

    /// Issue a token a skill process can use to resolve handles
    pub fn create_runtime_token(&self, skill_id: impl Into<String>) -> String {
        let token = format!("rt_{}", uuid::Uuid::new_v4().simple());
        let skill_id = skill_id.into();
        debug!(skill = %skill_id, "Issued runtime token");
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .tokens
            .insert(token.clone(), skill_id);
        token
    }

    /// Accept a token issued elsewhere
    pub fn grant_token(&self, token: impl Into<String>, skill_id: impl Into<String>) {
        let token = token.into();
        let skill_id = skill_id.into();
        debug!(skill = %skill_id, "Granted runtime token");
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.revoked.remove(&token);
        state.tokens.insert(token, skill_id);
    }

    pub fn revoke_token(&self, token: &str) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.tokens.remove(token).is_some() {
            state.revoked.insert(token.to_string());
            true
        } else {
            false
        }
    }

    /// Skill id a live token was issued to
    pub fn skill_for_token(&self, token: &str) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .tokens
            .get(token)
            .cloned()
    }
}

impl Vault for MemoryVault {
    fn resolve_with_token(&self, token: &str, handle: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let Some(skill) = state.tokens.get(token) else {
            if state.revoked.contains(token) {
                warn!("Vault access with revoked token");
            } else {
                warn!("Vault access with unknown token");
            }
            return None;
        };
        let value = state.secrets.get(handle).cloned();
        info!(skill = %skill, handle = %handle, found = value.is_some(), "Vault resolve");
        value
    }
}
