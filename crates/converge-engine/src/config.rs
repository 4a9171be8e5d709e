use std::path::{Path, PathBuf};

use converge_policy::RequiredPolicy;
use serde::{Deserialize, Serialize};

use crate::deployment::{DeploymentOptions, Target};
use crate::error::EngineError;
use crate::persistence::FileSnapshotStore;

/// Layout version written by [`save_config`]. Older layouts are upgraded by
/// [`migrate`].
const CURRENT_VERSION: u32 = 1;

fn default_parallel() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 0 for files written before versioning.
    #[serde(default)]
    pub config_version: u32,
    pub stack: String,
    pub project: String,
    /// Upper bound on concurrent provider operations.
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default = "default_true")]
    pub verify_integrity: bool,
    /// Added in v1; v0 configs listed bare pack names under `policy_packs`.
    #[serde(default)]
    pub required_policies: Vec<RequiredPolicy>,
    /// Where the snapshot lives. Defaults to a per-stack file under the
    /// local data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn new(stack: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            config_version: CURRENT_VERSION,
            stack: stack.into(),
            project: project.into(),
            parallel: default_parallel(),
            continue_on_error: false,
            verify_integrity: true,
            required_policies: Vec::new(),
            snapshot_path: None,
        }
    }

    pub fn target(&self) -> Target {
        Target {
            stack: self.stack.clone(),
            project: self.project.clone(),
        }
    }

    pub fn deployment_options(&self) -> DeploymentOptions {
        DeploymentOptions {
            parallel: self.parallel,
            continue_on_error: self.continue_on_error,
            verify_integrity: self.verify_integrity,
            required_policies: self.required_policies.clone(),
            preview: false,
        }
    }

    /// Store for this stack's snapshot.
    pub fn snapshot_store(&self) -> Result<FileSnapshotStore, EngineError> {
        let path = match &self.snapshot_path {
            Some(path) => path.clone(),
            None => {
                let base = dirs::data_local_dir()
                    .ok_or_else(|| EngineError::Config("no local data directory found".into()))?;
                base.join("converge")
                    .join(&self.project)
                    .join(format!("{}.json", self.stack))
            }
        };
        Ok(FileSnapshotStore::new(path))
    }
}

pub fn default_config_path() -> Result<PathBuf, EngineError> {
    let base =
        dirs::config_dir().ok_or_else(|| EngineError::Config("no config directory found".into()))?;
    Ok(base.join("converge").join("config.json"))
}

/// Read a config file, upgrading older layouts in memory. The file itself
/// is only rewritten by [`save_config`].
pub fn load_config(path: &Path) -> Result<EngineConfig, EngineError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let version = stored_version(&value);
    let upgraded = migrate(value, version)?;
    Ok(serde_json::from_value(upgraded)?)
}

/// Pre-versioned files carry no `config_version`.
fn stored_version(value: &serde_json::Value) -> u32 {
    value
        .get("config_version")
        .and_then(serde_json::Value::as_u64)
        .map_or(0, |v| v as u32)
}

/// Upgrade `value` step by step from `from_version` to [`CURRENT_VERSION`].
fn migrate(mut value: serde_json::Value, from_version: u32) -> Result<serde_json::Value, EngineError> {
    if from_version > CURRENT_VERSION {
        return Err(EngineError::Config(format!(
            "config_version {from_version} is newer than this build supports ({CURRENT_VERSION})"
        )));
    }

    if from_version < 1 {
        let fields = value
            .as_object_mut()
            .ok_or_else(|| EngineError::Config("config is not a JSON object".into()))?;
        let packs = fields.remove("policy_packs").unwrap_or_default();
        let required: Vec<serde_json::Value> = packs
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(serde_json::Value::as_str)
            .map(|name| serde_json::json!({ "name": name }))
            .collect();
        let count = required.len();
        if count > 0 {
            fields.insert("required_policies".into(), required.into());
        }
        fields.insert("config_version".into(), 1.into());
        tracing::info!(packs = count, "config upgraded to v1");
    }

    Ok(value)
}

/// Write `config` at the current version. The file is replaced atomically
/// and is readable by the owner only.
pub fn save_config(config: &EngineConfig, path: &Path) -> Result<(), EngineError> {
    let config = EngineConfig {
        config_version: CURRENT_VERSION,
        ..config.clone()
    };
    let body = serde_json::to_string_pretty(&config)?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&staging, path)?;

    tracing::info!(path = %path.display(), stack = %config.stack, "config saved");
    Ok(())
}
