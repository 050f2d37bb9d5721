//! Configuration system for auto3dseg.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> explicit file -> environment -> overrides.
//! Files are read from `~/.config/auto3dseg/config.toml` and
//! `.auto3dseg/config.toml` in the workspace directory.

use crate::catalog::DEFAULT_CACHE_DIR_NAME;
use crate::error::ConfigError;
use crate::process::{DEFAULT_POLL_INTERVAL, DEFAULT_SERVER_HOST, DEFAULT_SERVER_PORT};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Auto3dSegConfig {
    pub inference: InferenceConfig,
    pub catalog: CatalogConfig,
    pub server: ServerConfig,
    pub remote: RemoteConfig,
}

/// How local inference jobs are executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Python interpreter with MONAI installed.
    pub python: PathBuf,
    /// Inference script invoked with `--model-file`, `--image-file`, ...
    pub script: PathBuf,
    pub poll_interval_ms: u64,
    /// Hide all GPUs from inference processes.
    pub force_cpu: bool,
    /// Keep job working directories after completion.
    pub preserve_temp_dir: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            script: PathBuf::from("Scripts/auto3dseg_segresnet_inference.py"),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            force_cpu: false,
            preserve_temp_dir: false,
        }
    }
}

impl InferenceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// `Models.json` model description.
    pub models_json: PathBuf,
    /// Root of the model cache. Models go to `<cache_dir>/models/<id>`.
    pub cache_dir: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        let cache_dir = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(DEFAULT_CACHE_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR_NAME));
        Self {
            models_json: PathBuf::from("Resources/Models.json"),
            cache_dir,
        }
    }
}

/// HTTP inference server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Parent of the per-request session directories.
    pub session_root: PathBuf,
    /// Server binary launched by `InferenceServer`.
    pub executable: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            session_root: std::env::temp_dir().join("auto3dseg-sessions"),
            executable: PathBuf::from("auto3dseg-server"),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client side of a remote inference server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: format!("http://{DEFAULT_SERVER_HOST}:{DEFAULT_SERVER_PORT}"),
            timeout_secs: 3600,
        }
    }
}

impl Auto3dSegConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inference.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                message: "inference.poll_interval_ms must be greater than zero".into(),
            });
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "server.host must not be empty".into(),
            });
        }
        if self.remote.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "remote.timeout_secs must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })
    }
}

/// `~/.config/auto3dseg/config.toml` on Linux, platform equivalent elsewhere.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "auto3dseg", "auto3dseg")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".auto3dseg").join("config.toml")
}

/// Load configuration from all layers. Later layers win:
///
/// 1. Built-in defaults
/// 2. User config (`~/.config/auto3dseg/config.toml`)
/// 3. Workspace config (`.auto3dseg/config.toml`)
/// 4. Explicit config file
/// 5. Environment variables (prefixed with `AUTO3DSEG_`)
/// 6. Explicit overrides
pub fn load_config(
    workspace: Option<&Path>,
    file: Option<&Path>,
    overrides: Option<&Auto3dSegConfig>,
) -> Result<Auto3dSegConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(Auto3dSegConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = file {
        if !file.exists() {
            return Err(ConfigError::FileNotFound {
                path: file.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(file));
    }

    // AUTO3DSEG_SERVER__PORT, AUTO3DSEG_INFERENCE__PYTHON, ...
    figment = figment.merge(Env::prefixed("AUTO3DSEG_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: Auto3dSegConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = Auto3dSegConfig::default();
        assert_eq!(config.server.port, 8891);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.inference.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.remote.base_url, "http://127.0.0.1:8891");
        assert!(config.catalog.cache_dir.ends_with(DEFAULT_CACHE_DIR_NAME));
        config.validate().unwrap();
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None, None, None).unwrap();
        assert_eq!(config.inference.python, PathBuf::from("python3"));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"
[server]
port = 9100

[inference]
force_cpu = true
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None, None).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.inference.force_cpu);
    }

    #[test]
    fn test_explicit_file_wins_over_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace_config_path(dir.path());
        std::fs::create_dir_all(ws.parent().unwrap()).unwrap();
        std::fs::write(&ws, "[server]\nport = 9100\n").unwrap();
        let explicit = dir.path().join("custom.toml");
        std::fs::write(&explicit, "[server]\nport = 9200\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit), None).unwrap();
        assert_eq!(config.server.port, 9200);
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = load_config(None, Some(Path::new("/nonexistent/auto3dseg.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_overrides_apply_last() {
        let mut overrides = Auto3dSegConfig::default();
        overrides.inference.preserve_temp_dir = true;
        overrides.server.port = 9999;

        let config = load_config(None, None, Some(&overrides)).unwrap();
        assert!(config.inference.preserve_temp_dir);
        assert_eq!(config.server.port, 9999);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.toml");
        std::fs::write(&file, "[inference]\npoll_interval_ms = 0\n").unwrap();
        assert!(matches!(
            load_config(None, Some(&file), None),
            Err(ConfigError::Invalid { .. })
        ));

        std::fs::write(&file, "[server]\nport = \"not a number\"\n").unwrap();
        assert!(matches!(
            load_config(None, Some(&file), None),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Auto3dSegConfig::default();
        let text = config.to_toml_string().unwrap();
        let parsed: Auto3dSegConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
