use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VIDGEN_DATA_DIR";

pub const ENV_MODEL_PATH: &str = "MODEL_PATH";
pub const ENV_UPSCALE_MODEL: &str = "UP_SCALE_MODEL_CKPT";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_BASE_URL: &str = "OPENAI_BASE_URL";
pub const ENV_PORT: &str = "PORT";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub generation: GenerationConfig,
    pub upscale: UpscaleConfig,
    pub enhance: EnhanceConfig,
    pub housekeeping: HousekeepingConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: PathBuf,
    pub model_path: PathBuf,
    /// Upscaling is disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upscale_model_path: Option<PathBuf>,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub default_steps: u32,
    pub default_guidance: f32,
    pub fps: u32,
    pub timeout_secs: u64,
    pub backend: InferenceBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpscaleConfig {
    pub tile: usize,
    pub overlap: usize,
    /// Probed from the model when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<usize>,
    pub value_scale: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnhanceConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HousekeepingConfig {
    pub interval_secs: u64,
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExportConfig {
    pub crf: u8,
    pub gif_fps: u32,
    pub gif_height: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7870,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            model_path: PathBuf::from("models/text2video.onnx"),
            upscale_model_path: None,
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_steps: 50,
            default_guidance: 6.0,
            fps: 8,
            timeout_secs: 1800,
            backend: InferenceBackend::default(),
        }
    }
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            tile: crate::tiling::DEFAULT_TILE_SIZE,
            overlap: crate::tiling::DEFAULT_TILE_OVERLAP,
            scale: None,
            value_scale: 1.0,
        }
    }
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "glm-4-0520".to_string(),
            temperature: 0.01,
            top_p: 0.7,
            max_tokens: 200,
            max_attempts: 3,
            backoff_ms: 500,
            timeout_secs: 30,
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            retention_secs: 600,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            crf: 18,
            gif_fps: 8,
            gif_height: 240,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EnhanceConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// A blank key counts as no key.
    pub fn has_api_key(&self) -> bool {
        self.api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }
}

impl HousekeepingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Overlay deployment variables on top of file values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(path) = non_empty(ENV_MODEL_PATH) {
            self.paths.model_path = PathBuf::from(path);
        }
        if let Some(path) = non_empty(ENV_UPSCALE_MODEL) {
            self.paths.upscale_model_path = Some(PathBuf::from(path));
        }
        if let Some(key) = non_empty(ENV_API_KEY) {
            self.enhance.api_key = Some(key);
        }
        if let Some(url) = non_empty(ENV_BASE_URL) {
            self.enhance.base_url = url;
        }
        if let Some(port) = non_empty(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_PORT} value: {port}"))?;
        }
        Ok(())
    }

    pub fn apply_process_env(&mut self) -> Result<()> {
        self.apply_env_overrides(|name| env::var(name).ok())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VIDGEN_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}
