use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::DEFAULT_EXTENSIONS;

/// Log level for the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Which record store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One JSON document per image identity
    Json,

    /// One row per image identity in a SQLite table
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(Error::Configuration(format!(
                "Unknown store backend '{}', expected 'json' or 'sqlite'",
                other
            ))),
        }
    }
}

/// CLIP interrogator service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    /// Whether CLIP tasks are part of the catalog
    pub enabled: bool,

    /// Base URL of the interrogator API
    pub api_url: String,

    /// CLIP model passed with every request
    pub model_name: String,

    /// Interrogation modes, in execution order
    pub modes: Vec<String>,

    /// Environment variable holding the optional login password
    pub password_env: Option<String>,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: "http://localhost:7860".to_string(),
            model_name: "ViT-L-14/openai".to_string(),
            modes: vec!["best".to_string(), "fast".to_string()],
            password_env: Some("CLIP_API_PASSWORD".to_string()),
        }
    }
}

/// One LLM model slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModelConfig {
    /// Identifier used in task keys (`llm:<prompt>:<id>`)
    pub id: String,

    /// Provider name (ollama, openai, anthropic, google, grok, mistral, perplexity)
    pub provider: String,

    /// Model name sent to the provider
    pub model_name: String,

    /// Endpoint override; the provider default is used when absent
    #[serde(default)]
    pub url: Option<String>,

    /// Environment variable holding the API key; provider default when absent
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One LLM prompt slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Identifier used in task keys
    pub id: String,

    /// Prompt text sent with the image
    pub text: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Models this prompt runs on; every enabled model when absent
    #[serde(default)]
    pub models: Option<Vec<String>>,
}

/// LLM settings: the models and prompts that form the LLM part of the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub models: Vec<LlmModelConfig>,
    pub prompts: Vec<PromptConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            models: vec![LlmModelConfig {
                id: "llava".to_string(),
                provider: "ollama".to_string(),
                model_name: "llava".to_string(),
                url: None,
                api_key_env: None,
                enabled: true,
            }],
            prompts: vec![PromptConfig {
                id: "P1".to_string(),
                text: "Describe this image in detail, including visual elements, style, composition, and any notable features.".to_string(),
                temperature: default_temperature(),
                max_tokens: default_max_tokens(),
                models: None,
            }],
        }
    }
}

/// Record store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Where JSON records and summary files are written
    pub output_directory: PathBuf,

    /// SQLite database file (sqlite backend only)
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            output_directory: PathBuf::from("Output"),
            database_path: PathBuf::from("image_analysis.db"),
        }
    }
}

/// Batch processing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Process files on a worker pool instead of one at a time
    pub parallel: bool,

    /// Number of worker threads (0 = auto)
    pub threads: usize,

    /// Re-run every task regardless of stored results
    pub force_reprocess: bool,

    /// Re-run slots whose previous attempt ended in error
    pub retry_failed_tasks: bool,

    /// Per-request timeout for remote calls
    pub request_timeout_secs: u64,

    /// Total attempts per task, including the first
    pub max_attempts: u32,

    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Base wait after a rate-limit response
    pub rate_limit_delay_ms: u64,

    /// Upper bound on any rate-limit wait, including a server's Retry-After
    pub max_rate_limit_delay_ms: u64,

    /// Extensions considered images (case-insensitive, without dot)
    pub allowed_extensions: Vec<String>,

    /// Maximum directory depth for scanning
    pub max_depth: Option<usize>,

    /// Files larger than this are skipped during discovery
    pub max_file_size_mb: Option<u64>,

    pub enable_metadata_extraction: bool,
    pub generate_summaries: bool,

    /// Consecutive storage failures after which the batch is aborted
    pub max_consecutive_storage_failures: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            threads: 0, // Auto
            force_reprocess: false,
            retry_failed_tasks: true,
            request_timeout_secs: 120,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            rate_limit_delay_ms: 10_000,
            max_rate_limit_delay_ms: 120_000,
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            max_depth: None,
            max_file_size_mb: Some(50),
            enable_metadata_extraction: true,
            generate_summaries: true,
            max_consecutive_storage_failures: 3,
        }
    }
}

/// Configuration for the image analysis process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub clip: ClipConfig,
    pub llm: LlmConfig,
    pub store: StoreConfig,
    pub processing: ProcessingConfig,

    /// Directory for rotated log files; console logging when absent
    pub log_dir: Option<PathBuf>,

    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clip: ClipConfig::default(),
            llm: LlmConfig::default(),
            store: StoreConfig::default(),
            processing: ProcessingConfig::default(),
            log_dir: None,
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Configuration(format!("Failed to open config file: {}", e)))?;

        let config: Config = serde_json::from_reader(file)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .map_err(|e| Error::Configuration(format!("Failed to create config file: {}", e)))?;

        serde_json::to_writer_pretty(file, self)
            .map_err(|e| Error::Configuration(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Platform-specific default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "image-analysis")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Structural validation; catalog-level checks live in `catalog::catalog`
    pub fn validate(&self) -> Result<()> {
        if self.clip.enabled && self.clip.api_url.trim().is_empty() {
            return Err(Error::Configuration(
                "CLIP analysis enabled but clip.api_url is empty".to_string(),
            ));
        }

        if self.clip.enabled && self.clip.model_name.trim().is_empty() {
            return Err(Error::Configuration(
                "CLIP analysis enabled but clip.model_name is empty".to_string(),
            ));
        }

        if self.llm.enabled && !self.llm.models.iter().any(|m| m.enabled) {
            return Err(Error::Configuration(
                "LLM analysis enabled but no LLM models are enabled".to_string(),
            ));
        }

        let processing = &self.processing;
        if processing.max_attempts == 0 {
            return Err(Error::Configuration(
                "processing.max_attempts must be at least 1".to_string(),
            ));
        }

        if processing.request_timeout_secs == 0 {
            return Err(Error::Configuration(
                "processing.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if processing.allowed_extensions.is_empty() {
            return Err(Error::Configuration(
                "processing.allowed_extensions must not be empty".to_string(),
            ));
        }

        if processing.max_consecutive_storage_failures == 0 {
            return Err(Error::Configuration(
                "processing.max_consecutive_storage_failures must be at least 1".to_string(),
            ));
        }

        for prompt in &self.llm.prompts {
            if !(0.0..=2.0).contains(&prompt.temperature) {
                return Err(Error::Configuration(format!(
                    "Prompt '{}' has temperature {} outside 0.0..=2.0",
                    prompt.id, prompt.temperature
                )));
            }
            if prompt.max_tokens == 0 {
                return Err(Error::Configuration(format!(
                    "Prompt '{}' must allow at least one token",
                    prompt.id
                )));
            }
        }

        Ok(())
    }

    /// Effective worker count for parallel processing
    pub fn worker_threads(&self) -> usize {
        match self.processing.threads {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}
