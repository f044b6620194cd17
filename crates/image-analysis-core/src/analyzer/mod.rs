//! Remote analyzers.
//!
//! Each analyzer turns one [`AnalysisRequest`] into an opaque JSON payload.
//! Transport failures, HTTP failures and application-level failures are all
//! mapped into [`RemoteCallError`] so the executor can decide whether to retry.

mod clip;
mod http;
mod llm;

pub use clip::ClipAnalyzer;
pub use llm::{LlmAnalyzer, LlmEndpoint};

use base64::Engine;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::types::{extension_of, mime_for_extension};

/// Remote LLM API families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Ollama,
    OpenAi,
    Anthropic,
    Google,
    Grok,
    Mistral,
    Perplexity,
}

impl Provider {
    pub const ALL: [Provider; 7] = [
        Provider::Ollama,
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Google,
        Provider::Grok,
        Provider::Mistral,
        Provider::Perplexity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::Grok => "grok",
            Provider::Mistral => "mistral",
            Provider::Perplexity => "perplexity",
        }
    }

    /// Base URL used when a model does not override it
    pub fn default_url(self) -> &'static str {
        match self {
            Provider::Ollama => "http://localhost:11434",
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
            Provider::Google => "https://generativelanguage.googleapis.com/v1",
            Provider::Grok => "https://api.x.ai/v1",
            Provider::Mistral => "https://api.mistral.ai/v1",
            Provider::Perplexity => "https://api.perplexity.ai",
        }
    }

    /// Environment variable holding the API key; `None` for keyless local servers
    pub fn default_key_env(self) -> Option<&'static str> {
        match self {
            Provider::Ollama => None,
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Google => Some("GOOGLE_API_KEY"),
            Provider::Grok => Some("GROK_API_KEY"),
            Provider::Mistral => Some("MISTRAL_API_KEY"),
            Provider::Perplexity => Some("PERPLEXITY_API_KEY"),
        }
    }

    /// Speaks the `/chat/completions` dialect
    pub fn is_openai_compatible(self) -> bool {
        matches!(
            self,
            Provider::OpenAi | Provider::Grok | Provider::Mistral | Provider::Perplexity
        )
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        Provider::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "Unknown LLM provider '{}', expected one of: {}",
                    s,
                    Provider::ALL.map(Provider::as_str).join(", ")
                ))
            })
    }
}

/// Image bytes encoded once per file and shared by every task of that file
#[derive(Clone)]
pub struct ImagePayload {
    /// Standard base64, no line breaks
    pub data: String,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Read and encode an image file
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        let mime = mime_for_extension(&extension_of(path).unwrap_or_default());
        Ok(Self::from_bytes(&bytes, mime))
    }

    /// `data:` URL form used by OpenAI-compatible APIs
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("encoded_len", &self.data.len())
            .finish()
    }
}

/// Per-task parameters resolved from the catalog and configuration
#[derive(Debug, Clone, PartialEq)]
pub enum TaskParameters {
    Clip {
        mode: String,
    },
    Llm {
        prompt_text: String,
        /// Model id as configured, resolved to an endpoint by the analyzer
        model: String,
        temperature: f32,
        max_tokens: u32,
    },
}

/// One unit of work handed to an [`Analyzer`]
#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub image: &'a ImagePayload,
    pub parameters: TaskParameters,
}

/// A remote analysis service.
///
/// Implementations must be callable from several worker threads at once.
pub trait Analyzer: Send + Sync {
    /// Short name for log lines
    fn name(&self) -> &str;

    fn analyze(&self, request: &AnalysisRequest<'_>) -> std::result::Result<Value, RemoteCallError>;
}

/// Failure of a single remote call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteCallError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// HTTP success whose body reports a failure
    #[error("Service error: {0}")]
    Application(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),
}

impl RemoteCallError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteCallError::Network(_)
            | RemoteCallError::Timeout
            | RemoteCallError::RateLimited { .. } => true,
            RemoteCallError::Http { status, .. } => *status >= 500,
            RemoteCallError::Application(_)
            | RemoteCallError::InvalidResponse(_)
            | RemoteCallError::NotConfigured(_) => false,
        }
    }
}
