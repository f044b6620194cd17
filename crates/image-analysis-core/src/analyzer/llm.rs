use log::debug;
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::http::{build_client, send_json};
use super::{AnalysisRequest, Analyzer, ImagePayload, Provider, RemoteCallError, TaskParameters};
use crate::config::{LlmConfig, LlmModelConfig};
use crate::error::Result;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Where and how one configured model is reached
#[derive(Clone)]
pub struct LlmEndpoint {
    pub provider: Provider,
    pub base_url: String,
    pub model_name: String,
    api_key: Option<String>,
}

impl LlmEndpoint {
    pub fn new(
        provider: Provider,
        base_url: impl Into<String>,
        model_name: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model_name: model_name.into(),
            api_key,
        }
    }

    /// Resolve provider defaults and read the API key from the environment
    pub fn from_config(model: &LlmModelConfig) -> Result<Self> {
        let provider: Provider = model.provider.parse()?;
        let base_url = model
            .url
            .clone()
            .unwrap_or_else(|| provider.default_url().to_string());
        let key_env = model
            .api_key_env
            .as_deref()
            .or_else(|| provider.default_key_env());
        let api_key = key_env
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());

        Ok(Self::new(provider, base_url, &model.model_name, api_key))
    }

    fn requires_key(&self) -> bool {
        self.provider != Provider::Ollama
    }
}

impl fmt::Debug for LlmEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmEndpoint")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("model_name", &self.model_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Client for every configured LLM model, keyed by model id
pub struct LlmAnalyzer {
    client: Client,
    endpoints: HashMap<String, LlmEndpoint>,
}

impl LlmAnalyzer {
    /// Build from the enabled models in configuration
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self> {
        let mut endpoints = HashMap::new();
        for model in config.models.iter().filter(|m| m.enabled) {
            endpoints.insert(model.id.clone(), LlmEndpoint::from_config(model)?);
        }
        Self::with_endpoints(endpoints, timeout)
    }

    pub fn with_endpoints(endpoints: HashMap<String, LlmEndpoint>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, false)?,
            endpoints,
        })
    }

    fn request_for(
        &self,
        endpoint: &LlmEndpoint,
        body: &Value,
    ) -> RequestBuilder {
        let key = endpoint.api_key.as_deref().unwrap_or_default();
        let base = &endpoint.base_url;

        match endpoint.provider {
            Provider::Ollama => self.client.post(format!("{}/api/generate", base)),
            Provider::Anthropic => self
                .client
                .post(format!("{}/messages", base))
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            Provider::Google => self
                .client
                .post(format!(
                    "{}/models/{}:generateContent",
                    base, endpoint.model_name
                ))
                .header("x-goog-api-key", key),
            Provider::OpenAi | Provider::Grok | Provider::Mistral | Provider::Perplexity => self
                .client
                .post(format!("{}/chat/completions", base))
                .bearer_auth(key),
        }
        .json(body)
    }
}

impl Analyzer for LlmAnalyzer {
    fn name(&self) -> &str {
        "llm"
    }

    fn analyze(&self, request: &AnalysisRequest<'_>) -> std::result::Result<Value, RemoteCallError> {
        let TaskParameters::Llm {
            prompt_text,
            model,
            temperature,
            max_tokens,
        } = &request.parameters
        else {
            return Err(RemoteCallError::NotConfigured(
                "LLM analyzer received a non-LLM task".to_string(),
            ));
        };

        let endpoint = self.endpoints.get(model).ok_or_else(|| {
            RemoteCallError::NotConfigured(format!("No endpoint for model '{}'", model))
        })?;

        if endpoint.requires_key() && endpoint.api_key.is_none() {
            return Err(RemoteCallError::NotConfigured(format!(
                "API key for {} model '{}' is not set",
                endpoint.provider, model
            )));
        }

        let body = request_body(
            endpoint.provider,
            &endpoint.model_name,
            request.image,
            prompt_text,
            *temperature,
            *max_tokens,
        );

        debug!(
            "LLM request: provider={} model={}",
            endpoint.provider, endpoint.model_name
        );
        let response = send_json(self.request_for(endpoint, &body))?;
        let (text, usage) = extract_text(endpoint.provider, &response)?;

        Ok(json!({
            "text": text,
            "model": endpoint.model_name,
            "provider": endpoint.provider.as_str(),
            "usage": usage,
        }))
    }
}

/// JSON body for one provider
pub(crate) fn request_body(
    provider: Provider,
    model_name: &str,
    image: &ImagePayload,
    prompt: &str,
    temperature: f32,
    max_tokens: u32,
) -> Value {
    match provider {
        Provider::Ollama => json!({
            "model": model_name,
            "prompt": prompt,
            "images": [image.data],
            "stream": false,
            "options": {"temperature": temperature, "num_predict": max_tokens},
        }),
        Provider::Anthropic => json!({
            "model": model_name,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image", "source": {
                        "type": "base64",
                        "media_type": image.mime_type,
                        "data": image.data,
                    }},
                ],
            }],
        }),
        Provider::Google => json!({
            "contents": [{
                "parts": [
                    {"text": prompt},
                    {"inline_data": {"mime_type": image.mime_type, "data": image.data}},
                ],
            }],
            "generationConfig": {"temperature": temperature, "maxOutputTokens": max_tokens},
        }),
        Provider::OpenAi | Provider::Grok | Provider::Mistral | Provider::Perplexity => json!({
            "model": model_name,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": image.data_url()}},
                ],
            }],
            "temperature": temperature,
            "max_tokens": max_tokens,
        }),
    }
}

/// Pull the generated text and token usage out of a provider response
pub(crate) fn extract_text(
    provider: Provider,
    response: &Value,
) -> std::result::Result<(String, Value), RemoteCallError> {
    let (text, usage) = match provider {
        Provider::Ollama => (
            response.get("response"),
            json!({
                "prompt_eval_count": response.get("prompt_eval_count"),
                "eval_count": response.get("eval_count"),
            }),
        ),
        Provider::Anthropic => (
            response.pointer("/content/0/text"),
            response.get("usage").cloned().unwrap_or(Value::Null),
        ),
        Provider::Google => (
            response.pointer("/candidates/0/content/parts/0/text"),
            response.get("usageMetadata").cloned().unwrap_or(Value::Null),
        ),
        Provider::OpenAi | Provider::Grok | Provider::Mistral | Provider::Perplexity => (
            response.pointer("/choices/0/message/content"),
            response.get("usage").cloned().unwrap_or(Value::Null),
        ),
    };

    let text = text.and_then(Value::as_str).ok_or_else(|| {
        RemoteCallError::InvalidResponse(format!("{} response has no generated text", provider))
    })?;

    Ok((text.to_string(), usage))
}
