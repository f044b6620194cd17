//! The set of analysis slots every image is expected to have.
//!
//! A [`TaskKey`] names one slot: a CLIP interrogation mode, or an LLM prompt
//! run on a specific model. The [`TaskCatalog`] is derived from [`Config`]
//! once per batch and never changes while the batch runs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::analyzer::Provider;
use crate::config::Config;
use crate::error::{Error, Result};

/// Modes understood by the CLIP interrogator
pub const CLIP_MODES: &[&str] = &["best", "fast", "classic", "negative", "caption"];

/// Which external analyzer a task is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerCategory {
    Clip,
    Llm,
}

impl AnalyzerCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalyzerCategory::Clip => "clip",
            AnalyzerCategory::Llm => "llm",
        }
    }
}

impl fmt::Display for AnalyzerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one requested analysis slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    Clip { mode: String },
    Llm { prompt: String, model: String },
}

impl TaskKey {
    pub fn clip(mode: impl Into<String>) -> Self {
        TaskKey::Clip { mode: mode.into() }
    }

    pub fn llm(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        TaskKey::Llm {
            prompt: prompt.into(),
            model: model.into(),
        }
    }

    pub fn category(&self) -> AnalyzerCategory {
        match self {
            TaskKey::Clip { .. } => AnalyzerCategory::Clip,
            TaskKey::Llm { .. } => AnalyzerCategory::Llm,
        }
    }

    /// Stable string form used as the key of `AnalysisRecord::results`
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Clip { mode } => write!(f, "clip:{}", mode),
            TaskKey::Llm { prompt, model } => write!(f, "llm:{}:{}", prompt, model),
        }
    }
}

impl FromStr for TaskKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let category = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        let malformed = || Error::Configuration(format!("Malformed task key '{}'", s));

        match category {
            "clip" => match rest.as_slice() {
                [mode] if !mode.is_empty() => Ok(TaskKey::clip(*mode)),
                _ => Err(malformed()),
            },
            "llm" => match rest.as_slice() {
                [prompt, model] if !prompt.is_empty() && !model.is_empty() => {
                    Ok(TaskKey::llm(*prompt, *model))
                }
                _ => Err(malformed()),
            },
            other => Err(Error::Configuration(format!(
                "Unknown analyzer category '{}' in task key '{}'",
                other, s
            ))),
        }
    }
}

/// Ordered, duplicate-free set of task keys for the current configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCatalog {
    keys: Vec<TaskKey>,
}

impl TaskCatalog {
    /// Build a catalog from keys, dropping duplicates and keeping first occurrence order
    pub fn from_keys(keys: impl IntoIterator<Item = TaskKey>) -> Self {
        let mut seen = HashSet::new();
        let keys = keys
            .into_iter()
            .filter(|key| seen.insert(key.clone()))
            .collect();
        Self { keys }
    }

    pub fn keys(&self) -> &[TaskKey] {
        &self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskKey> {
        self.keys.iter()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.keys.contains(key)
    }
}

/// Derive the task catalog from configuration.
///
/// Pure function: no I/O and no environment lookups. Contradictions are
/// reported as [`Error::Configuration`] instead of being skipped.
pub fn catalog(config: &Config) -> Result<TaskCatalog> {
    let mut keys = Vec::new();

    if config.clip.enabled {
        for mode in &config.clip.modes {
            check_identifier("CLIP mode", mode)?;
            if !CLIP_MODES.contains(&mode.as_str()) {
                return Err(Error::Configuration(format!(
                    "Unknown CLIP mode '{}', expected one of: {}",
                    mode,
                    CLIP_MODES.join(", ")
                )));
            }
            keys.push(TaskKey::clip(mode.as_str()));
        }
    }

    if config.llm.enabled {
        let mut model_ids = HashSet::new();
        for model in &config.llm.models {
            check_identifier("LLM model id", &model.id)?;
            if !model_ids.insert(model.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "Duplicate LLM model id '{}'",
                    model.id
                )));
            }
            model.provider.parse::<Provider>()?;
        }

        let enabled: Vec<&str> = config
            .llm
            .models
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.id.as_str())
            .collect();

        let mut prompt_ids = HashSet::new();
        for prompt in &config.llm.prompts {
            check_identifier("prompt id", &prompt.id)?;
            if !prompt_ids.insert(prompt.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "Duplicate prompt id '{}'",
                    prompt.id
                )));
            }

            match &prompt.models {
                None => {
                    for model in &enabled {
                        keys.push(TaskKey::llm(prompt.id.as_str(), *model));
                    }
                }
                Some(selected) => {
                    for model_id in selected {
                        if !model_ids.contains(model_id.as_str()) {
                            return Err(Error::Configuration(format!(
                                "Prompt '{}' references unknown model '{}'",
                                prompt.id, model_id
                            )));
                        }
                        if !enabled.contains(&model_id.as_str()) {
                            return Err(Error::Configuration(format!(
                                "Prompt '{}' selects disabled model '{}'",
                                prompt.id, model_id
                            )));
                        }
                        keys.push(TaskKey::llm(prompt.id.as_str(), model_id.as_str()));
                    }
                }
            }
        }
    }

    Ok(TaskCatalog::from_keys(keys))
}

fn check_identifier(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Configuration(format!("Empty {}", what)));
    }
    if value.contains(':') {
        return Err(Error::Configuration(format!(
            "{} '{}' must not contain ':'",
            what, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmModelConfig, PromptConfig};

    fn model(id: &str, provider: &str, enabled: bool) -> LlmModelConfig {
        LlmModelConfig {
            id: id.to_string(),
            provider: provider.to_string(),
            model_name: id.to_string(),
            url: None,
            api_key_env: None,
            enabled,
        }
    }

    fn prompt(id: &str, models: Option<&[&str]>) -> PromptConfig {
        PromptConfig {
            id: id.to_string(),
            text: format!("text for {}", id),
            temperature: 0.5,
            max_tokens: 100,
            models: models.map(|m| m.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.clip.modes = vec!["best".to_string(), "caption".to_string()];
        config.llm.models = vec![
            model("modelA", "openai", true),
            model("modelB", "ollama", true),
        ];
        config.llm.prompts = vec![prompt("p1", None), prompt("p2", Some(&["modelB"]))];
        config
    }

    #[test]
    fn test_key_encoding() {
        assert_eq!(TaskKey::clip("best").encode(), "clip:best");
        assert_eq!(TaskKey::llm("p1", "modelA").encode(), "llm:p1:modelA");

        assert_eq!("clip:best".parse::<TaskKey>().unwrap(), TaskKey::clip("best"));
        assert_eq!(
            "llm:p1:modelA".parse::<TaskKey>().unwrap(),
            TaskKey::llm("p1", "modelA")
        );
    }

    #[test]
    fn test_key_parse_rejects_bad_input() {
        assert!("vision:best".parse::<TaskKey>().is_err());
        assert!("clip:".parse::<TaskKey>().is_err());
        assert!("llm:p1".parse::<TaskKey>().is_err());
        assert!("llm:p1:m:extra".parse::<TaskKey>().is_err());
    }

    #[test]
    fn test_catalog_order() {
        let catalog = catalog(&config()).unwrap();
        let encoded: Vec<String> = catalog.iter().map(TaskKey::encode).collect();

        assert_eq!(
            encoded,
            vec![
                "clip:best",
                "clip:caption",
                "llm:p1:modelA",
                "llm:p1:modelB",
                "llm:p2:modelB",
            ]
        );
    }

    #[test]
    fn test_disabled_categories_are_excluded() {
        let mut config = config();
        config.clip.enabled = false;
        config.llm.enabled = false;
        assert!(catalog(&config).unwrap().is_empty());
    }

    #[test]
    fn test_implicit_prompt_skips_disabled_models() {
        let mut config = config();
        config.llm.models[0].enabled = false;
        config.llm.prompts = vec![prompt("p1", None)];

        let catalog = catalog(&config).unwrap();
        assert!(!catalog.contains(&TaskKey::llm("p1", "modelA")));
        assert!(catalog.contains(&TaskKey::llm("p1", "modelB")));
    }

    #[test]
    fn test_prompt_selecting_disabled_model_is_an_error() {
        let mut config = config();
        config.llm.models[1].enabled = false;

        let err = catalog(&config).unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("disabled model")));
    }

    #[test]
    fn test_prompt_selecting_unknown_model_is_an_error() {
        let mut config = config();
        config.llm.prompts = vec![prompt("p1", Some(&["ghost"]))];

        let err = catalog(&config).unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("unknown model")));
    }

    #[test]
    fn test_unknown_provider_is_an_error() {
        let mut config = config();
        config.llm.models.push(model("modelC", "telepathy", true));
        assert!(matches!(catalog(&config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_unknown_clip_mode_is_an_error() {
        let mut config = config();
        config.clip.modes.push("psychic".to_string());
        assert!(matches!(catalog(&config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_colon_in_identifier_is_an_error() {
        let mut config = config();
        config.llm.prompts = vec![prompt("p:1", None)];
        assert!(matches!(catalog(&config), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_duplicate_modes_collapse() {
        let mut config = config();
        config.clip.modes = vec!["best".to_string(), "best".to_string()];
        config.llm.enabled = false;
        assert_eq!(catalog(&config).unwrap().len(), 1);
    }
}
