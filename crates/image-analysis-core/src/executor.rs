//! Runs one task against its analyzer, with retries.

use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analyzer::{
    AnalysisRequest, Analyzer, ClipAnalyzer, ImagePayload, LlmAnalyzer, RemoteCallError,
    TaskParameters,
};
use crate::catalog::TaskKey;
use crate::config::{Config, PromptConfig};
use crate::error::Result;
use crate::logging::log_task_failure;
use crate::record::TaskResult;

/// Longest uninterrupted sleep while waiting to retry
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Attempt budget and backoff schedule for remote calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_delay: Duration,
    /// Cap on rate-limit waits, whatever the server asks for
    pub max_rate_limit_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        let p = &config.processing;
        Self {
            max_attempts: p.max_attempts.max(1),
            base_delay: Duration::from_millis(p.base_delay_ms),
            max_delay: Duration::from_millis(p.max_delay_ms),
            rate_limit_delay: Duration::from_millis(p.rate_limit_delay_ms),
            max_rate_limit_delay: Duration::from_millis(p.max_rate_limit_delay_ms),
        }
    }

    /// Retries without sleeping
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
            max_rate_limit_delay: Duration::ZERO,
        }
    }

    /// Wait before the attempt following failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32, error: &RemoteCallError) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        match error {
            RemoteCallError::RateLimited { retry_after } => {
                let backoff = self.rate_limit_delay.saturating_mul(factor);
                retry_after
                    .map_or(backoff, |server| server.max(backoff))
                    .min(self.max_rate_limit_delay)
            }
            _ => self.base_delay.saturating_mul(factor).min(self.max_delay),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Dispatches task keys to analyzers and turns every outcome into a [`TaskResult`]
pub struct TaskExecutor {
    clip: Option<Arc<dyn Analyzer>>,
    llm: Option<Arc<dyn Analyzer>>,
    prompts: HashMap<String, PromptConfig>,
    policy: RetryPolicy,
    shutdown: Option<Arc<AtomicBool>>,
}

impl TaskExecutor {
    /// Executor without analyzers; attach them with [`with_clip`](Self::with_clip)
    /// and [`with_llm`](Self::with_llm)
    pub fn new(config: &Config, policy: RetryPolicy) -> Self {
        let prompts = config
            .llm
            .prompts
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();

        Self {
            clip: None,
            llm: None,
            prompts,
            policy,
            shutdown: None,
        }
    }

    /// Executor backed by the real HTTP analyzers for every enabled category
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.processing.request_timeout_secs);
        let mut executor = Self::new(config, RetryPolicy::from_config(config));

        if config.clip.enabled {
            executor = executor.with_clip(Arc::new(ClipAnalyzer::new(&config.clip, timeout)?));
        }
        if config.llm.enabled {
            executor = executor.with_llm(Arc::new(LlmAnalyzer::new(&config.llm, timeout)?));
        }
        Ok(executor)
    }

    pub fn with_clip(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.clip = Some(analyzer);
        self
    }

    pub fn with_llm(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.llm = Some(analyzer);
        self
    }

    /// Abandon pending retries once `flag` is set
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst))
    }

    /// Sleep in short slices; returns false if shutdown was requested meanwhile
    fn wait_before_retry(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.shutdown_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }

    /// Encode the file and run one task
    pub fn execute(&self, key: &TaskKey, path: &Path) -> TaskResult {
        match ImagePayload::from_file(path) {
            Ok(image) => self.execute_with_payload(key, &image),
            Err(e) => TaskResult::error(format!("Failed to read image: {}", e), 0),
        }
    }

    /// Run one task on an already encoded image; never fails, errors become error results
    pub fn execute_with_payload(&self, key: &TaskKey, image: &ImagePayload) -> TaskResult {
        let (analyzer, parameters) = match self.resolve(key) {
            Ok(resolved) => resolved,
            Err(message) => {
                warn!("Task {} cannot run: {}", key, message);
                return TaskResult::error(message, 0);
            }
        };

        let request = AnalysisRequest { image, parameters };
        let mut attempt = 0;

        loop {
            attempt += 1;
            match analyzer.analyze(&request) {
                Ok(payload) => {
                    debug!("Task {} succeeded on attempt {}", key, attempt);
                    return TaskResult::success(payload, attempt);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt, &e);
                    warn!(
                        "Task {} attempt {}/{} failed: {}; retrying in {:?}",
                        key, attempt, self.policy.max_attempts, e, delay
                    );
                    if !self.wait_before_retry(delay) {
                        warn!("Task {} retry abandoned: shutdown requested", key);
                        return TaskResult::error(
                            format!("{} (retry abandoned on shutdown)", e),
                            attempt,
                        );
                    }
                }
                Err(e) => {
                    log_task_failure(key, attempt, &e);
                    return TaskResult::error(e.to_string(), attempt);
                }
            }
        }
    }

    fn resolve(
        &self,
        key: &TaskKey,
    ) -> std::result::Result<(&dyn Analyzer, TaskParameters), String> {
        match key {
            TaskKey::Clip { mode } => {
                let analyzer = self
                    .clip
                    .as_deref()
                    .ok_or_else(|| "No CLIP analyzer configured".to_string())?;
                Ok((analyzer, TaskParameters::Clip { mode: mode.clone() }))
            }
            TaskKey::Llm { prompt, model } => {
                let analyzer = self
                    .llm
                    .as_deref()
                    .ok_or_else(|| "No LLM analyzer configured".to_string())?;
                let prompt = self
                    .prompts
                    .get(prompt)
                    .ok_or_else(|| format!("Unknown prompt '{}'", prompt))?;
                Ok((
                    analyzer,
                    TaskParameters::Llm {
                        prompt_text: prompt.text.clone(),
                        model: model.clone(),
                        temperature: prompt.temperature,
                        max_tokens: prompt.max_tokens,
                    },
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Replays a fixed script of responses, then succeeds
    struct Scripted {
        script: Mutex<Vec<std::result::Result<Value, RemoteCallError>>>,
        seen: Mutex<Vec<TaskParameters>>,
    }

    impl Scripted {
        fn new(script: Vec<std::result::Result<Value, RemoteCallError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl Analyzer for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn analyze(&self, request: &AnalysisRequest<'_>) -> std::result::Result<Value, RemoteCallError> {
            self.seen.lock().unwrap().push(request.parameters.clone());
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(json!({"ok": true})))
        }
    }

    fn image() -> ImagePayload {
        ImagePayload::from_bytes(b"pixels", "image/jpeg")
    }

    fn executor(analyzer: Arc<Scripted>, attempts: u32) -> TaskExecutor {
        TaskExecutor::new(&Config::default(), RetryPolicy::immediate(attempts))
            .with_clip(analyzer.clone())
            .with_llm(analyzer)
    }

    #[test]
    fn test_success_first_try() {
        let analyzer = Scripted::new(vec![Ok(json!({"prompt": "a cat"}))]);
        let result = executor(analyzer.clone(), 3).execute_with_payload(&TaskKey::clip("best"), &image());

        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.payload["prompt"], "a cat");
        assert_eq!(analyzer.calls(), 1);
    }

    #[test]
    fn test_retryable_errors_are_retried() {
        let analyzer = Scripted::new(vec![
            Err(RemoteCallError::Timeout),
            Err(RemoteCallError::Http { status: 502, message: "bad gateway".into() }),
            Ok(json!({"prompt": "x"})),
        ]);
        let result = executor(analyzer.clone(), 3).execute_with_payload(&TaskKey::clip("fast"), &image());

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(analyzer.calls(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let analyzer = Scripted::new(vec![
            Err(RemoteCallError::RateLimited { retry_after: None }),
            Err(RemoteCallError::RateLimited { retry_after: None }),
            Err(RemoteCallError::RateLimited { retry_after: None }),
        ]);
        let result = executor(analyzer.clone(), 2).execute_with_payload(&TaskKey::clip("best"), &image());

        assert!(!result.is_success());
        assert_eq!(result.attempts, 2);
        assert_eq!(analyzer.calls(), 2);
    }

    #[test]
    fn test_non_retryable_error_stops_immediately() {
        let analyzer = Scripted::new(vec![Err(RemoteCallError::Application("bad image".into()))]);
        let result = executor(analyzer.clone(), 5).execute_with_payload(&TaskKey::clip("best"), &image());

        assert!(!result.is_success());
        assert_eq!(result.attempts, 1);
        assert!(result.error_message.unwrap().contains("bad image"));
        assert_eq!(analyzer.calls(), 1);
    }

    #[test]
    fn test_llm_parameters_come_from_prompt_config() {
        let analyzer = Scripted::new(vec![]);
        let executor = executor(analyzer.clone(), 1);
        let result = executor.execute_with_payload(&TaskKey::llm("P1", "llava"), &image());

        assert!(result.is_success());
        let seen = analyzer.seen.lock().unwrap();
        match &seen[0] {
            TaskParameters::Llm { model, temperature, max_tokens, prompt_text } => {
                assert_eq!(model, "llava");
                assert_eq!(*max_tokens, 1000);
                assert!((*temperature - 0.7).abs() < f32::EPSILON);
                assert!(prompt_text.starts_with("Describe this image"));
            }
            other => panic!("unexpected parameters {:?}", other),
        }
    }

    #[test]
    fn test_unknown_prompt_is_error_result() {
        let analyzer = Scripted::new(vec![]);
        let result = executor(analyzer.clone(), 3).execute_with_payload(&TaskKey::llm("ghost", "llava"), &image());

        assert!(!result.is_success());
        assert_eq!(result.attempts, 0);
        assert_eq!(analyzer.calls(), 0);
    }

    #[test]
    fn test_missing_analyzer_is_error_result() {
        let executor = TaskExecutor::new(&Config::default(), RetryPolicy::immediate(1));
        let result = executor.execute_with_payload(&TaskKey::clip("best"), &image());
        assert!(!result.is_success());
        assert!(result.error_message.unwrap().contains("No CLIP analyzer"));
    }

    #[test]
    fn test_unreadable_file_is_error_result() {
        let analyzer = Scripted::new(vec![]);
        let result = executor(analyzer, 1).execute(&TaskKey::clip("best"), Path::new("/no/such/file.jpg"));
        assert!(!result.is_success());
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            rate_limit_delay: Duration::from_secs(1),
            max_rate_limit_delay: Duration::from_secs(60),
        };
        let timeout = RemoteCallError::Timeout;

        assert_eq!(policy.delay_after(1, &timeout), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2, &timeout), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3, &timeout), Duration::from_millis(350));

        let limited = RemoteCallError::RateLimited { retry_after: None };
        assert_eq!(policy.delay_after(2, &limited), Duration::from_secs(2));

        let told = RemoteCallError::RateLimited { retry_after: Some(Duration::from_secs(30)) };
        assert_eq!(policy.delay_after(1, &told), Duration::from_secs(30));
    }

    #[test]
    fn test_rate_limit_wait_is_capped() {
        let policy = RetryPolicy::from_config(&Config::default());
        let cap = Duration::from_millis(Config::default().processing.max_rate_limit_delay_ms);

        let a_year = RemoteCallError::RateLimited {
            retry_after: Some(Duration::from_secs(365 * 24 * 3600)),
        };
        assert_eq!(policy.delay_after(1, &a_year), cap);

        // Doubling alone must not run past the cap either
        let limited = RemoteCallError::RateLimited { retry_after: None };
        assert_eq!(policy.delay_after(30, &limited), cap);
        assert_eq!(policy.delay_after(1, &limited), Duration::from_secs(10));
    }

    fn slow_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            rate_limit_delay: Duration::from_secs(30),
            max_rate_limit_delay: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_shutdown_abandons_retry_without_sleeping() {
        let analyzer = Scripted::new(vec![Err(RemoteCallError::Timeout)]);
        let flag = Arc::new(AtomicBool::new(true));
        let executor = TaskExecutor::new(&Config::default(), slow_policy(3))
            .with_clip(analyzer.clone())
            .with_shutdown(flag);

        let started = Instant::now();
        let result = executor.execute_with_payload(&TaskKey::clip("best"), &image());

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.is_success());
        assert_eq!(result.attempts, 1);
        assert!(result.error_message.unwrap().contains("shutdown"));
        assert_eq!(analyzer.calls(), 1);
    }

    #[test]
    fn test_shutdown_interrupts_a_long_wait() {
        let analyzer = Scripted::new(vec![Err(RemoteCallError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        })]);
        let flag = Arc::new(AtomicBool::new(false));
        let executor = TaskExecutor::new(&Config::default(), slow_policy(3))
            .with_clip(analyzer.clone())
            .with_shutdown(flag.clone());

        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            flag.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        let result = executor.execute_with_payload(&TaskKey::clip("best"), &image());
        setter.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.attempts, 1);
        assert_eq!(analyzer.calls(), 1);
    }
}
