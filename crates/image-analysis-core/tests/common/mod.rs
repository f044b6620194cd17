#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use image_analysis_core::analyzer::{AnalysisRequest, Analyzer, RemoteCallError, TaskParameters};
use image_analysis_core::config::{LlmModelConfig, PromptConfig};
use image_analysis_core::persistence::RecordStore;
use image_analysis_core::{Config, Orchestrator, RetryPolicy, TaskExecutor};
use serde_json::{json, Value};

type Rule = Box<dyn Fn(&TaskParameters) -> Option<RemoteCallError> + Send + Sync>;

/// Analyzer double that counts calls and fails on demand
pub struct FakeAnalyzer {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    fail_when: Rule,
}

impl FakeAnalyzer {
    pub fn succeeding() -> Arc<Self> {
        Self::failing_when(|_| None)
    }

    pub fn always_failing(error: RemoteCallError) -> Arc<Self> {
        Self::failing_when(move |_| Some(error.clone()))
    }

    pub fn failing_when(
        rule: impl Fn(&TaskParameters) -> Option<RemoteCallError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            fail_when: Box::new(rule),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `mode` for CLIP calls, `prompt text@model` for LLM calls, in call order
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Analyzer for FakeAnalyzer {
    fn name(&self) -> &str {
        "fake"
    }

    fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<Value, RemoteCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let label = match &request.parameters {
            TaskParameters::Clip { mode } => mode.clone(),
            TaskParameters::Llm { prompt_text, model, .. } => format!("{}@{}", prompt_text, model),
        };
        self.seen.lock().unwrap().push(label.clone());

        match (self.fail_when)(&request.parameters) {
            Some(error) => Err(error),
            None => Ok(json!({"text": format!("result for {}", label)})),
        }
    }
}

/// catalog = {clip:best, llm:p1:modelA}, no delays, no summaries
pub fn test_config(output_dir: &Path) -> Config {
    let mut config = Config::default();
    config.clip.modes = vec!["best".to_string()];
    config.clip.password_env = None;
    config.llm.models = vec![LlmModelConfig {
        id: "modelA".to_string(),
        provider: "openai".to_string(),
        model_name: "gpt-4o".to_string(),
        url: None,
        api_key_env: None,
        enabled: true,
    }];
    config.llm.prompts = vec![PromptConfig {
        id: "p1".to_string(),
        text: "describe".to_string(),
        temperature: 0.7,
        max_tokens: 100,
        models: None,
    }];
    config.store.output_directory = output_dir.to_path_buf();
    config.store.database_path = output_dir.join("records.db");
    config.processing.base_delay_ms = 0;
    config.processing.max_delay_ms = 0;
    config.processing.rate_limit_delay_ms = 0;
    config.processing.generate_summaries = false;
    config
}

pub fn orchestrator(
    config: Config,
    store: Box<dyn RecordStore>,
    clip: Arc<FakeAnalyzer>,
    llm: Arc<FakeAnalyzer>,
) -> Orchestrator {
    let executor = TaskExecutor::new(&config, RetryPolicy::immediate(config.processing.max_attempts))
        .with_clip(clip)
        .with_llm(llm);
    Orchestrator::new(config, store, executor).unwrap()
}

/// Write a small PNG whose pixels depend on `seed`
pub fn write_png(dir: &Path, name: &str, seed: u8) -> PathBuf {
    let path = dir.join(name);
    let img = image::RgbImage::from_fn(8, 6, |x, y| {
        image::Rgb([seed, (x * 16) as u8, (y * 32) as u8])
    });
    img.save_with_format(&path, image::ImageFormat::Png).unwrap();
    path
}

/// One canned HTTP response
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StubResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A request as seen by the stub server
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StubRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTP/1.1 responder serving one scripted response per connection
pub struct StubServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
    handle: Option<JoinHandle<()>>,
}

impl StubServer {
    pub fn start(responses: Vec<StubResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        let handle = std::thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => return,
                };

                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();

                let mut headers = Vec::new();
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((k, v)) = line.split_once(':') {
                        let (k, v) = (k.trim().to_string(), v.trim().to_string());
                        if k.eq_ignore_ascii_case("content-length") {
                            content_length = v.parse().unwrap_or(0);
                        }
                        headers.push((k, v));
                    }
                }

                let mut body = vec![0u8; content_length];
                reader.read_exact(&mut body).unwrap();

                seen.lock().unwrap().push(StubRequest {
                    request_line: request_line.trim_end().to_string(),
                    headers,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });

                let mut raw = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                    response.status,
                    response.body.len()
                );
                for (k, v) in &response.headers {
                    raw.push_str(&format!("{}: {}\r\n", k, v));
                }
                raw.push_str("\r\n");
                raw.push_str(&response.body);
                stream.write_all(raw.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });

        Self {
            base_url,
            requests,
            handle: Some(handle),
        }
    }

    /// Wait for every scripted response to be served and return the requests
    pub fn finish(mut self) -> Vec<StubRequest> {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        self.requests.lock().unwrap().clone()
    }
}
