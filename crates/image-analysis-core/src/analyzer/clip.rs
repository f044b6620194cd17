use log::{debug, info, warn};
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;

use super::http::{build_client, send_json};
use super::{AnalysisRequest, Analyzer, RemoteCallError, TaskParameters};
use crate::config::ClipConfig;
use crate::error::Result;

/// Client for a CLIP interrogator service
pub struct ClipAnalyzer {
    client: Client,
    base_url: String,
    model_name: String,
    password: Option<String>,
    /// Login is attempted at most once per analyzer
    login_attempted: Mutex<bool>,
}

impl ClipAnalyzer {
    /// Build from configuration; the password is read from `password_env` if set
    pub fn new(config: &ClipConfig, timeout: Duration) -> Result<Self> {
        let password = config
            .password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client: build_client(timeout, true)?,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            model_name: config.model_name.clone(),
            password,
            login_attempted: Mutex::new(false),
        })
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Authenticate the cookie session; failure leaves the session anonymous
    fn ensure_login(&self) {
        let mut attempted = self
            .login_attempted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *attempted {
            return;
        }
        *attempted = true;

        let Some(password) = &self.password else {
            debug!("No CLIP password configured, using anonymous session");
            return;
        };

        info!("Authenticating with CLIP API at {}", self.base_url);
        let result = self
            .client
            .post(format!("{}/pinokio/login", self.base_url))
            .form(&[("password", password.as_str())])
            .send();

        match result {
            Ok(response) if response.status().is_success() => {
                info!("CLIP API login accepted");
            }
            Ok(response) => {
                warn!(
                    "CLIP API login returned {}, continuing without authentication",
                    response.status()
                );
            }
            Err(e) => {
                warn!(
                    "CLIP API login failed: {}, continuing without authentication",
                    e.without_url()
                );
            }
        }
    }
}

impl Analyzer for ClipAnalyzer {
    fn name(&self) -> &str {
        "clip"
    }

    fn analyze(&self, request: &AnalysisRequest<'_>) -> std::result::Result<Value, RemoteCallError> {
        let TaskParameters::Clip { mode } = &request.parameters else {
            return Err(RemoteCallError::NotConfigured(
                "CLIP analyzer received a non-CLIP task".to_string(),
            ));
        };

        self.ensure_login();

        debug!("CLIP request: mode={} model={}", mode, self.model_name);
        let body = json!({
            "image": request.image.data,
            "model": self.model_name,
            "mode": mode,
        });

        send_json(
            self.client
                .post(format!("{}/interrogator/prompt", self.base_url))
                .json(&body),
        )
    }
}
