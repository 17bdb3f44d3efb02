// ABOUTME: Client contract for the external prompt-to-code model gateway
// ABOUTME: Returns a filename-to-content map; credentials are opaque to the orchestrator

use crate::types::ModelProvider;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("code generation gateway error: {0}")]
    Gateway(String),

    #[error("code generation returned an invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, GeneratorError>;

/// The external prompt-to-code interface. Blocking from the run's point of
/// view and possibly minutes long; the lifecycle engine makes the call
/// cancellable, not this trait.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        provider: ModelProvider,
        model: &str,
    ) -> Result<HashMap<String, String>>;
}

#[derive(Deserialize)]
struct GenerateResponse {
    files: HashMap<String, String>,
}

/// HTTP client for the deployed code-generation gateway. Duplicate filenames
/// in the response collapse with last-occurrence-wins map semantics.
pub struct HttpCodeGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCodeGenerator {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl CodeGenerator for HttpCodeGenerator {
    async fn generate(
        &self,
        prompt: &str,
        provider: ModelProvider,
        model: &str,
    ) -> Result<HashMap<String, String>> {
        let url = format!("{}/generate", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "prompt": prompt,
            "provider": provider,
            "model": model,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GeneratorError::Gateway(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GeneratorError::Gateway(format!(
                "gateway returned {} for {} {}",
                response.status(),
                provider,
                model
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::InvalidResponse(e.to_string()))?;
        Ok(body.files)
    }
}
