//! Inference engine client for the local Ollama runtime
//!
//! Generation and model lookup go over HTTP; model builds shell out to
//! `ollama create` with a generated Modelfile.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::OllamaConfig;

/// The model runtime the agent talks to
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Generate a completion for `prompt` with `model_id`
    async fn generate(&self, model_id: &str, prompt: &str) -> Result<String>;

    /// Whether `model_id` is currently deployable
    async fn has_model(&self, model_id: &str) -> Result<bool>;

    /// Build `model_id` from `base_model`, merging `adapter` when given
    async fn build_model(&self, model_id: &str, base_model: &str, adapter: Option<&Path>) -> Result<()>;
}

/// Ollama HTTP + CLI client
#[derive(Clone)]
pub struct OllamaClient {
    client: Arc<Client>,
    base_url: String,
    ollama_bin: String,
    /// Where generated Modelfiles are written
    work_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Serialize)]
struct ShowRequest<'a> {
    model: &'a str,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig, work_dir: PathBuf) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.generate_timeout_secs))
            .build()
            .context("Failed to build Ollama HTTP client")?;

        Ok(Self {
            client: Arc::new(client),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ollama_bin: config.ollama_bin.clone(),
            work_dir,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Modelfile merging an optional adapter onto a base model
pub fn render_modelfile(base_model: &str, adapter: Option<&Path>) -> String {
    let mut modelfile = format!("FROM {}\n", base_model);
    if let Some(adapter) = adapter {
        modelfile.push_str(&format!("ADAPTER {}\n", adapter.display()));
    }
    modelfile
}

#[async_trait]
impl InferenceEngine for OllamaClient {
    async fn generate(&self, model_id: &str, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            model: model_id,
            prompt,
            stream: false,
        };

        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&request)
            .send()
            .await
            .context("Failed to send generate request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("Ollama generate error ({}): {}", status, error_text);
        }

        let result: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse generate response")?;

        Ok(result.response.trim().to_string())
    }

    async fn has_model(&self, model_id: &str) -> Result<bool> {
        let response = self
            .client
            .post(self.url("/api/show"))
            .json(&ShowRequest { model: model_id })
            .send()
            .await
            .context("Failed to query Ollama model")?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => {
                let error_text = response.text().await.unwrap_or_default();
                bail!("Ollama show error ({}): {}", s, error_text)
            }
        }
    }

    async fn build_model(&self, model_id: &str, base_model: &str, adapter: Option<&Path>) -> Result<()> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .context("Failed to create Modelfile directory")?;

        let modelfile_path = self.work_dir.join("Modelfile");
        tokio::fs::write(&modelfile_path, render_modelfile(base_model, adapter))
            .await
            .context("Failed to write Modelfile")?;

        info!("Building model {} from {} (adapter: {})", model_id, base_model, adapter.is_some());

        let output = tokio::process::Command::new(&self.ollama_bin)
            .arg("create")
            .arg(model_id)
            .arg("-f")
            .arg(&modelfile_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.ollama_bin))?;

        if !output.status.success() {
            bail!(
                "ollama create exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        debug!("ollama create: {}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_client(dir: &Path) -> OllamaClient {
        let config = OllamaConfig {
            base_url: "http://127.0.0.1:9/".to_string(),
            ollama_bin: "/nonexistent/ollama".to_string(),
            generate_timeout_secs: 1,
            ..Default::default()
        };
        OllamaClient::new(&config, dir.to_path_buf()).unwrap()
    }

    #[test]
    fn test_render_modelfile() {
        assert_eq!(render_modelfile("phi3:mini", None), "FROM phi3:mini\n");
        assert_eq!(
            render_modelfile("phi3:mini", Some(Path::new("/m/latest_lora.safetensors"))),
            "FROM phi3:mini\nADAPTER /m/latest_lora.safetensors\n"
        );
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let dir = tempfile::tempdir().unwrap();
        let client = unreachable_client(dir.path());
        assert_eq!(client.url("/api/generate"), "http://127.0.0.1:9/api/generate");
    }

    #[tokio::test]
    async fn test_generate_unreachable_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = unreachable_client(dir.path());
        assert!(client.generate("phi3:evolving", "hi").await.is_err());
        assert!(client.has_model("phi3:evolving").await.is_err());
    }

    #[tokio::test]
    async fn test_build_with_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = unreachable_client(dir.path());
        let result = client.build_model("phi3:evolving", "phi3:mini", None).await;
        assert!(result.is_err());
        assert!(dir.path().join("Modelfile").exists());
    }
}
