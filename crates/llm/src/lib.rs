use anyhow::{anyhow, Context, Result};
use reqwest::{header::HeaderValue, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use tokio::runtime::Runtime;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_CHAT_MODEL: &str = "deepseek-r1:7b";
/// Retries after the first Ollama attempt on transport errors, 429 and 5xx.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Marker the answer prompt puts in front of the retrieved passages.
pub const CONTEXT_HEADING: &str = "### 背景信息：";
/// Marker the answer prompt puts in front of the user's question.
pub const QUESTION_HEADING: &str = "### 用户问题：";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "ollama" => Some(LlmProvider::Ollama),
            "local" => Some(LlmProvider::Local),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
}

impl LlmRequest {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            system: None,
            user: text.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    base_url: String,
    options: GenerationOptions,
    max_retries: usize,
}

impl LlmClient {
    /// Ollama's base URL comes from `OLLAMA_BASE_URL` when set.
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        let base_url = env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
        Self::with_base_url(provider, model, base_url)
    }

    pub fn with_base_url(
        provider: LlmProvider,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            provider,
            model: model.into(),
            base_url: base_url.into(),
            options: GenerationOptions::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// `0` makes every `generate` call a single request.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn generate(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match self.provider {
            LlmProvider::Ollama => self.generate_ollama(req).await,
            LlmProvider::Local => Ok(self.generate_local(req)),
        }
    }

    pub fn generate_blocking(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let rt = Runtime::new().context("failed to create tokio runtime")?;
        rt.block_on(self.generate(req))
    }

    async fn generate_ollama(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let mut payload = json!({
            "model": self.model,
            "prompt": req.user,
            "stream": false,
            "options": {
                "temperature": self.options.temperature,
                "top_p": self.options.top_p,
                "num_predict": self.options.max_tokens,
            },
        });
        if let Some(system) = &req.system {
            payload["system"] = json!(system);
        }
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match self.http.post(&url).json(&payload).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt > self.max_retries {
                        return Err(err).with_context(|| format!("ollama request to {url} failed"));
                    }
                    warn!(attempt, "ollama request failed, retrying: {err}");
                    sleep(backoff_delay(attempt, None)).await;
                    continue;
                }
            };
            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if attempt > self.max_retries {
                    return Err(anyhow!(
                        "ollama returned {status} after {} attempt(s)",
                        attempt
                    ));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                warn!(attempt, %status, "ollama busy, retrying");
                sleep(wait).await;
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(anyhow!("ollama returned error (status {status}): {body}"));
            }
            let decoded = decode_generate_body(&body)?;
            debug!(
                model = %self.model,
                prompt_tokens = decoded.prompt_tokens,
                completion_tokens = decoded.completion_tokens,
                "ollama generation finished"
            );
            return Ok(decoded);
        }
    }

    fn generate_local(&self, req: &LlmRequest) -> LlmResponse {
        LlmResponse {
            content: synthesize_local_response(req),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(value) = retry_after {
        if let Ok(text) = value.to_str() {
            if let Ok(secs) = text.parse::<u64>() {
                return Duration::from_secs(secs.max(1));
            }
        }
    }
    let capped = attempt.min(5) as u32;
    Duration::from_millis(250u64 << capped)
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

fn decode_generate_body(body: &str) -> Result<LlmResponse> {
    let decoded: GenerateResponse =
        serde_json::from_str(body).context("failed to decode ollama response")?;
    let content = decoded
        .response
        .ok_or_else(|| anyhow!("missing text in ollama response"))?;
    Ok(LlmResponse {
        content,
        prompt_tokens: decoded.prompt_eval_count.unwrap_or(0),
        completion_tokens: decoded.eval_count.unwrap_or(0),
    })
}

/// Offline stand-in: answer prompts get their highest-ranked passages
/// echoed back; anything else gets a short digest of the prompt.
fn synthesize_local_response(req: &LlmRequest) -> String {
    let prompt = match &req.system {
        Some(system) if system.contains(CONTEXT_HEADING) => system.as_str(),
        _ => req.user.as_str(),
    };
    if prompt.contains(CONTEXT_HEADING) {
        let context = extract_context_block(prompt, CONTEXT_HEADING, QUESTION_HEADING);
        let passages: Vec<&str> = context
            .lines()
            .filter_map(|line| line.trim().strip_prefix('('))
            .filter_map(|line| line.split_once(") ").map(|(_, text)| text.trim()))
            .filter(|text| !text.is_empty())
            .take(3)
            .collect();
        if passages.is_empty() {
            return "并未查询到相关政策，无法作答".to_string();
        }
        return passages.join("\n");
    }
    summarize_text(prompt, 40)
}

fn extract_context_block(text: &str, start_marker: &str, stop_marker: &str) -> String {
    if let Some(start_idx) = text.find(start_marker) {
        let after = &text[start_idx + start_marker.len()..];
        if let Some(end_idx) = after.find(stop_marker) {
            return after[..end_idx].trim().to_string();
        }
        return after.trim().to_string();
    }
    text.trim().to_string()
}

fn summarize_text(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<&str>>()
        .join(" ")
}
