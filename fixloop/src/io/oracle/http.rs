//! Chat-completion oracles over HTTPS.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{OracleRequest, PatchOracle};
use crate::io::config::OracleConfig;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";
const ANTHROPIC_KEY_ENV: &str = "ANTHROPIC_API_KEY";

fn api_key(var: &str) -> Result<String> {
    std::env::var(var)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow!("{var} is not set"))
}

fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("build http client")
}

fn endpoint(config: &OracleConfig, default: &str, path: &str) -> String {
    let base = config.endpoint.as_deref().unwrap_or(default);
    format!("{}/{path}", base.trim_end_matches('/'))
}

/// POST `body` and return the response text, failing on non-2xx.
fn post_json<B: Serialize>(
    request: reqwest::blocking::RequestBuilder,
    body: &B,
    provider: &str,
) -> Result<String> {
    let response = request
        .json(body)
        .send()
        .with_context(|| format!("send {provider} request"))?;
    let status = response.status();
    let text = response
        .text()
        .with_context(|| format!("read {provider} response"))?;
    if !status.is_success() {
        warn!(status = status.as_u16(), provider, "oracle request rejected");
        return Err(anyhow!(
            "{provider} returned {}: {}",
            status.as_u16(),
            truncate(&text, 500)
        ));
    }
    Ok(text)
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAiBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Text of the first choice in a chat-completions response.
pub fn parse_openai_response(body: &str) -> Result<String> {
    let parsed: OpenAiResponse =
        serde_json::from_str(body).context("parse openai response")?;
    parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content.unwrap_or_default())
        .ok_or_else(|| anyhow!("openai response has no choices"))
}

/// OpenAI chat completions, temperature 0.
pub struct OpenAiOracle {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiOracle {
    /// Reads the key from `OPENAI_API_KEY`.
    pub fn from_env(config: &OracleConfig) -> Result<Self> {
        Ok(Self {
            client: client(config.timeout())?,
            url: endpoint(config, OPENAI_URL, "chat/completions"),
            api_key: api_key(OPENAI_KEY_ENV)?,
            model: config.model().to_string(),
            max_tokens: config.max_tokens,
        })
    }
}

impl PatchOracle for OpenAiOracle {
    #[instrument(skip_all, fields(model = %self.model))]
    fn generate(&self, request: &OracleRequest) -> Result<String> {
        info!("requesting patch from openai");
        let body = OpenAiBody {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };
        let builder = self.client.post(&self.url).bearer_auth(&self.api_key);
        let text = post_json(builder, &body, "openai")?;
        parse_openai_response(&text)
    }
}

#[derive(Serialize)]
struct AnthropicBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Concatenated text blocks of a messages-API response.
pub fn parse_anthropic_response(body: &str) -> Result<String> {
    let parsed: AnthropicResponse =
        serde_json::from_str(body).context("parse anthropic response")?;
    if parsed.content.is_empty() {
        return Err(anyhow!("anthropic response has no content"));
    }
    Ok(parsed
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect())
}

/// Anthropic messages API.
pub struct AnthropicOracle {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicOracle {
    /// Reads the key from `ANTHROPIC_API_KEY`.
    pub fn from_env(config: &OracleConfig) -> Result<Self> {
        Ok(Self {
            client: client(config.timeout())?,
            url: endpoint(config, ANTHROPIC_URL, "messages"),
            api_key: api_key(ANTHROPIC_KEY_ENV)?,
            model: config.model().to_string(),
            max_tokens: config.max_tokens,
        })
    }
}

impl PatchOracle for AnthropicOracle {
    #[instrument(skip_all, fields(model = %self.model))]
    fn generate(&self, request: &OracleRequest) -> Result<String> {
        info!("requesting patch from anthropic");
        let body = AnthropicBody {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: 0.0,
            system: &request.system,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };
        let builder = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        let text = post_json(builder, &body, "anthropic")?;
        parse_anthropic_response(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_takes_first_choice() {
        let body = r#"{"id":"x","choices":[
            {"index":0,"message":{"role":"assistant","content":"diff --git a/A b/A\n"}},
            {"index":1,"message":{"role":"assistant","content":"other"}}
        ]}"#;
        assert_eq!(parse_openai_response(body).expect("parse"), "diff --git a/A b/A\n");
    }

    #[test]
    fn openai_without_choices_is_an_error() {
        assert!(parse_openai_response(r#"{"choices":[]}"#).is_err());
        assert!(parse_openai_response("not json").is_err());
    }

    #[test]
    fn anthropic_joins_text_blocks() {
        let body = r#"{"content":[
            {"type":"text","text":"diff --git "},
            {"type":"tool_use","id":"t"},
            {"type":"text","text":"a/A b/A\n"}
        ]}"#;
        assert_eq!(parse_anthropic_response(body).expect("parse"), "diff --git a/A b/A\n");
    }

    #[test]
    fn anthropic_without_content_is_an_error() {
        assert!(parse_anthropic_response(r#"{"content":[]}"#).is_err());
    }

    #[test]
    fn endpoint_override_replaces_base_url() {
        let mut config = OracleConfig::default();
        assert_eq!(
            endpoint(&config, OPENAI_URL, "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        config.endpoint = Some("http://localhost:8080/v1/".to_string());
        assert_eq!(
            endpoint(&config, OPENAI_URL, "chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
