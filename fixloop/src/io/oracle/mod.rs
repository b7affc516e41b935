//! Patch oracle gateway.
//!
//! The [`PatchOracle`] trait decouples the loop from the service that proposes
//! patches. Backends: the OpenAI and Anthropic HTTP APIs, or any external
//! command that reads a prompt on stdin and prints a diff. Tests use scripted
//! oracles that return canned text.
//!
//! Responses are returned unmodified. Deciding whether the text is a usable
//! patch is the validator's job, so an oracle reply of plain prose is not an
//! error at this layer.

mod command;
mod http;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::io::config::{OracleConfig, Provider};
use crate::io::prompt::{PatchRequest, PromptEngine};

pub use crate::io::prompt::OracleRequest;
pub use command::CommandOracle;
pub use http::{AnthropicOracle, OpenAiOracle, parse_anthropic_response, parse_openai_response};

/// Abstraction over patch-generating backends.
pub trait PatchOracle {
    /// Send one request and return the raw response text.
    fn generate(&self, request: &OracleRequest) -> Result<String>;
}

impl<T: PatchOracle + ?Sized> PatchOracle for Box<T> {
    fn generate(&self, request: &OracleRequest) -> Result<String> {
        (**self).generate(request)
    }
}

impl<T: PatchOracle + ?Sized> PatchOracle for &T {
    fn generate(&self, request: &OracleRequest) -> Result<String> {
        (**self).generate(request)
    }
}

/// Render `request` and ask `oracle` for a patch.
///
/// Errors only on rendering or transport failure.
#[instrument(skip_all, fields(issues = request.issues.len(), contexts = request.contexts.len()))]
pub fn request_patch<O: PatchOracle + ?Sized>(
    oracle: &O,
    engine: &PromptEngine,
    request: &PatchRequest<'_>,
) -> Result<String> {
    let rendered = engine.render(request).context("render patch request")?;
    debug!(prompt_bytes = rendered.prompt.len(), "requesting patch");
    let response = oracle.generate(&rendered)?;
    debug!(response_bytes = response.len(), "oracle responded");
    Ok(response)
}

/// Construct the backend selected by `config.provider`.
pub fn build_oracle(config: &OracleConfig) -> Result<Box<dyn PatchOracle>> {
    let oracle: Box<dyn PatchOracle> = match config.provider {
        Provider::OpenAi => Box::new(OpenAiOracle::from_env(config)?),
        Provider::Anthropic => Box::new(AnthropicOracle::from_env(config)?),
        Provider::Command => Box::new(CommandOracle::new(config)?),
    };
    debug!(provider = %config.provider, model = config.model(), "oracle ready");
    Ok(oracle)
}
