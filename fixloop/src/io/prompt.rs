//! Patch request rendering for the oracle.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::policy::EditPolicy;
use crate::core::types::{FileContext, Issue};

const PATCH_REQUEST_TEMPLATE: &str = include_str!("prompts/patch_request.md");

/// System instruction sent alongside every patch request.
pub const SYSTEM_PROMPT: &str = "Return ONLY a unified diff. No explanations.";

/// Structured inputs for one patch request.
#[derive(Debug, Clone, Copy)]
pub struct PatchRequest<'a> {
    pub issues: &'a [Issue],
    pub contexts: &'a [FileContext],
    pub policy: &'a EditPolicy,
    /// Project rules restated verbatim.
    pub invariants: &'a [String],
}

/// Rendered text handed to a [`crate::io::oracle::PatchOracle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    pub system: String,
    pub prompt: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptEngine {
    /// `budget_bytes` bounds the prompt; trailing file contexts are dropped
    /// until it fits. Issues and policy rules are never dropped.
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("patch_request", PATCH_REQUEST_TEMPLATE)
            .context("register patch request template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn render(&self, request: &PatchRequest<'_>) -> Result<OracleRequest> {
        let mut contexts = request.contexts;
        loop {
            let prompt = self.render_with(request, contexts)?;
            if prompt.len() <= self.budget_bytes || contexts.is_empty() {
                return Ok(OracleRequest {
                    system: SYSTEM_PROMPT.to_string(),
                    prompt,
                });
            }
            debug!(
                bytes = prompt.len(),
                budget = self.budget_bytes,
                dropped = %contexts[contexts.len() - 1].file_path.display(),
                "dropping file context for budget"
            );
            contexts = &contexts[..contexts.len() - 1];
        }
    }

    fn render_with(&self, request: &PatchRequest<'_>, contexts: &[FileContext]) -> Result<String> {
        let allowed: Vec<String> = request
            .policy
            .allowed_directories()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let blocked: Vec<String> = request
            .policy
            .blocked_files()
            .map(|p| p.display().to_string())
            .collect();
        let issues_json =
            serde_json::to_string_pretty(request.issues).context("serialize issues")?;
        let contexts_json = serde_json::to_string_pretty(contexts).context("serialize contexts")?;

        let template = self.env.get_template("patch_request")?;
        let rendered = template.render(context! {
            allowed_directories => allowed,
            blocked_files => blocked,
            invariants => request.invariants,
            issues_json => issues_json,
            contexts_json => contexts_json,
        })?;
        Ok(rendered)
    }
}
