//! Loop configuration stored in `fixloop.toml` at the project root.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::policy::EditPolicy;

pub const CONFIG_FILE: &str = "fixloop.toml";

/// Environment variable overriding `oracle.provider`.
pub const PROVIDER_ENV: &str = "FIXLOOP_PROVIDER";
/// Environment variable overriding `oracle.model`.
pub const MODEL_ENV: &str = "FIXLOOP_MODEL";

/// Loop configuration (TOML).
///
/// Fixed for the lifetime of a run: the loop reads it once at startup and hands
/// references to the components that need a section. Missing fields default to
/// the values of the project this tool was first written for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FixConfig {
    pub build: BuildConfig,
    pub diagnostics: DiagnosticsConfig,
    pub context: ContextConfig,
    pub policy: PolicyConfig,
    pub oracle: OracleConfig,
    #[serde(rename = "loop")]
    pub run: LoopConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildConfig {
    /// Build tool executable.
    pub tool: String,
    pub project: String,
    pub scheme: String,
    pub destination: String,
    /// Result artifact path, relative to the project root. Overwritten each run.
    pub result_bundle: String,
    /// Per-invocation limit in seconds; 0 waits indefinitely.
    pub timeout_secs: u64,
    /// Truncate captured build output beyond this many bytes per stream.
    pub output_limit_bytes: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tool: "xcodebuild".to_string(),
            project: "PrintMyRide.xcodeproj".to_string(),
            scheme: "PrintMyRide".to_string(),
            destination: "platform=iOS Simulator,name=iPhone 16 Pro".to_string(),
            result_bundle: "build/Build.xcresult".to_string(),
            timeout_secs: 0,
            output_limit_bytes: 2_000_000,
        }
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Command that prints the result artifact as JSON; the artifact path is
    /// appended as the last argument.
    pub query_command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            query_command: ["xcrun", "xcresulttool", "get", "--format", "json", "--path"]
                .map(String::from)
                .to_vec(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Lines of context above and below each issue.
    pub window_lines: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { window_lines: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    pub allowed_directories: Vec<String>,
    pub blocked_files: Vec<String>,
    /// Project rules restated to the oracle with every request.
    pub invariants: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_directories: [
                "PrintMyRide/Features/Editor",
                "PrintMyRide/Features/Render",
                "PrintMyRide/GPX",
                "PrintMyRide/Utilities",
                "PrintMyRideTests",
                "PrintMyRideUITests",
            ]
            .map(String::from)
            .to_vec(),
            blocked_files: [
                "PrintMyRide/Models/PosterDesign.swift",
                "PrintMyRide/Features/Render/GridOverlay.swift",
                "PrintMyRide/PreBuildCheck.sh",
            ]
            .map(String::from)
            .to_vec(),
            invariants: [
                "Do not invent new types (e.g. Size, RGBAColor) when an existing equivalent exists; use CGSize and PosterDesign.ColorData.",
                "Match expected call signatures: PosterPreview(design: PosterDesign, route: GPXRoute?) takes a value design, not a Binding.",
                "Use binding projection ($design.foo) only inside SwiftUI controls; elsewhere read values.",
                "If a parameter like `onExport` is required, make it optional with a default and gate its calls.",
                "If dynamic-member or type-check timeouts occur, split large SwiftUI bodies into smaller views.",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

impl PolicyConfig {
    pub fn edit_policy(&self) -> Result<EditPolicy> {
        EditPolicy::new(&self.allowed_directories, &self.blocked_files)
    }
}

/// Patch oracle backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    /// External command: prompt on stdin, patch on stdout.
    Command,
}

impl Provider {
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4",
            Provider::Anthropic => "claude-3-7-sonnet-latest",
            Provider::Command => "",
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "command" => Ok(Provider::Command),
            other => Err(anyhow!(
                "unknown provider '{other}' (expected openai, anthropic or command)"
            )),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Command => "command",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    pub provider: Provider,
    /// Model name; the provider's default when unset.
    pub model: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    /// Base URL override for the HTTP providers (proxies, local gateways).
    pub endpoint: Option<String>,
    /// Command for `provider = "command"`.
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
    /// Upper bound on the rendered prompt; file contexts are dropped to fit.
    pub prompt_budget_bytes: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            model: None,
            timeout_secs: 60,
            max_tokens: 4000,
            endpoint: None,
            command: Vec::new(),
            output_limit_bytes: 1_000_000,
            prompt_budget_bytes: 200_000,
        }
    }
}

impl OracleConfig {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Hard ceiling on iterations.
    pub max_iterations: u32,
    /// Stop after this many consecutive identical issue sets (0 disables).
    pub no_progress_limit: u32,
    /// Working branch checked out before the first iteration.
    pub branch: String,
    /// Commit each applied patch when the root is a git repository.
    pub checkpoint: bool,
    /// Directory for per-iteration logs, relative to the project root.
    pub log_dir: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            no_progress_limit: 3,
            branch: "llm-fix-loop".to_string(),
            checkpoint: true,
            log_dir: ".fixloop".to_string(),
        }
    }
}

impl FixConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("build.tool", &self.build.tool),
            ("build.project", &self.build.project),
            ("build.scheme", &self.build.scheme),
            ("build.destination", &self.build.destination),
            ("build.result_bundle", &self.build.result_bundle),
            ("loop.branch", &self.run.branch),
            ("loop.log_dir", &self.run.log_dir),
        ] {
            if value.trim().is_empty() {
                bail!("{name} must not be empty");
            }
        }
        if self.build.output_limit_bytes == 0 {
            bail!("build.output_limit_bytes must be > 0");
        }
        if self.diagnostics.query_command.is_empty()
            || self.diagnostics.query_command[0].trim().is_empty()
        {
            bail!("diagnostics.query_command must be a non-empty array");
        }
        if self.diagnostics.timeout_secs == 0 {
            bail!("diagnostics.timeout_secs must be > 0");
        }
        if self.oracle.timeout_secs == 0 {
            bail!("oracle.timeout_secs must be > 0");
        }
        if self.oracle.output_limit_bytes == 0 {
            bail!("oracle.output_limit_bytes must be > 0");
        }
        if self.oracle.prompt_budget_bytes == 0 {
            bail!("oracle.prompt_budget_bytes must be > 0");
        }
        if self.oracle.provider == Provider::Command
            && (self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty())
        {
            bail!("oracle.command must be a non-empty array when provider = \"command\"");
        }
        if self.run.max_iterations == 0 {
            bail!("loop.max_iterations must be > 0");
        }
        self.policy.edit_policy().context("invalid [policy]")?;
        Ok(())
    }

    /// Apply provider/model selection from the environment.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(provider) = lookup(PROVIDER_ENV).filter(|v| !v.trim().is_empty()) {
            self.oracle.provider = provider
                .parse()
                .with_context(|| format!("parse {PROVIDER_ENV}"))?;
            debug!(provider = %self.oracle.provider, "provider from environment");
        }
        if let Some(model) = lookup(MODEL_ENV).filter(|v| !v.trim().is_empty()) {
            debug!(model = %model, "model from environment");
            self.oracle.model = Some(model);
        }
        Ok(())
    }
}

/// Load config from a TOML file, then apply environment overrides.
///
/// If the file is missing, the defaults are used.
pub fn load_config(path: &Path) -> Result<FixConfig> {
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        debug!(path = %path.display(), "config missing, using defaults");
        FixConfig::default()
    };
    cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FixConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
