use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use super::{OracleRequest, PatchOracle};
use crate::io::config::OracleConfig;
use crate::io::process::run_captured;

/// Environment variables exposed to the oracle command.
const MODEL_VAR: &str = "FIXLOOP_ORACLE_MODEL";
const SYSTEM_VAR: &str = "FIXLOOP_ORACLE_SYSTEM";

/// Oracle backed by an external command: prompt on stdin, patch on stdout.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    command: Vec<String>,
    model: String,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        if config.command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("oracle.command is empty"));
        }
        Ok(Self {
            command: config.command.clone(),
            model: config.model().to_string(),
            timeout: config.timeout(),
            output_limit_bytes: config.output_limit_bytes,
        })
    }
}

impl PatchOracle for CommandOracle {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn generate(&self, request: &OracleRequest) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle.command is empty"))?;
        info!(program = %program, "invoking oracle command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env(MODEL_VAR, &self.model)
            .env(SYSTEM_VAR, &request.system);
        let output = run_captured(
            cmd,
            Some(request.prompt.as_bytes()),
            Some(self.timeout),
            self.output_limit_bytes,
        )
        .with_context(|| format!("run oracle command {program}"))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "oracle command timed out");
            return Err(anyhow!("oracle command timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "oracle command failed");
            return Err(anyhow!(
                "oracle command failed with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output.stdout_lossy())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::config::Provider;

    fn oracle(script: &str, timeout_secs: u64) -> CommandOracle {
        CommandOracle::new(&OracleConfig {
            provider: Provider::Command,
            model: Some("local".to_string()),
            timeout_secs,
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            ..OracleConfig::default()
        })
        .expect("oracle")
    }

    fn request(prompt: &str) -> OracleRequest {
        OracleRequest {
            system: "diff only".to_string(),
            prompt: prompt.to_string(),
        }
    }

    #[test]
    fn prompt_goes_to_stdin_and_stdout_comes_back() {
        let reply = oracle("cat; printf '|%s|%s' \"$FIXLOOP_ORACLE_MODEL\" \"$FIXLOOP_ORACLE_SYSTEM\"", 5)
            .generate(&request("fix it"))
            .expect("generate");
        assert_eq!(reply, "fix it|local|diff only");
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let err = oracle("echo quota >&2; exit 3", 5)
            .generate(&request("x"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("quota"));
    }

    #[test]
    fn timeout_is_an_error() {
        let err = oracle("exec sleep 5", 1).generate(&request("x")).unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
    }

    #[test]
    fn timeout_bounds_a_large_prompt_the_command_never_reads() {
        let started = std::time::Instant::now();
        let err = oracle("exec sleep 8", 1)
            .generate(&request(&"x".repeat(200_000)))
            .unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
