//! `fixloop`: iterative automated build repair.
//!
//! Builds the project, turns the result artifact into issues, asks a patch
//! oracle for a fix restricted to an edit allow-list, and applies approved
//! patches until the build and tests pass.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fixloop::controller::{LoopContext, LoopEvent, LoopOutcome, LoopStop, run_loop};
use fixloop::core::patch::{Verdict, validate};
use fixloop::exit_codes;
use fixloop::io::build::{BuildTool, XcodeBuild};
use fixloop::io::config::{CONFIG_FILE, FixConfig, load_config};
use fixloop::io::diagnostics::{XcresultReader, extract};
use fixloop::io::init::{InitOptions, init_project};
use fixloop::io::oracle::build_oracle;
use fixloop::logging;
use fixloop::stop::{StopSignal, install_interrupt_handler};

/// Characters of the last patch echoed when the loop stops.
const PATCH_PREVIEW_CHARS: usize = 200;

#[derive(Parser)]
#[command(
    name = "fixloop",
    version,
    about = "Iterative automated build repair with a sandboxed patch oracle"
)]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,
    /// Config file (defaults to `<root>/fixloop.toml`).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `fixloop.toml` and the log directory.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the build/fix loop.
    Run {
        /// Override `loop.max_iterations`.
        #[arg(long, value_name = "N")]
        max_iterations: Option<u32>,
        /// Do not commit applied patches.
        #[arg(long)]
        no_checkpoint: bool,
    },
    /// Validate a patch file against the edit policy without applying it.
    CheckPatch {
        /// Unified diff to check.
        file: PathBuf,
    },
    /// Build once and print the extracted issues.
    Diagnose,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| root.join(CONFIG_FILE));

    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run {
            max_iterations,
            no_checkpoint,
        } => {
            let mut config = load_config(&config_path)?;
            if let Some(limit) = max_iterations {
                config.run.max_iterations = limit;
            }
            if no_checkpoint {
                config.run.checkpoint = false;
            }
            config.validate()?;
            cmd_run(&root, &config)
        }
        Command::CheckPatch { file } => cmd_check_patch(&load_config(&config_path)?, &file),
        Command::Diagnose => cmd_diagnose(&root, &load_config(&config_path)?),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("wrote {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, config: &FixConfig) -> Result<i32> {
    let policy = config.policy.edit_policy()?;
    let oracle = build_oracle(&config.oracle)?;
    let build_tool = XcodeBuild::new(root, config.build.clone());
    let reader = XcresultReader::new(&config.diagnostics);
    let stop = StopSignal::new();
    install_interrupt_handler(stop.clone())?;

    let ctx = LoopContext {
        root,
        config,
        policy: &policy,
        stop: &stop,
    };
    let outcome = run_loop(&ctx, &build_tool, &reader, &oracle, print_event)?;
    report(&outcome);
    Ok(exit_code(&outcome.stop))
}

fn print_event(event: &LoopEvent) {
    match event {
        LoopEvent::IterationStarted { iteration } => println!("== iteration {iteration} =="),
        LoopEvent::BuildFinished { exit_success, .. } => {
            println!("build {}", if *exit_success { "succeeded" } else { "failed" });
        }
        LoopEvent::IssuesFound {
            count, from_tests, ..
        } => {
            let source = if *from_tests { "test" } else { "build" };
            println!("{count} {source} issue(s)");
        }
        LoopEvent::OracleRetry { error, .. } => println!("oracle request failed, retrying: {error}"),
        LoopEvent::PatchApplied { paths, commit, .. } => {
            let files: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            match commit {
                Some(sha) => println!("applied patch to {} ({})", files.join(", "), short(sha)),
                None => println!("applied patch to {}", files.join(", ")),
            }
        }
        LoopEvent::TestsFinished { passed, .. } => {
            println!("tests {}", if *passed { "passed" } else { "failed" });
        }
    }
}

fn report(outcome: &LoopOutcome) {
    match &outcome.stop {
        LoopStop::Success => println!(
            "done after {} iteration(s): {}",
            outcome.iterations, outcome.stop
        ),
        stop => {
            println!("stopped after {} iteration(s): {stop}", outcome.iterations);
            if let Some(patch) = &outcome.last_patch {
                println!("First {PATCH_PREVIEW_CHARS} chars of patch for debug:");
                println!("{}", preview(patch));
            }
        }
    }
}

fn exit_code(stop: &LoopStop) -> i32 {
    match stop {
        LoopStop::Success => exit_codes::OK,
        LoopStop::PatchRejected { .. } => exit_codes::PATCH_REJECTED,
        LoopStop::ApplyFailed { .. } => exit_codes::APPLY_FAILED,
        LoopStop::OracleFailed { .. }
        | LoopStop::MaxIterations { .. }
        | LoopStop::NoProgress { .. } => exit_codes::EXHAUSTED,
        LoopStop::Interrupted => exit_codes::INTERRUPTED,
    }
}

fn cmd_check_patch(config: &FixConfig, file: &Path) -> Result<i32> {
    let policy = config.policy.edit_policy()?;
    let text = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    match validate(&text, &policy) {
        Verdict::Approved(patch) => {
            for path in patch.touched_paths() {
                println!("ok {}", path.display());
            }
            Ok(exit_codes::OK)
        }
        Verdict::Rejected(rejection) => {
            println!("rejected: {rejection}");
            Ok(exit_codes::PATCH_REJECTED)
        }
    }
}

fn cmd_diagnose(root: &Path, config: &FixConfig) -> Result<i32> {
    let build_tool = XcodeBuild::new(root, config.build.clone());
    let reader = XcresultReader::new(&config.diagnostics);
    let outcome = build_tool.build()?;
    let issues = extract(&reader, &outcome.artifact, root);
    println!(
        "build {}, {} issue(s)",
        if outcome.exit_success { "succeeded" } else { "failed" },
        issues.len()
    );
    for issue in &issues {
        match issue.line {
            Some(line) => println!(
                "{}:{line}: {}: {}",
                issue.file_path.display(),
                issue.severity,
                issue.message
            ),
            None => println!(
                "{}: {}: {}",
                issue.file_path.display(),
                issue.severity,
                issue.message
            ),
        }
    }
    Ok(exit_codes::OK)
}

fn preview(patch: &str) -> String {
    patch.chars().take(PATCH_PREVIEW_CHARS).collect()
}

fn short(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["fixloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_overrides_and_global_root() {
        let cli = Cli::parse_from([
            "fixloop",
            "run",
            "--max-iterations",
            "3",
            "--no-checkpoint",
            "--root",
            "/tmp/app",
        ]);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/app")));
        assert!(matches!(
            cli.command,
            Command::Run {
                max_iterations: Some(3),
                no_checkpoint: true
            }
        ));
    }

    #[test]
    fn stop_reasons_map_to_exit_codes() {
        assert_eq!(exit_code(&LoopStop::Success), exit_codes::OK);
        assert_eq!(
            exit_code(&LoopStop::PatchRejected {
                reason: "no diff found".to_string()
            }),
            exit_codes::PATCH_REJECTED
        );
        assert_eq!(exit_code(&LoopStop::NoProgress { repeats: 3 }), exit_codes::EXHAUSTED);
        assert_eq!(exit_code(&LoopStop::Interrupted), exit_codes::INTERRUPTED);
    }

    #[test]
    fn preview_counts_characters_not_bytes() {
        let patch = "é".repeat(300);
        assert_eq!(preview(&patch).chars().count(), PATCH_PREVIEW_CHARS);
    }
}
