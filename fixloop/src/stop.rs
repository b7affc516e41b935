//! Cooperative cancellation for the fix loop.
//!
//! The loop polls a [`StopSignal`] between states. A patch application that is
//! already running finishes (it is all-or-nothing), so an interrupt never
//! leaves a half-applied patch behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::exit_codes;

/// Shared flag raised when the loop should stop at the next state boundary.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raise `signal` on SIGINT/SIGTERM (Ctrl-C on Windows).
///
/// Signals are awaited on a dedicated thread with a single-threaded tokio
/// runtime. A second signal exits the process immediately with the
/// interrupted exit code.
pub fn install_interrupt_handler(signal: StopSignal) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;

    thread::Builder::new()
        .name("fixloop-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if let Err(err) = wait_for_interrupt().await {
                    warn!(err = %err, "signal handler unavailable");
                    return;
                }
                info!("interrupt received, stopping after the current step");
                eprintln!("fixloop: interrupt received, stopping after the current step");
                signal.raise();

                if wait_for_interrupt().await.is_ok() {
                    eprintln!("fixloop: second interrupt, exiting");
                    std::process::exit(exit_codes::INTERRUPTED);
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

async fn wait_for_interrupt() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
