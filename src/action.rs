//! Fire-and-forget launching of rule actions.
//!
//! The scheduler only decides *when* to launch. [`Dispatcher`] is the seam
//! between that decision and the outside world: [`ProcessDispatcher`] runs
//! the configured executable as a child process; tests substitute a
//! recording implementation.
//!
//! Dispatch never blocks the calling tick. The returned handle completes
//! when the process exits; failures are logged by the dispatcher itself and
//! reported through the handle, never propagated as scheduler errors.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Why an action did not complete successfully.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The process could not be started.
    #[error("failed to launch {path}: {source}")]
    Launch {
        /// Executable that failed to start.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The process ran but exited unsuccessfully.
    #[error("{path} exited with {}", describe_exit(.code))]
    Exited {
        /// Executable that failed.
        path: String,
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

/// Handle to a launched action.
pub type ActionHandle = JoinHandle<Result<(), ActionError>>;

/// Launches external actions.
pub trait Dispatcher: Send + Sync + std::fmt::Debug {
    /// Launch `path` with `args` in the background and return immediately.
    fn dispatch(&self, path: &str, args: &[String]) -> ActionHandle;
}

/// Runs actions as child processes and logs their output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessDispatcher;

impl Dispatcher for ProcessDispatcher {
    fn dispatch(&self, path: &str, args: &[String]) -> ActionHandle {
        let mut command = Command::new(path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let path = path.to_string();
        log::info!("[Action] Executing {} {:?}", path, args);

        tokio::spawn(async move {
            let output = match command.output().await {
                Ok(output) => output,
                Err(source) => {
                    let err = ActionError::Launch { path, source };
                    log::error!("[Action] {err}");
                    return Err(err);
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stdout.trim().is_empty() {
                log::info!("[Action] {} output: {}", path, stdout.trim_end());
            }
            if !stderr.trim().is_empty() {
                log::warn!("[Action] {} errors: {}", path, stderr.trim_end());
            }

            if output.status.success() {
                log::debug!("[Action] {} completed", path);
                Ok(())
            } else {
                let err = ActionError::Exited {
                    path,
                    code: output.status.code(),
                };
                log::error!("[Action] {err}");
                Err(err)
            }
        })
    }
}
