//! Scripted command runner for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::process::{CommandOutput, CommandRunner, CommandSpec, RunError};

/// Response closure for a scripted program.
pub type ScriptFn = Arc<dyn Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync>;

#[derive(Clone)]
enum Behaviour {
    Respond(ScriptFn),
    Delay(Duration, ScriptFn),
    Hang,
}

/// A [`CommandRunner`] that answers from per-program scripts.
///
/// Every spec is recorded before it is answered. Programs without a script
/// behave like a missing binary. `spec.timeout` is honoured, so a hanging
/// script ends in [`RunError::Timeout`] once the deadline passes.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Behaviour>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl std::fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("programs", &self.scripts.lock().keys().cloned().collect::<Vec<_>>())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

impl ScriptedRunner {
    /// Creates a runner with no scripts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers calls to `program` with `script`.
    #[must_use]
    pub fn on<F>(self, program: impl Into<String>, script: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
    {
        self.scripts
            .lock()
            .insert(program.into(), Behaviour::Respond(Arc::new(script)));
        self
    }

    /// Like [`on`](Self::on), but waits `delay` before answering.
    #[must_use]
    pub fn on_delayed<F>(self, program: impl Into<String>, delay: Duration, script: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
    {
        self.scripts
            .lock()
            .insert(program.into(), Behaviour::Delay(delay, Arc::new(script)));
        self
    }

    /// Always exits 0 with `stdout`.
    #[must_use]
    pub fn succeed(self, program: impl Into<String>, stdout: impl Into<String>) -> Self {
        let stdout = stdout.into();
        self.on(program, move |_| Ok(CommandOutput::success(stdout.clone())))
    }

    /// Always exits with `code` and `stderr`.
    #[must_use]
    pub fn fail(self, program: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        self.on(program, move |_| Ok(CommandOutput::failure(code, stderr.clone())))
    }

    /// Never finishes on its own.
    #[must_use]
    pub fn hang(self, program: impl Into<String>) -> Self {
        self.scripts.lock().insert(program.into(), Behaviour::Hang);
        self
    }

    /// Every spec received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Specs received for `program`, in order.
    #[must_use]
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .iter()
            .filter(|spec| spec.program == program)
            .cloned()
            .collect()
    }

    /// Number of specs received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        self.calls.lock().push(spec.clone());
        let behaviour = self.scripts.lock().get(&spec.program).cloned();
        let Some(behaviour) = behaviour else {
            return Err(RunError::NotFound {
                program: spec.program.clone(),
            });
        };

        let work = async {
            match behaviour {
                Behaviour::Respond(script) => script(spec),
                Behaviour::Delay(delay, script) => {
                    tokio::time::sleep(delay).await;
                    script(spec)
                }
                Behaviour::Hang => std::future::pending().await,
            }
        };

        match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| RunError::Timeout {
                    program: spec.program.clone(),
                    timeout: limit,
                })?,
            None => work.await,
        }
    }
}
