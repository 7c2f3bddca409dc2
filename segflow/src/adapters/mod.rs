//! Stage adapters wrapping the external tools.
//!
//! Each adapter validates its inputs before invoking its tool, runs the tool
//! through a [`CommandRunner`](crate::process::CommandRunner), and verifies
//! the expected outputs on disk before reporting success.

mod conversion;
mod metadata;
mod segmentation;
mod structured;
pub mod volume;

pub use conversion::{parse_reported_outputs, ConversionAdapter, VOLUMES_CATEGORY};
pub use metadata::{deep_merge, metadata_side_file_path, MetadataSideFile, SegmentationMetadata};
pub use segmentation::{
    SegmentationAdapter, StageSelector, LANDMARK_CATEGORY, LEVELS_CATEGORY, OUTPUT_CATEGORIES,
    PREVIEW_CATEGORY, SEGMENTATION_CATEGORY,
};
pub use structured::{StructuredOutputAdapter, SEGMENTATION_OBJECT_CATEGORY};

use crate::core::StageName;
use crate::errors::StageError;
use crate::events::EventSink;
use crate::process::{CommandRunner, CommandSpec, RunError};

/// Runs a trivial health-check invocation of a tool.
///
/// Any failure to start, a timeout, or an exit code outside `accepted`
/// means the tool is unavailable.
pub(crate) async fn verify_tool(
    runner: &dyn CommandRunner,
    sink: &dyn EventSink,
    stage: StageName,
    spec: &CommandSpec,
    accepted: &[i32],
) -> Result<(), StageError> {
    let output = runner.run(spec).await.map_err(|err| {
        let reason = match &err {
            RunError::Timeout { timeout, .. } => {
                format!("health check timed out after {}s", timeout.as_secs_f64())
            }
            other => other.to_string(),
        };
        StageError::tool_unavailable(stage, &spec.program, reason)
    })?;

    if !output.exited_with_any(accepted) {
        return Err(StageError::tool_unavailable(
            stage,
            &spec.program,
            format!("health check `{}` failed: {}", spec.display(), output.diagnostic()),
        ));
    }

    let banner = output.stdout.lines().next().unwrap_or_default().trim().to_string();
    sink.try_emit(
        "tool.verified",
        Some(serde_json::json!({
            "stage": stage.label(),
            "tool": spec.program,
            "banner": banner,
        })),
    );
    Ok(())
}

/// Maps a runner failure of a stage's main invocation to a stage error.
///
/// `on_timeout` builds the stage-specific timeout error.
pub(crate) fn map_run_error(
    stage: StageName,
    err: RunError,
    on_timeout: impl FnOnce(String, std::time::Duration) -> StageError,
) -> StageError {
    match err {
        RunError::Timeout { program, timeout } => on_timeout(program, timeout),
        RunError::Wait { program, source } => {
            StageError::io(stage, format!("failed to collect output of {program}"), source)
        }
        RunError::NotFound { ref program } | RunError::Spawn { ref program, .. } => {
            StageError::tool_unavailable(stage, program.clone(), err.to_string())
        }
    }
}

/// Emits the `tool.invoked` event for a command about to run.
pub(crate) fn emit_invoked(sink: &dyn EventSink, stage: StageName, spec: &CommandSpec) {
    sink.try_emit(
        "tool.invoked",
        Some(serde_json::json!({
            "stage": stage.label(),
            "command": spec.display(),
            "timeout_seconds": spec.timeout.map(|t| t.as_secs_f64()),
        })),
    );
}

/// Emits `stage.failed` for an error and passes it through.
pub(crate) fn emit_failed(sink: &dyn EventSink, err: StageError) -> StageError {
    sink.try_emit("stage.failed", Some(serde_json::json!(err.to_dict())));
    err
}

/// Emits one `*.warning` event per message.
pub(crate) fn emit_warnings(sink: &dyn EventSink, event_type: &str, stage: StageName, warnings: &[String]) {
    for warning in warnings {
        sink.try_emit(
            event_type,
            Some(serde_json::json!({
                "stage": stage.label(),
                "message": warning,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::process::{CommandOutput, MockCommandRunner};
    use std::time::Duration;

    #[tokio::test]
    async fn test_verify_tool_accepts_listed_codes() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_| Ok(CommandOutput::failure(1, "usage: itkimage2segimage")));
        let sink = CollectingEventSink::new();
        let spec = CommandSpec::new("itkimage2segimage").arg("--help");

        verify_tool(&runner, &sink, StageName::StructuredOutput, &spec, &[0, 1])
            .await
            .unwrap();
        assert_eq!(sink.event_types(), vec!["tool.verified"]);
    }

    #[tokio::test]
    async fn test_verify_tool_rejects_other_codes() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::failure(127, "command not found")));
        let spec = CommandSpec::new("totalspineseg").arg("--help");

        let err = verify_tool(&runner, &CollectingEventSink::new(), StageName::Segmentation, &spec, &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::ToolUnavailable { .. }));
        assert!(err.to_string().contains("command not found"));
    }

    #[tokio::test]
    async fn test_verify_tool_timeout_is_unavailable() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            Err(RunError::Timeout {
                program: spec.program.clone(),
                timeout: Duration::from_secs(30),
            })
        });
        let spec = CommandSpec::new("totalspineseg").arg("--help");

        let err = verify_tool(&runner, &CollectingEventSink::new(), StageName::Segmentation, &spec, &[0])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("health check timed out after 30s"));
    }
}
