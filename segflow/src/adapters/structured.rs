//! Segmentation volume to DICOM SEG stage (`itkimage2segimage`).

use super::metadata::{metadata_side_file_path, MetadataSideFile, SegmentationMetadata};
use super::{emit_failed, emit_invoked, map_run_error, verify_tool};
use crate::config::StructuredOutputConfig;
use crate::core::{StageName, StageResult};
use crate::errors::{StageError, ValidationOutcome};
use crate::events::SharedEventSink;
use crate::process::{CommandRunner, CommandSpec};
use crate::utils::now_utc;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const STAGE: StageName = StageName::StructuredOutput;

/// Result category holding the DICOM SEG object.
pub const SEGMENTATION_OBJECT_CATEGORY: &str = "segmentation_object";

/// Wraps the DICOM SEG generator.
pub struct StructuredOutputAdapter {
    config: StructuredOutputConfig,
    runner: Arc<dyn CommandRunner>,
    sink: SharedEventSink,
}

impl std::fmt::Debug for StructuredOutputAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredOutputAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StructuredOutputAdapter {
    /// Creates a new adapter. No process is started.
    #[must_use]
    pub fn new(config: StructuredOutputConfig, runner: Arc<dyn CommandRunner>, sink: SharedEventSink) -> Self {
        Self { config, runner, sink }
    }

    /// Returns the adapter configuration.
    #[must_use]
    pub fn config(&self) -> &StructuredOutputConfig {
        &self.config
    }

    /// Verifies that the generator can be executed.
    pub async fn initialize(&self) -> Result<(), StageError> {
        let probe = CommandSpec::new(&self.config.binary)
            .arg("--help")
            .with_timeout(self.config.probe_timeout());
        verify_tool(
            self.runner.as_ref(),
            self.sink.as_ref(),
            STAGE,
            &probe,
            &self.config.accepted_probe_codes,
        )
        .await
    }

    /// Default metadata, then configured overrides, then `overrides`.
    #[must_use]
    pub fn build_metadata(&self, overrides: Option<&Value>) -> SegmentationMetadata {
        let mut metadata = SegmentationMetadata::default();
        if let Some(configured) = &self.config.metadata_overrides {
            metadata.merge(configured);
        }
        if let Some(overrides) = overrides {
            metadata.merge(overrides);
        }
        metadata
    }

    /// Checks the segmentation file and the reference series.
    #[must_use]
    pub fn check_inputs(segmentation_file: &Path, reference_dir: &Path) -> ValidationOutcome {
        if !segmentation_file.is_file() {
            return ValidationOutcome::fail(format!(
                "Segmentation file not found: {}",
                segmentation_file.display()
            ));
        }
        if !reference_dir.is_dir() {
            return ValidationOutcome::fail(format!(
                "Reference DICOM directory not found: {}",
                reference_dir.display()
            ));
        }
        ValidationOutcome::pass("Inputs found")
    }

    /// Builds the generator invocation.
    #[must_use]
    pub fn build_command(
        &self,
        segmentation_file: &Path,
        reference_dir: &Path,
        output_file: &Path,
        metadata_file: &Path,
    ) -> CommandSpec {
        CommandSpec::new(&self.config.binary)
            .arg("--inputImageList")
            .arg(segmentation_file.display().to_string())
            .arg("--inputDICOMDirectory")
            .arg(reference_dir.display().to_string())
            .arg("--outputDICOM")
            .arg(output_file.display().to_string())
            .arg("--inputMetadata")
            .arg(metadata_file.display().to_string())
            .arg("--skip")
            .with_timeout(self.config.timeout())
    }

    /// Encodes a segmentation volume as a DICOM SEG object.
    ///
    /// The metadata side-file exists only for the duration of the call.
    pub async fn convert(
        &self,
        segmentation_file: &Path,
        reference_dir: &Path,
        output_file: &Path,
        metadata: Option<&Value>,
    ) -> Result<StageResult, StageError> {
        let started_at = now_utc();
        let timer = Instant::now();
        self.sink.try_emit(
            "stage.started",
            Some(serde_json::json!({
                "stage": STAGE.label(),
                "input": segmentation_file,
                "reference": reference_dir,
                "output": output_file,
            })),
        );

        match self.run_generator(segmentation_file, reference_dir, output_file, metadata).await {
            Ok((spec, stdout)) => {
                let output_dir = output_file.parent().unwrap_or_else(|| Path::new("."));
                let result = StageResult::completed(STAGE, started_at, timer.elapsed())
                    .with_output_dir(output_dir)
                    .with_category(SEGMENTATION_OBJECT_CATEGORY, vec![output_file.to_path_buf()])
                    .with_tool_output(spec.display(), stdout);
                self.sink.try_emit(
                    "stage.completed",
                    Some(serde_json::json!({
                        "stage": STAGE.label(),
                        "output": output_file,
                        "elapsed_seconds": result.elapsed_seconds,
                    })),
                );
                Ok(result)
            }
            Err(err) => Err(emit_failed(self.sink.as_ref(), err)),
        }
    }

    async fn run_generator(
        &self,
        segmentation_file: &Path,
        reference_dir: &Path,
        output_file: &Path,
        metadata: Option<&Value>,
    ) -> Result<(CommandSpec, String), StageError> {
        Self::check_inputs(segmentation_file, reference_dir).into_result(STAGE)?;

        if let Some(parent) = output_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StageError::io_at(STAGE, "create output directory", parent, e))?;
        }

        let side_file = MetadataSideFile::create(
            metadata_side_file_path(output_file),
            &self.build_metadata(metadata),
            self.sink.clone(),
        )
        .map_err(|e| StageError::io(STAGE, "failed to write metadata file", e))?;

        let spec = self.build_command(segmentation_file, reference_dir, output_file, side_file.path());
        emit_invoked(self.sink.as_ref(), STAGE, &spec);

        let output = self.runner.run(&spec).await.map_err(|err| {
            map_run_error(STAGE, err, |tool, timeout| StageError::ToolTimeout {
                stage: STAGE,
                tool,
                timeout,
            })
        })?;
        if !output.is_success() {
            return Err(StageError::ConversionFailed {
                stage: STAGE,
                diagnostic: output.diagnostic(),
            });
        }

        let size = std::fs::metadata(output_file).map_or(0, |m| m.len());
        if size == 0 {
            return Err(StageError::critical_output_missing(
                STAGE,
                format!("DICOM SEG file missing or empty: {}", output_file.display()),
            ));
        }

        drop(side_file);
        Ok((spec, output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::process::{CommandOutput, MockCommandRunner, RunError};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        seg: PathBuf,
        dicom: PathBuf,
        output: PathBuf,
        sink: Arc<CollectingEventSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let seg = dir.path().join("study.nii.gz");
            std::fs::write(&seg, b"labels").unwrap();
            let dicom = dir.path().join("dicom");
            std::fs::create_dir(&dicom).unwrap();
            Self {
                output: dir.path().join("out/study_seg.dcm"),
                seg,
                dicom,
                _dir: dir,
                sink: Arc::new(CollectingEventSink::new()),
            }
        }

        fn side_file(&self) -> PathBuf {
            metadata_side_file_path(&self.output)
        }

        fn adapter(&self, runner: MockCommandRunner) -> StructuredOutputAdapter {
            StructuredOutputAdapter::new(StructuredOutputConfig::default(), Arc::new(runner), self.sink.clone())
        }
    }

    #[test]
    fn test_build_metadata_layers_overrides() {
        let config = StructuredOutputConfig::default().with_metadata_overrides(json!({
            "SeriesDescription": "Configured",
            "SeriesNumber": "3001",
        }));
        let adapter = StructuredOutputAdapter::new(config, Arc::new(MockCommandRunner::new()), crate::events::noop_sink());

        let metadata = adapter.build_metadata(Some(&json!({"SeriesNumber": "4001"})));

        assert_eq!(metadata.get("SeriesDescription"), Some(&json!("Configured")));
        assert_eq!(metadata.get("SeriesNumber"), Some(&json!("4001")));
        assert_eq!(metadata.get("BodyPart"), Some(&json!("SPINE")));
    }

    #[tokio::test]
    async fn test_probe_accepts_help_exit_one() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.has_arg("--help"))
            .returning(|_| Ok(CommandOutput::failure(1, "USAGE: itkimage2segimage")));

        fx.adapter(runner).initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_reference_dir_spawns_nothing() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(0);

        let err = fx
            .adapter(runner)
            .convert(&fx.seg, &fx.dicom.join("missing"), &fx.output, None)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::InputInvalid { stage: StageName::StructuredOutput, .. }));
        assert!(!fx.side_file().exists());
    }

    #[tokio::test]
    async fn test_success_removes_side_file() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|spec| {
            let meta = PathBuf::from(spec.flag_value("--inputMetadata").unwrap_or_default());
            let written: Value = serde_json::from_slice(&std::fs::read(&meta).unwrap()).unwrap();
            assert_eq!(written["SeriesDescription"], json!("AI Spine Segmentation"));
            std::fs::write(spec.flag_value("--outputDICOM").unwrap_or_default(), b"DICM").unwrap();
            Ok(CommandOutput::success(""))
        });

        let result = fx.adapter(runner).convert(&fx.seg, &fx.dicom, &fx.output, None).await.unwrap();

        assert_eq!(result.category(SEGMENTATION_OBJECT_CATEGORY), [fx.output.clone()]);
        assert!(result.invocation.contains("--skip"));
        assert!(!fx.side_file().exists());
    }

    #[tokio::test]
    async fn test_tool_failure_removes_side_file() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::failure(1, "ERROR: Failed to read DICOM series")));

        let err = fx.adapter(runner).convert(&fx.seg, &fx.dicom, &fx.output, None).await.unwrap_err();

        assert!(matches!(err, StageError::ConversionFailed { stage: StageName::StructuredOutput, .. }));
        assert!(err.to_string().contains("Failed to read DICOM series"));
        assert!(!fx.side_file().exists());
    }

    #[tokio::test]
    async fn test_runner_error_removes_side_file() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            Err(RunError::Timeout {
                program: spec.program.clone(),
                timeout: Duration::from_secs(600),
            })
        });

        let err = fx.adapter(runner).convert(&fx.seg, &fx.dicom, &fx.output, None).await.unwrap_err();

        assert!(matches!(err, StageError::ToolTimeout { stage: StageName::StructuredOutput, .. }));
        assert!(!fx.side_file().exists());
    }

    #[tokio::test]
    async fn test_empty_output_is_critical() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            std::fs::write(spec.flag_value("--outputDICOM").unwrap_or_default(), b"").unwrap();
            Ok(CommandOutput::success(""))
        });

        let err = fx.adapter(runner).convert(&fx.seg, &fx.dicom, &fx.output, None).await.unwrap_err();

        assert!(matches!(err, StageError::CriticalOutputMissing { .. }));
        assert!(!fx.side_file().exists());
    }
}
