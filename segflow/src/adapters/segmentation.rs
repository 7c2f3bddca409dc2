//! AI spine segmentation stage (TotalSpineSeg).
//!
//! The tool writes a fixed directory layout under the output directory:
//!
//! ```text
//! <output>/step1_output   landmark labels
//! <output>/step2_output   full vertebral segmentation
//! <output>/preview        preview images
//! <output>/step1_levels   vertebral level labels
//! ```
//!
//! Success is decided by inspecting that layout, never by the exit code
//! alone. Files already present before the run are not counted.

use super::volume::{dir_has_entries, is_volume_name, list_files, list_volumes, DirSnapshot};
use super::{emit_failed, emit_invoked, emit_warnings, map_run_error, verify_tool};
use crate::config::SegmentationConfig;
use crate::core::{ProcessingReport, StageName, StageResult};
use crate::errors::{ReportError, StageError, ValidationOutcome};
use crate::events::SharedEventSink;
use crate::process::{CommandRunner, CommandSpec};
use crate::utils::now_utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const STAGE: StageName = StageName::Segmentation;

type Categories = Vec<(&'static str, Vec<PathBuf>)>;

/// Landmark detection output.
pub const LANDMARK_CATEGORY: &str = "step1_output";
/// Full segmentation output.
pub const SEGMENTATION_CATEGORY: &str = "step2_output";
/// Preview images.
pub const PREVIEW_CATEGORY: &str = "preview";
/// Vertebral level labels.
pub const LEVELS_CATEGORY: &str = "step1_levels";

/// Every output category, in reporting order.
pub const OUTPUT_CATEGORIES: [&str; 4] = [
    LANDMARK_CATEGORY,
    SEGMENTATION_CATEGORY,
    PREVIEW_CATEGORY,
    LEVELS_CATEGORY,
];

/// Which steps of the segmentation tool to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSelector {
    /// Landmark detection followed by full segmentation.
    #[default]
    Full,
    /// Landmark detection only.
    LandmarksOnly,
}

impl StageSelector {
    /// Maps a `--step-only` value to a selector.
    ///
    /// Step 2 depends on step 1, so "step 2 only" runs the full pipeline.
    #[must_use]
    pub fn from_step(step: u8) -> Option<Self> {
        match step {
            1 => Some(Self::LandmarksOnly),
            2 => Some(Self::Full),
            _ => None,
        }
    }

    /// The category that must contain a volume for the run to succeed.
    #[must_use]
    pub fn primary_category(self) -> &'static str {
        match self {
            Self::Full => SEGMENTATION_CATEGORY,
            Self::LandmarksOnly => LANDMARK_CATEGORY,
        }
    }
}

/// Wraps the TotalSpineSeg command line tool.
pub struct SegmentationAdapter {
    config: SegmentationConfig,
    runner: Arc<dyn CommandRunner>,
    sink: SharedEventSink,
}

impl std::fmt::Debug for SegmentationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SegmentationAdapter {
    /// Creates a new adapter. No process is started.
    #[must_use]
    pub fn new(config: SegmentationConfig, runner: Arc<dyn CommandRunner>, sink: SharedEventSink) -> Self {
        Self { config, runner, sink }
    }

    /// Returns the adapter configuration.
    #[must_use]
    pub fn config(&self) -> &SegmentationConfig {
        &self.config
    }

    fn data_dir_value(&self) -> String {
        self.config.model_data_dir.display().to_string()
    }

    /// Creates the model data directory and verifies the tool runs.
    pub async fn initialize(&self) -> Result<(), StageError> {
        std::fs::create_dir_all(&self.config.model_data_dir).map_err(|e| {
            StageError::io_at(STAGE, "create model data directory", &self.config.model_data_dir, e)
        })?;

        let probe = CommandSpec::new(&self.config.binary)
            .arg("--help")
            .env(&self.config.data_env_var, self.data_dir_value())
            .with_timeout(self.config.probe_timeout());
        verify_tool(self.runner.as_ref(), self.sink.as_ref(), STAGE, &probe, &[0]).await
    }

    /// Downloads the model weights unless they are already present.
    ///
    /// Runs the download command at most once per call; it is never retried.
    pub async fn ensure_models_present(&self) -> Result<(), StageError> {
        let models_dir = self.config.models_dir();
        if dir_has_entries(&models_dir) {
            self.sink.try_emit("models.ready", Some(serde_json::json!({ "path": models_dir })));
            return Ok(());
        }
        self.sink.try_emit("models.missing", Some(serde_json::json!({ "path": models_dir })));

        let Some((program, args)) = self.config.download_command.split_first() else {
            return Err(StageError::ModelAcquisitionFailed {
                message: "no download command configured".to_string(),
            });
        };

        std::fs::create_dir_all(&self.config.model_data_dir).map_err(|e| StageError::ModelAcquisitionFailed {
            message: format!(
                "cannot create model data directory {}: {e}",
                self.config.model_data_dir.display()
            ),
        })?;

        let spec = CommandSpec::new(program)
            .args(args.iter().cloned())
            .env(&self.config.data_env_var, self.data_dir_value())
            .with_timeout(self.config.download_timeout());
        emit_invoked(self.sink.as_ref(), STAGE, &spec);

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|err| StageError::ModelAcquisitionFailed {
                message: err.to_string(),
            })?;
        if !output.is_success() {
            return Err(StageError::ModelAcquisitionFailed {
                message: output.diagnostic(),
            });
        }
        if !dir_has_entries(&models_dir) {
            return Err(StageError::ModelAcquisitionFailed {
                message: format!("{} is still empty after download", models_dir.display()),
            });
        }

        self.sink.try_emit("models.ready", Some(serde_json::json!({ "path": models_dir })));
        Ok(())
    }

    /// Checks that `input_path` is a volumetric file or a directory holding one.
    #[must_use]
    pub fn check_input(&self, input_path: &Path) -> ValidationOutcome {
        if !input_path.exists() {
            return ValidationOutcome::fail(format!("Input path does not exist: {}", input_path.display()));
        }

        if input_path.is_file() {
            if !is_volume_name(input_path) {
                return ValidationOutcome::fail(format!(
                    "Input file must be NIfTI format (.nii or .nii.gz): {}",
                    input_path.display()
                ));
            }
            let outcome = ValidationOutcome::pass(format!("Valid NIfTI file: {}", input_path.display()));
            let size = std::fs::metadata(input_path).map_or(0, |m| m.len());
            if size < self.config.min_input_bytes {
                return outcome.with_warning(format!(
                    "Input file is unusually small ({size} bytes): {}",
                    input_path.display()
                ));
            }
            return outcome;
        }

        if input_path.is_dir() {
            return match list_volumes(input_path) {
                Ok(volumes) if volumes.is_empty() => ValidationOutcome::fail(format!(
                    "No NIfTI files found in directory: {}",
                    input_path.display()
                )),
                Ok(volumes) => ValidationOutcome::pass(format!(
                    "Found {} NIfTI file(s) in {}",
                    volumes.len(),
                    input_path.display()
                )),
                Err(e) => ValidationOutcome::fail(format!("Cannot list {}: {e}", input_path.display())),
            };
        }

        ValidationOutcome::fail(format!(
            "Input path is neither a file nor a directory: {}",
            input_path.display()
        ))
    }

    /// Like [`check_input`](Self::check_input), but as a `Result`.
    ///
    /// Warnings are emitted as `validation.warning` events.
    pub fn validate_input(&self, input_path: &Path) -> Result<(), StageError> {
        let warnings = self.check_input(input_path).into_result(STAGE)?;
        emit_warnings(self.sink.as_ref(), "validation.warning", STAGE, &warnings);
        Ok(())
    }

    /// Builds the inference invocation.
    #[must_use]
    pub fn build_command(&self, input_path: &Path, output_dir: &Path, selector: StageSelector) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.binary)
            .arg(input_path.display().to_string())
            .arg(output_dir.display().to_string());
        if selector == StageSelector::LandmarksOnly {
            spec = spec.arg("--step1");
        }
        if self.config.isotropic {
            spec = spec.arg("--iso");
        }
        spec.env(&self.config.data_env_var, self.data_dir_value())
            .with_timeout(self.config.timeout())
    }

    /// Runs segmentation on a volume or a directory of volumes.
    pub async fn infer(
        &self,
        input_path: &Path,
        output_dir: &Path,
        selector: StageSelector,
    ) -> Result<StageResult, StageError> {
        let started_at = now_utc();
        let timer = Instant::now();
        self.sink.try_emit(
            "stage.started",
            Some(serde_json::json!({
                "stage": STAGE.label(),
                "input": input_path,
                "output": output_dir,
                "selector": selector,
            })),
        );

        match self.run_inference(input_path, output_dir, selector).await {
            Ok((spec, stdout, categories, warnings)) => {
                let mut result = StageResult::completed(STAGE, started_at, timer.elapsed())
                    .with_output_dir(output_dir)
                    .with_tool_output(spec.display(), stdout)
                    .with_warnings(warnings);
                for (name, files) in categories {
                    result = result.with_category(name, files);
                }
                self.sink.try_emit(
                    "stage.completed",
                    Some(serde_json::json!({
                        "stage": STAGE.label(),
                        "files": result.file_counts(),
                        "elapsed_seconds": result.elapsed_seconds,
                    })),
                );
                Ok(result)
            }
            Err(err) => Err(emit_failed(self.sink.as_ref(), err)),
        }
    }

    async fn run_inference(
        &self,
        input_path: &Path,
        output_dir: &Path,
        selector: StageSelector,
    ) -> Result<(CommandSpec, String, Categories, Vec<String>), StageError> {
        self.validate_input(input_path)?;
        self.ensure_models_present().await?;

        std::fs::create_dir_all(output_dir)
            .map_err(|e| StageError::io_at(STAGE, "create output directory", output_dir, e))?;

        let before = DirSnapshot::capture(output_dir)
            .map_err(|e| StageError::io_at(STAGE, "inspect output directory", output_dir, e))?;

        let spec = self.build_command(input_path, output_dir, selector);
        emit_invoked(self.sink.as_ref(), STAGE, &spec);

        let output = self.runner.run(&spec).await.map_err(|err| {
            map_run_error(STAGE, err, |_, timeout| StageError::InferenceTimeout { timeout })
        })?;
        if !output.is_success() {
            return Err(StageError::InferenceFailed {
                diagnostic: output.diagnostic(),
            });
        }

        let (categories, warnings) = Self::verify_outputs(output_dir, selector, &before)?;
        emit_warnings(self.sink.as_ref(), "output.warning", STAGE, &warnings);

        Ok((spec, output.stdout, categories, warnings))
    }

    /// Lists what this run wrote into every output category and checks the
    /// primary one.
    fn verify_outputs(
        output_dir: &Path,
        selector: StageSelector,
        before: &DirSnapshot,
    ) -> Result<(Categories, Vec<String>), StageError> {
        let primary = selector.primary_category();
        let mut categories = Vec::with_capacity(OUTPUT_CATEGORIES.len());
        let mut warnings = Vec::new();

        for name in OUTPUT_CATEGORIES {
            let dir = output_dir.join(name);
            let files = if dir.is_dir() {
                let listed = list_files(&dir).map_err(|e| StageError::io_at(STAGE, "list", &dir, e))?;
                let (fresh, stale) = before.partition(listed);
                warnings.extend(
                    stale
                        .iter()
                        .map(|path| format!("Ignoring file left by an earlier run: {}", path.display())),
                );
                fresh
            } else {
                if name != primary {
                    warnings.push(format!("Missing output category: {name}"));
                }
                Vec::new()
            };
            categories.push((name, files));
        }

        let has_volume = categories
            .iter()
            .find(|(name, _)| *name == primary)
            .is_some_and(|(_, files)| files.iter().any(|f| is_volume_name(f)));
        if !has_volume {
            return Err(StageError::critical_output_missing(
                STAGE,
                format!(
                    "No segmentation volume in {}",
                    output_dir.join(primary).display()
                ),
            ));
        }

        Ok((categories, warnings))
    }

    /// Writes `processing_report.json` into the result's output directory.
    ///
    /// Callers treat a failure as a warning.
    pub fn generate_report(&self, result: &StageResult) -> Result<PathBuf, ReportError> {
        let dir = result.output_dir.as_deref().unwrap_or_else(|| Path::new("."));
        let path = ProcessingReport::for_stage(&self.config.report_pipeline_name, result).write_to_dir(dir)?;
        self.sink.try_emit("report.written", Some(serde_json::json!({ "path": path })));
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::process::{CommandOutput, MockCommandRunner, RunError};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        input: PathBuf,
        output: PathBuf,
        sink: Arc<CollectingEventSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            std::fs::create_dir_all(root.join("models/models")).unwrap();
            std::fs::write(root.join("models/models/weights.pth"), b"w").unwrap();
            let input = root.join("study.nii.gz");
            std::fs::write(&input, vec![0u8; 2 * 1024 * 1024]).unwrap();
            Self {
                output: root.join("ai_output"),
                input,
                root,
                _dir: dir,
                sink: Arc::new(CollectingEventSink::new()),
            }
        }

        fn config(&self) -> SegmentationConfig {
            SegmentationConfig::default().with_model_data_dir(self.root.join("models"))
        }

        fn adapter(&self, runner: MockCommandRunner) -> SegmentationAdapter {
            SegmentationAdapter::new(self.config(), Arc::new(runner), self.sink.clone())
        }
    }

    fn write_category(output: &Path, name: &str, file: &str) {
        std::fs::create_dir_all(output.join(name)).unwrap();
        std::fs::write(output.join(name).join(file), b"data").unwrap();
    }

    #[test]
    fn test_selector_from_step() {
        assert_eq!(StageSelector::from_step(1), Some(StageSelector::LandmarksOnly));
        assert_eq!(StageSelector::from_step(2), Some(StageSelector::Full));
        assert_eq!(StageSelector::from_step(3), None);
        assert_eq!(StageSelector::LandmarksOnly.primary_category(), "step1_output");
        assert_eq!(StageSelector::default().primary_category(), "step2_output");
    }

    #[test]
    fn test_build_command() {
        let fx = Fixture::new();
        let adapter = fx.adapter(MockCommandRunner::new());

        let full = adapter.build_command(&fx.input, &fx.output, StageSelector::Full);
        assert!(!full.has_arg("--step1"));
        assert!(full.has_arg("--iso"));
        assert_eq!(full.timeout, Some(Duration::from_secs(1800)));
        assert_eq!(
            full.env.get("TOTALSPINESEG_DATA").map(String::as_str),
            Some(fx.root.join("models").to_str().unwrap())
        );

        let landmarks = adapter.build_command(&fx.input, &fx.output, StageSelector::LandmarksOnly);
        assert!(landmarks.has_arg("--step1"));
    }

    #[test]
    fn test_check_input() {
        let fx = Fixture::new();
        let adapter = fx.adapter(MockCommandRunner::new());

        assert!(adapter.check_input(&fx.input).valid);
        assert!(!adapter.check_input(&fx.root.join("missing.nii.gz")).valid);

        let text = fx.root.join("notes.txt");
        std::fs::write(&text, b"x").unwrap();
        assert!(!adapter.check_input(&text).valid);

        let small = fx.root.join("small.nii");
        std::fs::write(&small, b"x").unwrap();
        let outcome = adapter.check_input(&small);
        assert!(outcome.valid);
        assert_eq!(outcome.warnings.len(), 1);

        let empty_dir = fx.root.join("empty");
        std::fs::create_dir(&empty_dir).unwrap();
        assert!(!adapter.check_input(&empty_dir).valid);
        assert!(adapter.check_input(&fx.root).valid);
    }

    #[tokio::test]
    async fn test_invalid_input_spawns_nothing() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(0);

        let err = fx
            .adapter(runner)
            .infer(&fx.root.join("missing.nii.gz"), &fx.output, StageSelector::Full)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::InputInvalid { stage: StageName::Segmentation, .. }));
        assert!(!fx.output.exists());
    }

    #[tokio::test]
    async fn test_models_present_skips_download() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(0);

        fx.adapter(runner).ensure_models_present().await.unwrap();
        assert_eq!(fx.sink.event_types(), vec!["models.ready"]);
    }

    #[tokio::test]
    async fn test_download_populates_models() {
        let fx = Fixture::new();
        std::fs::remove_dir_all(fx.root.join("models/models")).unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|spec| spec.program == "totalspineseg_init" && spec.env.contains_key("TOTALSPINESEG_DATA"))
            .times(1)
            .returning(|spec| {
                let data = PathBuf::from(&spec.env["TOTALSPINESEG_DATA"]);
                std::fs::create_dir_all(data.join("models")).unwrap();
                std::fs::write(data.join("models/Dataset101.zip"), b"z").unwrap();
                Ok(CommandOutput::success("done"))
            });

        fx.adapter(runner).ensure_models_present().await.unwrap();
        assert_eq!(fx.sink.event_types(), vec!["models.missing", "tool.invoked", "models.ready"]);
    }

    #[tokio::test]
    async fn test_download_leaving_empty_dir_fails() {
        let fx = Fixture::new();
        std::fs::remove_dir_all(fx.root.join("models/models")).unwrap();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_| Ok(CommandOutput::success("")));

        let err = fx.adapter(runner).ensure_models_present().await.unwrap_err();
        assert!(matches!(err, StageError::ModelAcquisitionFailed { .. }));
    }

    #[tokio::test]
    async fn test_download_failure_is_not_retried() {
        let fx = Fixture::new();
        std::fs::remove_dir_all(fx.root.join("models/models")).unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_| Ok(CommandOutput::failure(1, "HTTP 503")));

        let err = fx.adapter(runner).ensure_models_present().await.unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_full_run_lists_all_categories() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|spec| {
            let out = PathBuf::from(&spec.args[1]);
            write_category(&out, "step1_output", "study.nii.gz");
            write_category(&out, "step2_output", "study.nii.gz");
            write_category(&out, "preview", "study.png");
            write_category(&out, "step1_levels", "study.nii.gz");
            Ok(CommandOutput::success("Processing complete"))
        });

        let result = fx.adapter(runner).infer(&fx.input, &fx.output, StageSelector::Full).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.categories.len(), 4);
        assert!(result.file_counts().values().all(|&n| n == 1));
        assert!(result.warnings.is_empty());
        assert_eq!(result.output_locations.len(), 4);
    }

    #[tokio::test]
    async fn test_missing_optional_category_warns() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            let out = PathBuf::from(&spec.args[1]);
            write_category(&out, "step1_output", "study.nii.gz");
            write_category(&out, "step2_output", "study.nii.gz");
            Ok(CommandOutput::success(""))
        });

        let result = fx.adapter(runner).infer(&fx.input, &fx.output, StageSelector::Full).await.unwrap();

        assert_eq!(result.warnings.len(), 2);
        assert_eq!(result.category(PREVIEW_CATEGORY).len(), 0);
        assert_eq!(fx.sink.events_of_type("output.warning").len(), 2);
    }

    #[tokio::test]
    async fn test_landmarks_only_uses_step1_as_primary() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            assert!(spec.has_arg("--step1"));
            write_category(&PathBuf::from(&spec.args[1]), "step1_output", "study.nii.gz");
            Ok(CommandOutput::success(""))
        });

        let result = fx
            .adapter(runner)
            .infer(&fx.input, &fx.output, StageSelector::LandmarksOnly)
            .await
            .unwrap();

        assert_eq!(result.category(LANDMARK_CATEGORY).len(), 1);
    }

    #[tokio::test]
    async fn test_empty_primary_category_is_critical() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            let out = PathBuf::from(&spec.args[1]);
            write_category(&out, "step1_output", "study.nii.gz");
            std::fs::create_dir_all(out.join("step2_output")).unwrap();
            Ok(CommandOutput::success(""))
        });

        let err = fx
            .adapter(runner)
            .infer(&fx.input, &fx.output, StageSelector::Full)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::CriticalOutputMissing { stage: StageName::Segmentation, .. }));
        assert_eq!(fx.sink.events_of_type("stage.failed").len(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_inference_failed() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::failure(1, "RuntimeError: CUDA out of memory")));

        let err = fx
            .adapter(runner)
            .infer(&fx.input, &fx.output, StageSelector::Full)
            .await
            .unwrap_err();

        match err {
            StageError::InferenceFailed { diagnostic } => {
                assert_eq!(diagnostic, "RuntimeError: CUDA out of memory");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_inference_timeout() {
        let fx = Fixture::new();
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|spec| {
            Err(RunError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout.unwrap_or_default(),
            })
        });

        let err = fx
            .adapter(runner)
            .infer(&fx.input, &fx.output, StageSelector::Full)
            .await
            .unwrap_err();

        match err {
            StageError::InferenceTimeout { timeout } => assert_eq!(timeout, Duration::from_secs(1800)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_generate_report_writes_into_output_dir() {
        let fx = Fixture::new();
        std::fs::create_dir_all(&fx.output).unwrap();
        let adapter = fx.adapter(MockCommandRunner::new());
        let result = StageResult::completed(StageName::Segmentation, now_utc(), Duration::from_secs(3))
            .with_output_dir(&fx.output)
            .with_category(SEGMENTATION_CATEGORY, vec![fx.output.join("step2_output/study.nii.gz")]);

        let path = adapter.generate_report(&result).unwrap();

        assert_eq!(path, fx.output.join("processing_report.json"));
        let report: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(report["pipeline"], "TotalSpineSeg Clinical Inference");
        assert_eq!(report["clinical_validation"]["vertebrae_segments"], 50);
    }

    #[tokio::test]
    async fn test_generate_report_failure_is_an_error_value() {
        let fx = Fixture::new();
        let adapter = fx.adapter(MockCommandRunner::new());
        let result = StageResult::completed(StageName::Segmentation, now_utc(), Duration::ZERO)
            .with_output_dir(fx.root.join("does/not/exist"));

        assert!(matches!(adapter.generate_report(&result), Err(ReportError::Write { .. })));
    }

    #[tokio::test]
    async fn test_leftover_segmentation_is_not_success() {
        let fx = Fixture::new();
        write_category(&fx.output, "step2_output", "previous.nii.gz");
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|spec| {
            write_category(&PathBuf::from(&spec.args[1]), "step1_output", "study.nii.gz");
            Ok(CommandOutput::success(""))
        });

        let err = fx
            .adapter(runner)
            .infer(&fx.input, &fx.output, StageSelector::Full)
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::CriticalOutputMissing { stage: StageName::Segmentation, .. }));
    }

    #[tokio::test]
    async fn test_leftover_files_are_excluded_from_categories() {
        let fx = Fixture::new();
        write_category(&fx.output, "step2_output", "previous.nii.gz");
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|spec| {
            let out = PathBuf::from(&spec.args[1]);
            write_category(&out, "step1_output", "study.nii.gz");
            write_category(&out, "step2_output", "study.nii.gz");
            write_category(&out, "preview", "study.png");
            write_category(&out, "step1_levels", "study.nii.gz");
            Ok(CommandOutput::success(""))
        });

        let result = fx.adapter(runner).infer(&fx.input, &fx.output, StageSelector::Full).await.unwrap();

        assert_eq!(
            result.category(SEGMENTATION_CATEGORY),
            &[fx.output.join("step2_output/study.nii.gz")]
        );
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("previous.nii.gz"));
    }
}
