//! Sequential, fail-fast driver for the three stages.

use super::selection::{conversion_order, select_segmentation_file};
use crate::adapters::{ConversionAdapter, SegmentationAdapter, StageSelector, StructuredOutputAdapter, VOLUMES_CATEGORY};
use crate::config::PipelineConfig;
use crate::core::{ProcessingReport, StageName, StageResult, StageStatus};
use crate::errors::StageError;
use crate::events::SharedEventSink;
use crate::process::CommandRunner;
use crate::utils::now_utc;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Sub-directory of the work directory receiving converted volumes.
pub const NIFTI_DIR: &str = "nifti";

/// Sub-directory of the work directory receiving segmentation outputs.
pub const AI_OUTPUT_DIR: &str = "ai_output";

/// Outcome of one pipeline run.
#[derive(Debug, Serialize)]
pub struct PipelineResult {
    /// Identifier of this run.
    pub run_id: Uuid,
    /// Pipeline name from the configuration.
    pub pipeline_name: String,
    /// Results of the stages that ran, in order. A failed stage is last.
    pub stages: Vec<StageResult>,
    /// The error that stopped the run.
    #[serde(serialize_with = "serialize_failure")]
    pub failure: Option<StageError>,
    /// The DICOM SEG file, on success.
    pub final_output: Option<PathBuf>,
    /// Pipeline report, if one was written.
    pub report_path: Option<PathBuf>,
    /// Why a report could not be written.
    pub report_warning: Option<String>,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

fn serialize_failure<S: serde::Serializer>(failure: &Option<StageError>, serializer: S) -> Result<S::Ok, S::Error> {
    match failure {
        Some(err) => serializer.serialize_some(&err.to_dict()),
        None => serializer.serialize_none(),
    }
}

impl PipelineResult {
    /// Returns true if every stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Status as recorded in the report.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        if self.is_success() {
            StageStatus::Success
        } else {
            StageStatus::Failure
        }
    }

    /// The result of a given stage, if it ran.
    #[must_use]
    pub fn stage(&self, name: StageName) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == name)
    }

    /// Splits into the successful run or the error that stopped it.
    pub fn into_result(mut self) -> Result<Self, StageError> {
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    fn push_report_warning(&mut self, warning: String) {
        self.report_warning = Some(match self.report_warning.take() {
            Some(previous) => format!("{previous}; {warning}"),
            None => warning,
        });
    }
}

/// Runs conversion, segmentation and structured output in sequence.
///
/// The three adapters share one runner and one event sink. The driver holds
/// no per-run state, so runs with distinct work directories may overlap.
pub struct PipelineDriver {
    config: PipelineConfig,
    conversion: ConversionAdapter,
    segmentation: SegmentationAdapter,
    structured: StructuredOutputAdapter,
    sink: SharedEventSink,
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("pipeline_name", &self.config.pipeline_name)
            .finish_non_exhaustive()
    }
}

async fn record<F>(stages: &mut Vec<StageResult>, stage: StageName, work: F) -> Result<StageResult, StageError>
where
    F: Future<Output = Result<StageResult, StageError>>,
{
    let started_at = now_utc();
    let timer = Instant::now();
    match work.await {
        Ok(result) => {
            stages.push(result.clone());
            Ok(result)
        }
        Err(err) => {
            stages.push(StageResult::failed(stage, started_at, timer.elapsed(), err.to_string()));
            Err(err)
        }
    }
}

impl PipelineDriver {
    /// Builds the three adapters from `config`.
    #[must_use]
    pub fn new(config: PipelineConfig, runner: Arc<dyn CommandRunner>, sink: SharedEventSink) -> Self {
        Self {
            conversion: ConversionAdapter::new(config.conversion.clone(), runner.clone(), sink.clone()),
            segmentation: SegmentationAdapter::new(config.segmentation.clone(), runner.clone(), sink.clone()),
            structured: StructuredOutputAdapter::new(config.structured_output.clone(), runner, sink.clone()),
            config,
            sink,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The conversion adapter.
    #[must_use]
    pub fn conversion(&self) -> &ConversionAdapter {
        &self.conversion
    }

    /// The segmentation adapter.
    #[must_use]
    pub fn segmentation(&self) -> &SegmentationAdapter {
        &self.segmentation
    }

    /// The structured-output adapter.
    #[must_use]
    pub fn structured_output(&self) -> &StructuredOutputAdapter {
        &self.structured
    }

    /// Verifies all three tools, in stage order.
    pub async fn initialize(&self) -> Result<(), StageError> {
        self.conversion.initialize().await?;
        self.segmentation.initialize().await?;
        self.structured.initialize().await
    }

    /// Runs the whole pipeline on one DICOM study.
    ///
    /// Intermediate artifacts go to `<work_dir>/nifti` and
    /// `<work_dir>/ai_output`; the DICOM SEG object is written to
    /// `final_output`. The first failing stage stops the run.
    pub async fn run(&self, source_dicom_dir: &Path, work_dir: &Path, final_output: &Path) -> PipelineResult {
        let run_id = Uuid::new_v4();
        let timer = Instant::now();
        self.sink.try_emit(
            "pipeline.started",
            Some(serde_json::json!({
                "run_id": run_id,
                "pipeline": self.config.pipeline_name,
                "input": source_dicom_dir,
                "work_dir": work_dir,
            })),
        );

        let mut stages = Vec::with_capacity(StageName::ALL.len());
        let mut report_warnings = Vec::new();
        let outcome = self
            .run_stages(source_dicom_dir, work_dir, final_output, &mut stages, &mut report_warnings)
            .await;

        let mut result = PipelineResult {
            run_id,
            pipeline_name: self.config.pipeline_name.clone(),
            stages,
            failure: outcome.err(),
            final_output: None,
            report_path: None,
            report_warning: None,
            elapsed: timer.elapsed(),
        };
        if result.is_success() {
            result.final_output = Some(final_output.to_path_buf());
        }
        for warning in report_warnings {
            result.push_report_warning(warning);
        }

        if self.config.generate_report {
            self.write_pipeline_report(&mut result, work_dir);
        }

        match &result.failure {
            None => self.sink.try_emit(
                "pipeline.completed",
                Some(serde_json::json!({
                    "run_id": run_id,
                    "output": final_output,
                    "elapsed_seconds": result.elapsed.as_secs_f64(),
                })),
            ),
            Some(err) => self.sink.try_emit(
                "pipeline.failed",
                Some(serde_json::json!({
                    "run_id": run_id,
                    "error": err.to_dict(),
                    "elapsed_seconds": result.elapsed.as_secs_f64(),
                })),
            ),
        }

        result
    }

    async fn run_stages(
        &self,
        source_dicom_dir: &Path,
        work_dir: &Path,
        final_output: &Path,
        stages: &mut Vec<StageResult>,
        report_warnings: &mut Vec<String>,
    ) -> Result<(), StageError> {
        let nifti_dir = work_dir.join(NIFTI_DIR);
        let ai_output_dir = work_dir.join(AI_OUTPUT_DIR);
        let selector = StageSelector::Full;

        let converted = record(
            stages,
            StageName::Conversion,
            self.conversion.convert(source_dicom_dir, &nifti_dir),
        )
        .await?;

        let segmented = record(
            stages,
            StageName::Segmentation,
            self.segmentation.infer(&nifti_dir, &ai_output_dir, selector),
        )
        .await?;

        if self.config.generate_report {
            if let Err(err) = self.segmentation.generate_report(&segmented) {
                self.warn_report(&err.to_string());
                report_warnings.push(err.to_string());
            }
        }

        record(stages, StageName::StructuredOutput, async {
            let order = conversion_order(&converted.reported_outputs, converted.category(VOLUMES_CATEGORY));
            let selection = select_segmentation_file(segmented.category(selector.primary_category()), &order)?;
            if let Some(warning) = &selection.warning {
                self.sink.try_emit(
                    "selection.warning",
                    Some(serde_json::json!({
                        "stage": StageName::StructuredOutput.label(),
                        "chosen": selection.path,
                        "message": warning,
                    })),
                );
            }
            let result = self
                .structured
                .convert(&selection.path, source_dicom_dir, final_output, None)
                .await?;
            Ok(result.with_warnings(selection.warning.into_iter().collect()))
        })
        .await?;

        Ok(())
    }

    fn write_pipeline_report(&self, result: &mut PipelineResult, work_dir: &Path) {
        let report = ProcessingReport::for_stages(
            &self.config.pipeline_name,
            result.status(),
            result.elapsed.as_secs_f64(),
            Some(work_dir.to_path_buf()),
            &result.stages,
        )
        .with_run_id(result.run_id);

        let written = std::fs::create_dir_all(work_dir)
            .map_err(|source| crate::errors::ReportError::Write {
                path: work_dir.to_path_buf(),
                source,
            })
            .and_then(|()| report.write_to_dir(work_dir));
        match written {
            Ok(path) => {
                self.sink.try_emit("report.written", Some(serde_json::json!({ "path": path })));
                result.report_path = Some(path);
            }
            Err(err) => {
                self.warn_report(&err.to_string());
                result.push_report_warning(err.to_string());
            }
        }
    }

    fn warn_report(&self, message: &str) {
        self.sink
            .try_emit("report.warning", Some(serde_json::json!({ "message": message })));
    }
}
