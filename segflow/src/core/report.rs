//! Machine-readable processing report.

use super::{StageName, StageResult, StageStatus};
use crate::errors::ReportError;
use crate::utils::iso_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the report written next to stage outputs.
pub const REPORT_FILE_NAME: &str = "processing_report.json";

/// Review status recorded until a radiologist signs the result off.
pub const VERIFICATION_PENDING: &str = "PENDING_RADIOLOGIST_REVIEW";

/// Number of anatomical structures the segmentation model labels.
pub const VERTEBRAE_SEGMENTS: u32 = 50;

/// Fixed clinical-review placeholder carried by every report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalValidation {
    /// Number of structures the model outputs.
    pub vertebrae_segments: u32,
    /// Review state.
    pub verification_status: String,
}

impl Default for ClinicalValidation {
    fn default() -> Self {
        Self {
            vertebrae_segments: VERTEBRAE_SEGMENTS,
            verification_status: VERIFICATION_PENDING.to_string(),
        }
    }
}

/// Condensed view of a `StageResult` for the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    /// Stage name.
    pub stage: StageName,
    /// Stage status.
    pub status: StageStatus,
    /// Elapsed seconds.
    pub elapsed_seconds: f64,
    /// Command line that was executed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub invocation: String,
    /// Files per output category.
    pub file_counts: BTreeMap<String, usize>,
    /// Warnings raised during the stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Error message for a failed stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&StageResult> for StageSummary {
    fn from(result: &StageResult) -> Self {
        Self {
            stage: result.stage,
            status: result.status,
            elapsed_seconds: result.elapsed_seconds,
            invocation: result.invocation.clone(),
            file_counts: result.file_counts(),
            warnings: result.warnings.clone(),
            error: result.error.clone(),
        }
    }
}

/// The JSON report written once at the end of the segmentation stage or the
/// whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingReport {
    /// When the report was produced (ISO 8601, UTC).
    pub processing_timestamp: String,
    /// Pipeline run identifier, when produced by the driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Pipeline identifier.
    pub pipeline: String,
    /// Overall status.
    pub status: StageStatus,
    /// Total elapsed seconds.
    pub elapsed_seconds: f64,
    /// Directory the report describes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_directory: Option<PathBuf>,
    /// Files per output category, across all stages.
    pub output_summary: BTreeMap<String, usize>,
    /// Per-stage summaries in execution order.
    pub stages: Vec<StageSummary>,
    /// Clinical-review placeholder.
    pub clinical_validation: ClinicalValidation,
}

impl ProcessingReport {
    /// Builds a report for a single stage.
    #[must_use]
    pub fn for_stage(pipeline: impl Into<String>, result: &StageResult) -> Self {
        Self {
            processing_timestamp: iso_timestamp(),
            run_id: None,
            pipeline: pipeline.into(),
            status: result.status,
            elapsed_seconds: result.elapsed_seconds,
            output_directory: result.output_dir.clone(),
            output_summary: result.file_counts(),
            stages: vec![StageSummary::from(result)],
            clinical_validation: ClinicalValidation::default(),
        }
    }

    /// Builds a report spanning several stages.
    ///
    /// Category counts of later stages overwrite earlier ones on name
    /// collision; stage category names are disjoint in practice.
    #[must_use]
    pub fn for_stages(
        pipeline: impl Into<String>,
        status: StageStatus,
        elapsed_seconds: f64,
        output_directory: Option<PathBuf>,
        stages: &[StageResult],
    ) -> Self {
        let output_summary = stages
            .iter()
            .flat_map(StageResult::file_counts)
            .collect::<BTreeMap<_, _>>();

        Self {
            processing_timestamp: iso_timestamp(),
            run_id: None,
            pipeline: pipeline.into(),
            status,
            elapsed_seconds,
            output_directory,
            output_summary,
            stages: stages.iter().map(StageSummary::from).collect(),
            clinical_validation: ClinicalValidation::default(),
        }
    }

    /// Sets the run identifier.
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Serializes the report as pretty JSON into `dir/processing_report.json`.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        let path = dir.join(REPORT_FILE_NAME);
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, body).map_err(|source| ReportError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn segmentation_result(dir: &Path) -> StageResult {
        StageResult::completed(StageName::Segmentation, Utc::now(), Duration::from_secs(12))
            .with_output_dir(dir)
            .with_category("step2_output", vec![dir.join("step2_output/study.nii.gz")])
            .with_category("preview", Vec::new())
    }

    #[test]
    fn test_stage_report_fields() {
        let dir = tempfile::tempdir().unwrap();
        let report = ProcessingReport::for_stage("TotalSpineSeg Clinical Inference", &segmentation_result(dir.path()));

        assert_eq!(report.status, StageStatus::Success);
        assert_eq!(report.output_summary.get("step2_output"), Some(&1));
        assert_eq!(report.output_summary.get("preview"), Some(&0));
        assert_eq!(report.clinical_validation.verification_status, VERIFICATION_PENDING);
        assert_eq!(report.stages.len(), 1);
    }

    #[test]
    fn test_write_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let report = ProcessingReport::for_stage("pipeline", &segmentation_result(dir.path()))
            .with_run_id(Uuid::new_v4());

        let path = report.write_to_dir(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(REPORT_FILE_NAME));

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["pipeline"], "pipeline");
        assert_eq!(value["status"], "success");
        assert_eq!(value["clinical_validation"]["vertebrae_segments"], 50);
        assert!(value["processing_timestamp"].as_str().unwrap().contains('T'));
        assert!(value["run_id"].is_string());
    }

    #[test]
    fn test_write_report_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let report = ProcessingReport::for_stage("pipeline", &segmentation_result(dir.path()));

        let err = report.write_to_dir(&missing).unwrap_err();
        assert!(matches!(err, ReportError::Write { .. }));
    }

    #[test]
    fn test_multi_stage_summary() {
        let conversion = StageResult::completed(StageName::Conversion, Utc::now(), Duration::from_secs(2))
            .with_category("volumes", vec![PathBuf::from("/w/nifti/a.nii.gz")]);
        let failed = StageResult::failed(StageName::Segmentation, Utc::now(), Duration::from_secs(1), "timeout");

        let report = ProcessingReport::for_stages(
            "pipeline",
            StageStatus::Failure,
            3.0,
            Some(PathBuf::from("/w")),
            &[conversion, failed],
        );

        assert_eq!(report.stages.len(), 2);
        assert_eq!(report.output_summary.get("volumes"), Some(&1));
        assert_eq!(report.stages[1].error.as_deref(), Some("timeout"));
    }
}
