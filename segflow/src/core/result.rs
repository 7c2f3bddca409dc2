//! Typed result returned by a stage adapter.

use super::{StageName, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The result of one stage invocation.
///
/// A `StageResult` is produced once per adapter call and is not mutated
/// afterwards; the builder methods consume `self`. Adapters only return a
/// successful result after the stage's expected outputs were found on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage that produced this result.
    pub stage: StageName,
    /// Stage status.
    pub status: StageStatus,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock time spent in the stage, in seconds.
    pub elapsed_seconds: f64,
    /// Directory the stage wrote into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Verified output files, in deterministic order.
    #[serde(default)]
    pub output_locations: Vec<PathBuf>,
    /// Verified output files grouped by category.
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<PathBuf>>,
    /// Files the tool claimed to write, parsed from its stdout.
    ///
    /// Best-effort only; never used to decide success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reported_outputs: Vec<PathBuf>,
    /// Captured stdout of the tool.
    #[serde(default)]
    pub raw_tool_output: String,
    /// The literal command line that was executed.
    #[serde(default)]
    pub invocation: String,
    /// Non-fatal findings (suspiciously small files, missing optional outputs).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Error message if failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageResult {
    /// Creates a successful stage result.
    #[must_use]
    pub fn completed(stage: StageName, started_at: DateTime<Utc>, elapsed: Duration) -> Self {
        Self {
            stage,
            status: StageStatus::Success,
            started_at,
            elapsed_seconds: elapsed.as_secs_f64(),
            output_dir: None,
            output_locations: Vec::new(),
            categories: BTreeMap::new(),
            reported_outputs: Vec::new(),
            raw_tool_output: String::new(),
            invocation: String::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// Creates a failed stage result.
    #[must_use]
    pub fn failed(
        stage: StageName,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: StageStatus::Failure,
            error: Some(error.into()),
            ..Self::completed(stage, started_at, elapsed)
        }
    }

    /// Sets the output directory.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Adds a category of verified outputs.
    ///
    /// Files are appended to `output_locations` in the order given.
    #[must_use]
    pub fn with_category(mut self, name: impl Into<String>, files: Vec<PathBuf>) -> Self {
        self.output_locations.extend(files.iter().cloned());
        self.categories.insert(name.into(), files);
        self
    }

    /// Sets the outputs parsed from tool stdout.
    #[must_use]
    pub fn with_reported_outputs(mut self, files: Vec<PathBuf>) -> Self {
        self.reported_outputs = files;
        self
    }

    /// Records the invocation and its captured stdout.
    #[must_use]
    pub fn with_tool_output(mut self, invocation: impl Into<String>, raw: impl Into<String>) -> Self {
        self.invocation = invocation.into();
        self.raw_tool_output = raw.into();
        self
    }

    /// Adds warnings.
    #[must_use]
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the stage failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// Elapsed time as a `Duration`.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_seconds.max(0.0))
    }

    /// Files recorded for a category, or an empty slice.
    #[must_use]
    pub fn category(&self, name: &str) -> &[PathBuf] {
        self.categories.get(name).map_or(&[], Vec::as_slice)
    }

    /// Number of files per category.
    #[must_use]
    pub fn file_counts(&self) -> BTreeMap<String, usize> {
        self.categories
            .iter()
            .map(|(name, files)| (name.clone(), files.len()))
            .collect()
    }

    /// The first verified output, if any.
    #[must_use]
    pub fn primary_output(&self) -> Option<&Path> {
        self.output_locations.first().map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_completed_result_collects_categories() {
        let result = StageResult::completed(StageName::Segmentation, Utc::now(), Duration::from_millis(1500))
            .with_output_dir("/out")
            .with_category("step1_output", vec![PathBuf::from("/out/step1_output/a.nii.gz")])
            .with_category("step2_output", vec![
                PathBuf::from("/out/step2_output/a.nii.gz"),
                PathBuf::from("/out/step2_output/b.nii.gz"),
            ]);

        assert!(result.is_success());
        assert_eq!(result.output_locations.len(), 3);
        assert_eq!(result.category("step2_output").len(), 2);
        assert!(result.category("preview").is_empty());
        assert!((result.elapsed_seconds - 1.5).abs() < f64::EPSILON);

        let counts = result.file_counts();
        assert_eq!(counts.get("step1_output"), Some(&1));
        assert_eq!(counts.get("step2_output"), Some(&2));
    }

    #[test]
    fn test_failed_result() {
        let result = StageResult::failed(StageName::Conversion, Utc::now(), Duration::ZERO, "boom");

        assert!(result.is_failure());
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.primary_output().is_none());
    }

    #[test]
    fn test_result_serializes_stage_and_status() {
        let result = StageResult::completed(StageName::StructuredOutput, Utc::now(), Duration::ZERO)
            .with_tool_output("itkimage2segimage --skip", "done");

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["stage"], "structured_output");
        assert_eq!(value["status"], "success");
        assert_eq!(value["invocation"], "itkimage2segimage --skip");
        assert!(value.get("error").is_none());
    }
}
