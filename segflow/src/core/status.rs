//! Stage name and status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three stages of the conversion pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// DICOM series to volumetric (NIfTI) images.
    Conversion,
    /// AI segmentation of the volumetric images.
    Segmentation,
    /// Segmentation volume to a DICOM SEG object.
    StructuredOutput,
}

impl StageName {
    /// All stages in pipeline order.
    pub const ALL: [Self; 3] = [Self::Conversion, Self::Segmentation, Self::StructuredOutput];

    /// The label used in events, reports and error messages.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Conversion => "conversion",
            Self::Segmentation => "segmentation",
            Self::StructuredOutput => "structured_output",
        }
    }

    /// 1-based position in the pipeline.
    #[must_use]
    pub fn ordinal(self) -> usize {
        match self {
            Self::Conversion => 1,
            Self::Segmentation => 2,
            Self::StructuredOutput => 3,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The outcome status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed and its outputs were verified on disk.
    Success,
    /// Stage failed.
    Failure,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}
