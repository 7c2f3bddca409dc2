//! Error types for the segflow pipeline.
//!
//! Every stage returns `Result<StageResult, StageError>`. The taxonomy
//! separates precondition failures, tool failures, timeouts and the case
//! where a tool reported success but its outputs are not on disk.

use crate::core::StageName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Process exit code for a handled pipeline failure.
pub const EXIT_HANDLED_FAILURE: u8 = 1;

/// Process exit code for an unexpected failure.
pub const EXIT_UNEXPECTED_FAILURE: u8 = 2;

/// The error type returned by every stage adapter.
#[derive(Debug, Error)]
pub enum StageError {
    /// The external tool is missing or misbehaving.
    #[error("[{stage}] tool unavailable: {tool}: {reason}. {}", install_hint(.tool))]
    ToolUnavailable {
        /// Stage that needs the tool.
        stage: StageName,
        /// Program name or path.
        tool: String,
        /// What went wrong when probing it.
        reason: String,
    },

    /// A precondition on the stage inputs does not hold.
    #[error("[{stage}] invalid input: {message}")]
    InputInvalid {
        /// Stage whose input was rejected.
        stage: StageName,
        /// Diagnostic message.
        message: String,
    },

    /// Model weights could not be downloaded.
    #[error("[segmentation] model acquisition failed: {message}")]
    ModelAcquisitionFailed {
        /// Diagnostic message.
        message: String,
    },

    /// A conversion tool exited with a failure status.
    #[error("[{stage}] conversion failed: {diagnostic}")]
    ConversionFailed {
        /// Conversion or structured-output stage.
        stage: StageName,
        /// Captured tool diagnostics, verbatim.
        diagnostic: String,
    },

    /// The segmentation tool exited with a failure status.
    #[error("[segmentation] inference failed: {diagnostic}")]
    InferenceFailed {
        /// Captured tool diagnostics, verbatim.
        diagnostic: String,
    },

    /// The segmentation tool exceeded its time budget.
    #[error("[segmentation] inference timed out after {}s", .timeout.as_secs_f64())]
    InferenceTimeout {
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// A conversion tool exceeded its time budget.
    #[error("[{stage}] {tool} timed out after {}s", .timeout.as_secs_f64())]
    ToolTimeout {
        /// Stage that ran the tool.
        stage: StageName,
        /// Program name or path.
        tool: String,
        /// The budget that was exceeded.
        timeout: Duration,
    },

    /// The tool reported success but the expected outputs are not on disk.
    #[error("[{stage}] critical output missing: {message}")]
    CriticalOutputMissing {
        /// Stage whose outputs are missing.
        stage: StageName,
        /// What was expected.
        message: String,
    },

    /// Unexpected filesystem or process error.
    #[error("[{stage}] {context}: {source}")]
    Io {
        /// Stage in which the error occurred.
        stage: StageName,
        /// What the orchestrator was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    /// Creates an input-invalid error.
    #[must_use]
    pub fn input_invalid(stage: StageName, message: impl Into<String>) -> Self {
        Self::InputInvalid {
            stage,
            message: message.into(),
        }
    }

    /// Creates a tool-unavailable error.
    #[must_use]
    pub fn tool_unavailable(stage: StageName, tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ToolUnavailable {
            stage,
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Creates a critical-output-missing error.
    #[must_use]
    pub fn critical_output_missing(stage: StageName, message: impl Into<String>) -> Self {
        Self::CriticalOutputMissing {
            stage,
            message: message.into(),
        }
    }

    /// Creates an I/O error with context.
    #[must_use]
    pub fn io(stage: StageName, context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            stage,
            context: context.into(),
            source,
        }
    }

    /// Creates an I/O error about a specific path.
    #[must_use]
    pub fn io_at(stage: StageName, action: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(stage, format!("failed to {action} {}", path.display()), source)
    }

    /// The stage this error belongs to.
    #[must_use]
    pub fn stage(&self) -> StageName {
        match self {
            Self::ToolUnavailable { stage, .. }
            | Self::InputInvalid { stage, .. }
            | Self::ConversionFailed { stage, .. }
            | Self::ToolTimeout { stage, .. }
            | Self::CriticalOutputMissing { stage, .. }
            | Self::Io { stage, .. } => *stage,
            Self::ModelAcquisitionFailed { .. }
            | Self::InferenceFailed { .. }
            | Self::InferenceTimeout { .. } => StageName::Segmentation,
        }
    }

    /// Short machine-readable name of the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolUnavailable { .. } => "ToolUnavailable",
            Self::InputInvalid { .. } => "InputInvalid",
            Self::ModelAcquisitionFailed { .. } => "ModelAcquisitionFailed",
            Self::ConversionFailed { .. } => "ConversionFailed",
            Self::InferenceFailed { .. } => "InferenceFailed",
            Self::InferenceTimeout { .. } => "InferenceTimeout",
            Self::ToolTimeout { .. } => "ToolTimeout",
            Self::CriticalOutputMissing { .. } => "CriticalOutputMissing",
            Self::Io { .. } => "Io",
        }
    }

    /// Returns true for failures the pipeline anticipates.
    ///
    /// Only raw I/O errors count as unexpected.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }

    /// Returns true if the error is a timeout of any tool.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::InferenceTimeout { .. } | Self::ToolTimeout { .. })
    }

    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.is_handled() {
            EXIT_HANDLED_FAILURE
        } else {
            EXIT_UNEXPECTED_FAILURE
        }
    }

    /// Converts to a dictionary representation for events.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("stage".to_string(), serde_json::json!(self.stage().label()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Install guidance for a known external tool.
#[must_use]
pub fn install_hint(tool: &str) -> &'static str {
    let name = Path::new(tool)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(tool);

    match name {
        "dcm2niix" => "Install from https://github.com/rordenlab/dcm2niix",
        "totalspineseg" | "totalspineseg_init" => "Install with: pip install totalspineseg[nnunetv2]",
        "itkimage2segimage" => "Install dcmqi (https://github.com/QIICR/dcmqi), plastimatch or 3D Slicer",
        _ => "Ensure the tool is installed and on PATH",
    }
}

/// Errors writing the processing report. Never fatal to the pipeline.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The report could not be serialized.
    #[error("Failed to serialize processing report: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The report file could not be written.
    #[error("Failed to write processing report {}: {source}", .path.display())]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of checking a stage's input before the tool is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Whether the input is acceptable.
    pub valid: bool,
    /// Diagnostic message.
    pub message: String,
    /// Non-fatal findings.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    /// A passing outcome.
    #[must_use]
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            message: message.into(),
            warnings: Vec::new(),
        }
    }

    /// A failing outcome.
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
            warnings: Vec::new(),
        }
    }

    /// Adds a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Converts to a result, yielding the warnings on success.
    pub fn into_result(self, stage: StageName) -> Result<Vec<String>, StageError> {
        if self.valid {
            Ok(self.warnings)
        } else {
            Err(StageError::input_invalid(stage, self.message))
        }
    }
}
