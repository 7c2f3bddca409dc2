//! Core domain model types for segflow.
//!
//! This module contains the fundamental types shared by every stage:
//! - Stage name and status enums
//! - The per-stage `StageResult`
//! - The JSON processing report

mod report;
mod result;
mod status;

pub use report::{
    ClinicalValidation, ProcessingReport, StageSummary, REPORT_FILE_NAME, VERIFICATION_PENDING,
    VERTEBRAE_SEGMENTS,
};
pub use result::StageResult;
pub use status::{StageName, StageStatus};
