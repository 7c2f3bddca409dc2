//! Pipeline driver.
//!
//! This module provides:
//! - The sequential, fail-fast `PipelineDriver`
//! - The per-run `PipelineResult`
//! - Selection of the segmentation volume passed to the last stage

mod driver;
mod selection;

pub use driver::{PipelineDriver, PipelineResult, AI_OUTPUT_DIR, NIFTI_DIR};
pub use selection::{conversion_order, select_segmentation_file, Selection};
