//! # Segflow
//!
//! Orchestration of a three-stage medical imaging pipeline:
//!
//! 1. **Conversion**: a DICOM study becomes NIfTI volumes (`dcm2niix`)
//! 2. **Segmentation**: TotalSpineSeg labels the vertebral column
//! 3. **Structured output**: the label volume is encoded as a DICOM SEG
//!    object referencing the source series (`itkimage2segimage`)
//!
//! Each stage is an adapter around an external tool. Adapters validate
//! their inputs before spawning anything, bound every tool call with a hard
//! timeout, and only report success after checking the expected outputs on
//! disk. Logging goes through an injected [`EventSink`](events::EventSink).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use segflow::prelude::*;
//! use std::sync::Arc;
//!
//! let driver = PipelineDriver::new(
//!     PipelineConfig::new(),
//!     Arc::new(TokioCommandRunner),
//!     segflow::events::logging_sink(),
//! );
//! driver.initialize().await?;
//!
//! let result = driver.run(dicom_dir, work_dir, final_output).await;
//! let result = result.into_result()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod adapters;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod process;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapters::{
        ConversionAdapter, SegmentationAdapter, SegmentationMetadata, StageSelector,
        StructuredOutputAdapter,
    };
    pub use crate::config::{
        ConversionConfig, PipelineConfig, SegmentationConfig, StructuredOutputConfig,
    };
    pub use crate::core::{ProcessingReport, StageName, StageResult, StageStatus};
    pub use crate::errors::{ReportError, StageError, ValidationOutcome};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, SharedEventSink};
    pub use crate::pipeline::{PipelineDriver, PipelineResult};
    pub use crate::process::{CommandOutput, CommandRunner, CommandSpec, RunError, TokioCommandRunner};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
