//! Testing utilities for segflow.
//!
//! This module provides:
//! - A scripted `CommandRunner` that records every invocation
//! - Fake tool behaviours that write realistic output layouts
//! - A scratch directory layout for whole-pipeline runs
//!
//! Compiled for this crate's tests and behind the `testing` feature.

mod fixtures;
mod mocks;

pub use fixtures::{
    fake_converter, fake_seg_writer, fake_segmenter, healthy_toolchain, write_file, write_volume,
    StudyLayout, FAKE_VOLUME_BYTES,
};
pub use mocks::{ScriptFn, ScriptedRunner};
