//! On-disk fixtures and fake tool behaviours.

use std::io;
use std::path::{Path, PathBuf};

use super::mocks::ScriptedRunner;
use crate::config::{PipelineConfig, SegmentationConfig};
use crate::process::{CommandOutput, CommandSpec, RunError};

/// Size of a fake volume: large enough to pass every size check.
pub const FAKE_VOLUME_BYTES: usize = 1024 * 1024 + 1;

/// Writes a zero-filled file of `bytes`, creating parent directories.
pub fn write_file(path: &Path, bytes: usize) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, vec![0u8; bytes])
}

/// Writes a fake volume that passes every size check.
pub fn write_volume(path: &Path) -> io::Result<()> {
    write_file(path, FAKE_VOLUME_BYTES)
}

fn io_failure(spec: &CommandSpec, source: io::Error) -> RunError {
    RunError::Wait {
        program: spec.program.clone(),
        source,
    }
}

fn is_probe(spec: &CommandSpec) -> bool {
    spec.args.len() == 1 && (spec.has_arg("-v") || spec.has_arg("--help"))
}

/// A converter that writes `<stem>.nii.gz` for every stem into its `-o` dir.
pub fn fake_converter(
    stems: &[&str],
) -> impl Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync + 'static {
    let stems: Vec<String> = stems.iter().map(|s| (*s).to_string()).collect();
    move |spec: &CommandSpec| {
        if is_probe(spec) {
            return Ok(CommandOutput::success("Chris Rorden's dcm2niiX version v1.0.20230411"));
        }
        let out = PathBuf::from(spec.flag_value("-o").unwrap_or_default());
        let mut stdout = String::new();
        for stem in &stems {
            write_volume(&out.join(format!("{stem}.nii.gz"))).map_err(|e| io_failure(spec, e))?;
            stdout.push_str(&format!("Convert 20 DICOM as {} (512x512x20x1)\n", out.join(stem).display()));
        }
        Ok(CommandOutput::success(stdout))
    }
}

/// A segmentation tool that writes `files` as `(category, file name)` pairs
/// under its output directory (second positional argument).
pub fn fake_segmenter(
    files: &[(&str, &str)],
) -> impl Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync + 'static {
    let files: Vec<(String, String)> = files
        .iter()
        .map(|(category, name)| ((*category).to_string(), (*name).to_string()))
        .collect();
    move |spec: &CommandSpec| {
        if is_probe(spec) {
            return Ok(CommandOutput::success("usage: totalspineseg [-h] input output"));
        }
        let out = PathBuf::from(spec.args.get(1).cloned().unwrap_or_default());
        for (category, name) in &files {
            let dir = out.join(category);
            std::fs::create_dir_all(&dir).map_err(|e| io_failure(spec, e))?;
            if !name.is_empty() {
                write_file(&dir.join(name), 2048).map_err(|e| io_failure(spec, e))?;
            }
        }
        Ok(CommandOutput::success("Inference done"))
    }
}

/// A DICOM SEG generator that writes a small file at `--outputDICOM`.
///
/// Its `--help` probe exits 1, as the real tool commonly does.
pub fn fake_seg_writer() -> impl Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync + 'static {
    |spec: &CommandSpec| {
        if is_probe(spec) {
            return Ok(CommandOutput::failure(1, "USAGE: itkimage2segimage [options]"));
        }
        let out = PathBuf::from(spec.flag_value("--outputDICOM").unwrap_or_default());
        std::fs::write(&out, b"DICM").map_err(|e| io_failure(spec, e))?;
        Ok(CommandOutput::success(""))
    }
}

/// A scripted runner where all three tools behave well.
///
/// The segmenter writes one file into every output category, named after
/// the first converted stem.
#[must_use]
pub fn healthy_toolchain(stems: &[&str]) -> ScriptedRunner {
    let first = format!("{}.nii.gz", stems.first().copied().unwrap_or("study"));
    ScriptedRunner::new()
        .on("dcm2niix", fake_converter(stems))
        .on(
            "totalspineseg",
            fake_segmenter(&[
                ("step1_output", first.as_str()),
                ("step2_output", first.as_str()),
                ("preview", "preview.png"),
                ("step1_levels", first.as_str()),
            ]),
        )
        .on("itkimage2segimage", fake_seg_writer())
}

/// Directory layout for one pipeline run rooted in a scratch directory.
#[derive(Debug, Clone)]
pub struct StudyLayout {
    /// Source DICOM directory.
    pub dicom_dir: PathBuf,
    /// Working directory for intermediate artifacts.
    pub work_dir: PathBuf,
    /// Final DICOM SEG path.
    pub final_output: PathBuf,
    /// Model data directory, pre-populated with fake weights.
    pub model_data_dir: PathBuf,
}

impl StudyLayout {
    /// Creates the layout under `root`, with one DICOM file and model weights.
    pub fn create(root: &Path) -> io::Result<Self> {
        let layout = Self {
            dicom_dir: root.join("dicom"),
            work_dir: root.join("work"),
            final_output: root.join("final/study_seg.dcm"),
            model_data_dir: root.join("model_data"),
        };
        write_file(&layout.dicom_dir.join("IM0001.dcm"), 512)?;
        write_file(&layout.model_data_dir.join("models/Dataset101_weights.zip"), 16)?;
        Ok(layout)
    }

    /// A pipeline configuration pointing at this layout's model data.
    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::new().with_segmentation(SegmentationConfig::default().with_model_data_dir(&self.model_data_dir))
    }
}
