//! DICOM to volumetric conversion stage.

use super::volume::{is_volume_name, list_volumes, DirSnapshot};
use super::{emit_failed, emit_invoked, emit_warnings, map_run_error, verify_tool};
use crate::config::ConversionConfig;
use crate::core::{StageName, StageResult};
use crate::errors::{StageError, ValidationOutcome};
use crate::events::SharedEventSink;
use crate::process::{CommandRunner, CommandSpec};
use crate::utils::now_utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

const STAGE: StageName = StageName::Conversion;

/// Invocation, stdout, volumes on disk, tool-reported files, warnings.
type Converted = (CommandSpec, String, Vec<PathBuf>, Vec<PathBuf>, Vec<String>);

/// Result category holding the converted volumes.
pub const VOLUMES_CATEGORY: &str = "volumes";

/// Stdout markers on lines that announce a written file.
const OUTPUT_MARKERS: [&str; 2] = ["Saving", "Convert"];

fn volume_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\s()]+\.nii(?:\.gz)?\b").expect("valid volume token regex"))
}

fn convert_target() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bas\s+([^\s()]+)").expect("valid convert target regex"))
}

/// Extracts the files the converter claims to have written from its stdout.
///
/// This is a heuristic over an undocumented log format: only lines carrying
/// a `Saving`/`Convert` marker are considered, explicit `.nii`/`.nii.gz`
/// tokens are taken as-is, and `Convert ... as <base>` lines without an
/// extension get the extension implied by `compressed`. Relative names are
/// resolved against `output_dir`. The result never decides success.
#[must_use]
pub fn parse_reported_outputs(stdout: &str, output_dir: &Path, compressed: bool) -> Vec<PathBuf> {
    let extension = if compressed { ".nii.gz" } else { ".nii" };
    let mut files: Vec<PathBuf> = Vec::new();

    for line in stdout.lines() {
        if !OUTPUT_MARKERS.iter().any(|m| line.contains(m)) {
            continue;
        }

        let mut found: Vec<String> = volume_token()
            .find_iter(line)
            .map(|m| m.as_str().to_string())
            .collect();
        if found.is_empty() {
            if let Some(caps) = convert_target().captures(line) {
                found.push(format!("{}{extension}", &caps[1]));
            }
        }

        for token in found {
            let path = PathBuf::from(&token);
            let path = if path.is_absolute() { path } else { output_dir.join(path) };
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }

    files
}

/// Wraps the DICOM to NIfTI converter (`dcm2niix`).
pub struct ConversionAdapter {
    config: ConversionConfig,
    runner: Arc<dyn CommandRunner>,
    sink: SharedEventSink,
}

impl std::fmt::Debug for ConversionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConversionAdapter {
    /// Creates a new adapter. No process is started.
    #[must_use]
    pub fn new(config: ConversionConfig, runner: Arc<dyn CommandRunner>, sink: SharedEventSink) -> Self {
        Self { config, runner, sink }
    }

    /// Returns the adapter configuration.
    #[must_use]
    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Verifies that the converter can be executed.
    pub async fn initialize(&self) -> Result<(), StageError> {
        let probe = CommandSpec::new(&self.config.binary)
            .arg("-v")
            .with_timeout(self.config.probe_timeout());
        verify_tool(self.runner.as_ref(), self.sink.as_ref(), STAGE, &probe, &[0]).await
    }

    /// Checks that the DICOM source is an existing directory.
    #[must_use]
    pub fn check_source(source_dir: &Path) -> ValidationOutcome {
        if source_dir.is_dir() {
            ValidationOutcome::pass(format!("Input directory found: {}", source_dir.display()))
        } else if source_dir.exists() {
            ValidationOutcome::fail(format!("Input path is not a directory: {}", source_dir.display()))
        } else {
            ValidationOutcome::fail(format!("Input directory not found: {}", source_dir.display()))
        }
    }

    /// Builds the converter invocation.
    #[must_use]
    pub fn build_command(&self, source_dir: &Path, target_dir: &Path) -> CommandSpec {
        let yes_no = |flag: bool| if flag { "y" } else { "n" };
        CommandSpec::new(&self.config.binary)
            .arg("-o")
            .arg(target_dir.display().to_string())
            .args(["-z", yes_no(self.config.compress)])
            .args(["-ba", yes_no(self.config.anonymize)])
            .arg("-f")
            .arg(&self.config.filename_format)
            .args(["-v", "1"])
            .arg(source_dir.display().to_string())
            .with_timeout(self.config.timeout())
    }

    /// Converts a DICOM study directory into volumetric files.
    ///
    /// Creates `target_dir` if needed. Success requires at least one
    /// volumetric file written into `target_dir` by this invocation after
    /// the converter exits 0. Volumes left by earlier runs are ignored.
    pub async fn convert(&self, source_dir: &Path, target_dir: &Path) -> Result<StageResult, StageError> {
        let started_at = now_utc();
        let timer = Instant::now();
        self.sink.try_emit(
            "stage.started",
            Some(serde_json::json!({
                "stage": STAGE.label(),
                "input": source_dir,
                "output": target_dir,
            })),
        );

        match self.run_conversion(source_dir, target_dir).await {
            Ok((spec, stdout, volumes, reported, warnings)) => {
                let result = StageResult::completed(STAGE, started_at, timer.elapsed())
                    .with_output_dir(target_dir)
                    .with_category(VOLUMES_CATEGORY, volumes)
                    .with_reported_outputs(reported)
                    .with_tool_output(spec.display(), stdout)
                    .with_warnings(warnings);
                self.sink.try_emit(
                    "stage.completed",
                    Some(serde_json::json!({
                        "stage": STAGE.label(),
                        "files": result.output_locations.len(),
                        "elapsed_seconds": result.elapsed_seconds,
                    })),
                );
                Ok(result)
            }
            Err(err) => Err(emit_failed(self.sink.as_ref(), err)),
        }
    }

    async fn run_conversion(&self, source_dir: &Path, target_dir: &Path) -> Result<Converted, StageError> {
        Self::check_source(source_dir).into_result(STAGE)?;

        std::fs::create_dir_all(target_dir)
            .map_err(|e| StageError::io_at(STAGE, "create output directory", target_dir, e))?;

        let before = DirSnapshot::capture(target_dir)
            .map_err(|e| StageError::io_at(STAGE, "inspect output directory", target_dir, e))?;

        let spec = self.build_command(source_dir, target_dir);
        emit_invoked(self.sink.as_ref(), STAGE, &spec);

        let output = self.runner.run(&spec).await.map_err(|err| {
            map_run_error(STAGE, err, |tool, timeout| StageError::ToolTimeout {
                stage: STAGE,
                tool,
                timeout,
            })
        })?;
        if !output.is_success() {
            return Err(StageError::ConversionFailed {
                stage: STAGE,
                diagnostic: output.diagnostic(),
            });
        }

        let reported = parse_reported_outputs(&output.stdout, target_dir, self.config.compress);
        let (volumes, mut warnings) = self.verify_outputs(target_dir, &before)?;
        for path in reported.iter().filter(|p| is_volume_name(p) && !volumes.contains(p)) {
            warnings.push(format!(
                "Converter reported {} but it was not found on disk",
                path.display()
            ));
        }
        emit_warnings(self.sink.as_ref(), "output.warning", STAGE, &warnings);

        Ok((spec, output.stdout, volumes, reported, warnings))
    }

    /// Lists the volumes this run wrote; implausibly small files are kept
    /// but flagged.
    fn verify_outputs(
        &self,
        target_dir: &Path,
        before: &DirSnapshot,
    ) -> Result<(Vec<PathBuf>, Vec<String>), StageError> {
        let listed = list_volumes(target_dir)
            .map_err(|e| StageError::io_at(STAGE, "list output directory", target_dir, e))?;
        let (volumes, stale) = before.partition(listed);

        let mut warnings: Vec<String> = stale
            .iter()
            .map(|path| format!("Ignoring file left by an earlier run: {}", path.display()))
            .collect();
        if volumes.is_empty() {
            return Err(StageError::critical_output_missing(
                STAGE,
                format!("No NIfTI files generated in {}", target_dir.display()),
            ));
        }

        for path in &volumes {
            let size = std::fs::metadata(path)
                .map_err(|e| StageError::io_at(STAGE, "inspect", path, e))?
                .len();
            if size <= self.config.min_output_bytes {
                warnings.push(format!(
                    "Output file suspiciously small ({size} bytes): {}",
                    path.display()
                ));
            }
        }

        Ok((volumes, warnings))
    }
}
