//! Configuration for the stage adapters and the pipeline driver.
//!
//! All settings are explicit structs with serde defaults so a partial TOML
//! file only overrides what it names. Nothing is read from the process
//! environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for `PipelineConfig`.
    #[error("Failed to parse config {}: {source}", .path.display())]
    Parse {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// A setting is out of range.
    #[error("Invalid setting {field}: {message}")]
    Invalid {
        /// Setting name.
        field: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Checks that `seconds` is a usable timeout: finite, positive and
/// representable as a [`Duration`].
pub fn validate_timeout(field: &str, seconds: f64) -> Result<Duration, ConfigError> {
    let invalid = |message: &str| ConfigError::Invalid {
        field: field.to_string(),
        message: format!("{message}, got {seconds}"),
    };
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(invalid("timeout must be a positive, finite number of seconds"));
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid("timeout is too large"))
}

// Values rejected by `validate_timeout` saturate instead of panicking.
fn secs(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

fn default_probe_timeout() -> f64 {
    30.0
}

fn default_conversion_binary() -> String {
    "dcm2niix".to_string()
}

fn default_true() -> bool {
    true
}

fn default_filename_format() -> String {
    // Protocol_Series_Description
    "%p_%s_%d".to_string()
}

fn default_conversion_timeout() -> f64 {
    600.0
}

fn default_min_output_bytes() -> u64 {
    1024
}

/// Configuration for the DICOM to volumetric conversion stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Converter program name or path.
    #[serde(default = "default_conversion_binary")]
    pub binary: String,
    /// Write gzip-compressed volumes.
    #[serde(default = "default_true")]
    pub compress: bool,
    /// Strip identifying fields from the BIDS sidecars.
    #[serde(default)]
    pub anonymize: bool,
    /// Output filename pattern passed to the converter.
    #[serde(default = "default_filename_format")]
    pub filename_format: String,
    /// Conversion timeout in seconds.
    #[serde(default = "default_conversion_timeout")]
    pub timeout_seconds: f64,
    /// Health-check timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: f64,
    /// Volumes at or below this size are flagged as suspect.
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            binary: default_conversion_binary(),
            compress: true,
            anonymize: false,
            filename_format: default_filename_format(),
            timeout_seconds: default_conversion_timeout(),
            probe_timeout_seconds: default_probe_timeout(),
            min_output_bytes: default_min_output_bytes(),
        }
    }
}

impl ConversionConfig {
    /// Sets the converter binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Enables or disables compression.
    #[must_use]
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Enables or disables anonymization.
    #[must_use]
    pub fn with_anonymize(mut self, anonymize: bool) -> Self {
        self.anonymize = anonymize;
        self
    }

    /// Sets the conversion timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Conversion timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_seconds)
    }

    /// Health-check timeout.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        secs(self.probe_timeout_seconds)
    }

    /// Checks the timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout("conversion.timeout_seconds", self.timeout_seconds)?;
        validate_timeout("conversion.probe_timeout_seconds", self.probe_timeout_seconds)?;
        Ok(())
    }
}

fn default_segmentation_binary() -> String {
    "totalspineseg".to_string()
}

fn default_model_data_dir() -> PathBuf {
    PathBuf::from("/app/models")
}

fn default_models_subdir() -> String {
    "models".to_string()
}

fn default_download_command() -> Vec<String> {
    vec!["totalspineseg_init".to_string()]
}

fn default_data_env_var() -> String {
    "TOTALSPINESEG_DATA".to_string()
}

fn default_inference_timeout() -> f64 {
    1800.0
}

fn default_download_timeout() -> f64 {
    3600.0
}

fn default_min_input_bytes() -> u64 {
    1024 * 1024
}

fn default_report_pipeline_name() -> String {
    "TotalSpineSeg Clinical Inference".to_string()
}

/// Configuration for the AI segmentation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Segmentation program name or path.
    #[serde(default = "default_segmentation_binary")]
    pub binary: String,
    /// Directory holding model weights; read and written.
    #[serde(default = "default_model_data_dir")]
    pub model_data_dir: PathBuf,
    /// Sub-directory of `model_data_dir` that must be non-empty.
    #[serde(default = "default_models_subdir")]
    pub models_subdir: String,
    /// Command that downloads the model weights.
    #[serde(default = "default_download_command")]
    pub download_command: Vec<String>,
    /// Environment variable through which the tools find `model_data_dir`.
    #[serde(default = "default_data_env_var")]
    pub data_env_var: String,
    /// Inference timeout in seconds.
    #[serde(default = "default_inference_timeout")]
    pub timeout_seconds: f64,
    /// Health-check timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: f64,
    /// Model download timeout in seconds.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_seconds: f64,
    /// Request isotropic output resampling.
    #[serde(default = "default_true")]
    pub isotropic: bool,
    /// Input volumes below this size produce a warning.
    #[serde(default = "default_min_input_bytes")]
    pub min_input_bytes: u64,
    /// Pipeline identifier written into the stage report.
    #[serde(default = "default_report_pipeline_name")]
    pub report_pipeline_name: String,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            binary: default_segmentation_binary(),
            model_data_dir: default_model_data_dir(),
            models_subdir: default_models_subdir(),
            download_command: default_download_command(),
            data_env_var: default_data_env_var(),
            timeout_seconds: default_inference_timeout(),
            probe_timeout_seconds: default_probe_timeout(),
            download_timeout_seconds: default_download_timeout(),
            isotropic: true,
            min_input_bytes: default_min_input_bytes(),
            report_pipeline_name: default_report_pipeline_name(),
        }
    }
}

impl SegmentationConfig {
    /// Sets the segmentation binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Sets the model data directory.
    #[must_use]
    pub fn with_model_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_data_dir = dir.into();
        self
    }

    /// Sets the model download command.
    #[must_use]
    pub fn with_download_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.download_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the inference timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Directory that must contain the model weights.
    #[must_use]
    pub fn models_dir(&self) -> PathBuf {
        self.model_data_dir.join(&self.models_subdir)
    }

    /// Inference timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_seconds)
    }

    /// Health-check timeout.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        secs(self.probe_timeout_seconds)
    }

    /// Model download timeout.
    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        secs(self.download_timeout_seconds)
    }

    /// Checks the timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout("segmentation.timeout_seconds", self.timeout_seconds)?;
        validate_timeout("segmentation.probe_timeout_seconds", self.probe_timeout_seconds)?;
        validate_timeout("segmentation.download_timeout_seconds", self.download_timeout_seconds)?;
        Ok(())
    }
}

fn default_structured_binary() -> String {
    "itkimage2segimage".to_string()
}

fn default_accepted_probe_codes() -> Vec<i32> {
    // `--help` commonly exits with 1
    vec![0, 1]
}

/// Configuration for the DICOM SEG generation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutputConfig {
    /// Generator program name or path.
    #[serde(default = "default_structured_binary")]
    pub binary: String,
    /// Generation timeout in seconds.
    #[serde(default = "default_conversion_timeout")]
    pub timeout_seconds: f64,
    /// Health-check timeout in seconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: f64,
    /// Exit codes of the `--help` probe that count as "installed".
    #[serde(default = "default_accepted_probe_codes")]
    pub accepted_probe_codes: Vec<i32>,
    /// Metadata merged over the defaults on every conversion.
    #[serde(default)]
    pub metadata_overrides: Option<serde_json::Value>,
}

impl Default for StructuredOutputConfig {
    fn default() -> Self {
        Self {
            binary: default_structured_binary(),
            timeout_seconds: default_conversion_timeout(),
            probe_timeout_seconds: default_probe_timeout(),
            accepted_probe_codes: default_accepted_probe_codes(),
            metadata_overrides: None,
        }
    }
}

impl StructuredOutputConfig {
    /// Sets the generator binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Sets metadata overrides.
    #[must_use]
    pub fn with_metadata_overrides(mut self, overrides: serde_json::Value) -> Self {
        self.metadata_overrides = Some(overrides);
        self
    }

    /// Generation timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_seconds)
    }

    /// Health-check timeout.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        secs(self.probe_timeout_seconds)
    }

    /// Checks the timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_timeout("structured_output.timeout_seconds", self.timeout_seconds)?;
        validate_timeout("structured_output.probe_timeout_seconds", self.probe_timeout_seconds)?;
        Ok(())
    }
}

fn default_pipeline_name() -> String {
    "Spine Segmentation Pipeline".to_string()
}

/// Configuration for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline identifier used in reports.
    #[serde(default = "default_pipeline_name")]
    pub pipeline_name: String,
    /// Write processing reports.
    #[serde(default)]
    pub generate_report: bool,
    /// Conversion stage settings.
    #[serde(default)]
    pub conversion: ConversionConfig,
    /// Segmentation stage settings.
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    /// Structured-output stage settings.
    #[serde(default)]
    pub structured_output: StructuredOutputConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_name: default_pipeline_name(),
            generate_report: false,
            conversion: ConversionConfig::default(),
            segmentation: SegmentationConfig::default(),
            structured_output: StructuredOutputConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables report generation.
    #[must_use]
    pub fn with_report(mut self, generate: bool) -> Self {
        self.generate_report = generate;
        self
    }

    /// Replaces the conversion settings.
    #[must_use]
    pub fn with_conversion(mut self, conversion: ConversionConfig) -> Self {
        self.conversion = conversion;
        self
    }

    /// Replaces the segmentation settings.
    #[must_use]
    pub fn with_segmentation(mut self, segmentation: SegmentationConfig) -> Self {
        self.segmentation = segmentation;
        self
    }

    /// Replaces the structured-output settings.
    #[must_use]
    pub fn with_structured_output(mut self, structured_output: StructuredOutputConfig) -> Self {
        self.structured_output = structured_output;
        self
    }

    /// Checks every stage's settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.conversion.validate()?;
        self.segmentation.validate()?;
        self.structured_output.validate()
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source, path)
    }
}
