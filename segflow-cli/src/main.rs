use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use segflow::adapters::{ConversionAdapter, SegmentationAdapter, StageSelector, StructuredOutputAdapter};
use segflow::config::{validate_timeout, PipelineConfig};
use segflow::errors::{StageError, EXIT_UNEXPECTED_FAILURE};
use segflow::events::{logging_sink, LoggingEventSink, SharedEventSink};
use segflow::pipeline::PipelineDriver;
use segflow::process::{CommandRunner, TokioCommandRunner};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "segflow", version, about = "DICOM to spine segmentation to DICOM SEG pipeline")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert a DICOM study directory to NIfTI volumes
    Convert {
        input_dir: PathBuf,
        output_dir: PathBuf,
        /// Write uncompressed .nii files
        #[arg(long)]
        no_compress: bool,
        /// Strip identifying fields from the sidecars
        #[arg(long)]
        anonymize: bool,
        /// Conversion timeout in seconds
        #[arg(long, value_parser = timeout_arg)]
        timeout: Option<f64>,
    },

    /// Run spine segmentation on a NIfTI file or directory
    Segment {
        input_path: PathBuf,
        output_dir: PathBuf,
        /// Run only step 1 (landmarks) or step 2 (full segmentation)
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=2))]
        step_only: Option<u8>,
        /// Model data directory
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Write processing_report.json into the output directory
        #[arg(long)]
        generate_report: bool,
        /// Inference timeout in seconds
        #[arg(long, value_parser = timeout_arg)]
        timeout: Option<f64>,
    },

    /// Encode a segmentation volume as a DICOM SEG object
    ToSeg {
        segmentation_file: PathBuf,
        dicom_dir: PathBuf,
        output_file: PathBuf,
        /// JSON file with metadata overrides
        #[arg(long)]
        metadata: Option<PathBuf>,
    },

    /// Run all three stages
    Run {
        dicom_input: PathBuf,
        work_dir: PathBuf,
        final_output: PathBuf,
        /// Model data directory
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Write processing reports
        #[arg(long)]
        generate_report: bool,
    },
}

fn timeout_arg(value: &str) -> Result<f64, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("not a number: {e}"))?;
    validate_timeout("--timeout", seconds).map_err(|e| e.to_string())?;
    Ok(seconds)
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_target(false).with_env_filter(filter).init();
    }
}

fn event_sink(level: &str) -> SharedEventSink {
    match level.to_ascii_lowercase().as_str() {
        "debug" | "trace" => Arc::new(LoggingEventSink::debug()),
        _ => logging_sink(),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::new()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_metadata(path: &Path) -> Result<serde_json::Value> {
    let body = std::fs::read(path).with_context(|| format!("read metadata file {}", path.display()))?;
    serde_json::from_slice(&body).with_context(|| format!("parse metadata file {}", path.display()))
}

async fn execute(cli: Cli, runner: Arc<dyn CommandRunner>, sink: SharedEventSink) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Convert {
            input_dir,
            output_dir,
            no_compress,
            anonymize,
            timeout,
        } => {
            let mut conversion = config.conversion.with_compression(!no_compress);
            if anonymize {
                conversion = conversion.with_anonymize(true);
            }
            if let Some(seconds) = timeout {
                conversion = conversion.with_timeout(seconds);
            }
            conversion.validate()?;
            let adapter = ConversionAdapter::new(conversion, runner, sink);
            adapter.initialize().await?;
            let result = adapter.convert(&input_dir, &output_dir).await?;
            info!(files = result.output_locations.len(), "Conversion completed");
            print_json(&result)?;
        }
        Command::Segment {
            input_path,
            output_dir,
            step_only,
            model_dir,
            generate_report,
            timeout,
        } => {
            let selector = step_only.and_then(StageSelector::from_step).unwrap_or_default();
            if let Some(dir) = model_dir {
                config.segmentation = config.segmentation.with_model_data_dir(dir);
            }
            if let Some(seconds) = timeout {
                config.segmentation = config.segmentation.with_timeout(seconds);
            }
            config.segmentation.validate()?;
            let adapter = SegmentationAdapter::new(config.segmentation, runner, sink);
            adapter.initialize().await?;
            let result = adapter.infer(&input_path, &output_dir, selector).await?;
            if generate_report || config.generate_report {
                if let Err(err) = adapter.generate_report(&result) {
                    warn!(error = %err, "Processing report not written");
                }
            }
            info!(counts = ?result.file_counts(), "Segmentation completed");
            print_json(&result)?;
        }
        Command::ToSeg {
            segmentation_file,
            dicom_dir,
            output_file,
            metadata,
        } => {
            let overrides = metadata.as_deref().map(read_metadata).transpose()?;
            let adapter = StructuredOutputAdapter::new(config.structured_output, runner, sink);
            adapter.initialize().await?;
            let result = adapter
                .convert(&segmentation_file, &dicom_dir, &output_file, overrides.as_ref())
                .await?;
            info!(output = %output_file.display(), "DICOM SEG created");
            print_json(&result)?;
        }
        Command::Run {
            dicom_input,
            work_dir,
            final_output,
            model_dir,
            generate_report,
        } => {
            if let Some(dir) = model_dir {
                config.segmentation = config.segmentation.with_model_data_dir(dir);
            }
            if generate_report {
                config = config.with_report(true);
            }
            let driver = PipelineDriver::new(config, runner, sink);
            driver.initialize().await?;
            let result = driver.run(&dicom_input, &work_dir, &final_output).await;
            if let Some(warning) = &result.report_warning {
                warn!(%warning, "Processing report not written");
            }
            print_json(&result)?;
            let result = result.into_result()?;
            info!(
                run_id = %result.run_id,
                elapsed_seconds = result.elapsed.as_secs_f64(),
                "Pipeline completed"
            );
        }
    }

    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<StageError>()
        .map_or(EXIT_UNEXPECTED_FAILURE, StageError::exit_code)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);
    let sink = event_sink(&cli.log_level);

    match execute(cli, Arc::new(TokioCommandRunner), sink).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_for(&err);
            error!(exit_code = code, "{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::from(code)
        }
    }
}
