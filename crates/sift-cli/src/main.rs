use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sift_client::{HtmdDistiller, HtmlImageCollector, HtmlSignalExtractor, OpenAiHydrator};
use sift_core::error::AppError;
use sift_core::models::{Document, HydrationRequest};
use sift_core::traits::Hydrator;
use sift_core::{
    DirectoryCorpus, DocumentProcessor, Orchestrator, PipelineConfig, RecordSchema,
    TracingRunReporter,
};

#[derive(Parser)]
#[command(name = "sift", version, about = "Structured product extraction from saved HTML pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a product record from every HTML page in a directory
    Run {
        /// Directory of saved *.html / *.htm pages
        #[arg(short, long, default_value = "data")]
        input: PathBuf,

        /// Write the full run report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write successful products, each tagged with its document id
        #[arg(long)]
        export: Option<PathBuf>,

        /// Path to a JSON Schema file for records (defaults to the built-in product schema)
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// LLM model to use (e.g., "gpt-4o-mini", "google/gemini-2.5-flash-lite")
        #[arg(short, long, env = "SIFT_MODEL")]
        model: String,

        /// OpenAI-compatible API base URL
        #[arg(
            short,
            long,
            env = "SIFT_BASE_URL",
            default_value = "https://api.openai.com/v1"
        )]
        base_url: String,

        /// API key (reads from SIFT_API_KEY env var if not provided)
        #[arg(short, long, env = "SIFT_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Cancel whatever is still running after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Show what the hydrator would see for one page, without calling it
    Inspect {
        /// Saved HTML page
        file: PathBuf,

        /// Original page URL, used to resolve relative image references
        #[arg(short, long)]
        url: Option<String>,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Maximum documents processed at once
    #[arg(long, env = "SIFT_MAX_CONCURRENCY", default_value_t = 8)]
    max_concurrency: usize,

    /// Per-document hydration deadline in seconds
    #[arg(long, env = "SIFT_HYDRATION_TIMEOUT_SECS", default_value_t = 120)]
    hydration_timeout_secs: u64,

    /// Maximum image candidates handed to the hydrator
    #[arg(long, env = "SIFT_IMAGE_CAP", default_value_t = 8)]
    image_cap: usize,

    /// Minimum pixel area for images with known dimensions
    #[arg(long, env = "SIFT_MIN_IMAGE_AREA", default_value_t = 250_000)]
    min_image_area: u64,

    /// Maximum long-side to short-side ratio for images with known dimensions
    #[arg(long, env = "SIFT_MAX_ASPECT_RATIO", default_value_t = 3.0)]
    max_aspect_ratio: f64,
}

impl PipelineArgs {
    fn config(&self) -> Result<PipelineConfig> {
        let config = PipelineConfig::default()
            .with_max_concurrency(self.max_concurrency)
            .with_hydration_timeout(Duration::from_secs(self.hydration_timeout_secs))
            .with_image_cap(self.image_cap)
            .with_min_image_area(self.min_image_area)
            .with_max_aspect_ratio(self.max_aspect_ratio);
        config.validate().context("Invalid pipeline configuration")?;
        Ok(config)
    }
}

/// Stand-in for `inspect`, which never hydrates.
#[derive(Clone)]
struct NoHydrator;

impl Hydrator for NoHydrator {
    async fn hydrate(&self, _request: &HydrationRequest) -> Result<serde_json::Value, AppError> {
        Err(AppError::Generic("hydration is disabled for inspect".into()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sift=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            output,
            export,
            schema,
            model,
            base_url,
            api_key,
            deadline_secs,
            pipeline,
        } => {
            let config = pipeline.config()?;
            let schema = load_schema(schema.as_deref())?;
            let hydrator = OpenAiHydrator::with_base_url(&api_key, &model, &base_url)
                .and_then(|h| h.with_timeout(config.hydration_timeout))
                .context("Failed to create LLM client")?;

            let processor = DocumentProcessor::new(
                HtmlSignalExtractor::new(),
                HtmdDistiller::new(),
                HtmlImageCollector::new(),
                hydrator,
                schema,
                &config,
            );
            let orchestrator = Orchestrator::new(processor, &config);
            let cancel = cancel_on_signal(deadline_secs.map(Duration::from_secs));

            tracing::info!(input = %input.display(), %model, "Starting run");
            let report = orchestrator
                .run_until(&DirectoryCorpus::new(&input), cancel, &TracingRunReporter)
                .await
                .with_context(|| format!("Failed to enumerate {}", input.display()))?;

            match &output {
                Some(path) => write_json(path, &report)?,
                None => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if let Some(path) = &export {
                let products = report.products();
                write_json(path, &products)?;
                tracing::info!(path = %path.display(), products = products.len(), "Exported products");
            }

            let retry = report.retry_candidates();
            if !retry.is_empty() {
                tracing::info!(documents = ?retry, "Documents worth retrying");
            }
            tracing::info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                "Run complete"
            );
        }
        Commands::Inspect {
            file,
            url,
            pipeline,
        } => {
            let config = pipeline.config()?;
            let processor = DocumentProcessor::new(
                HtmlSignalExtractor::new(),
                HtmdDistiller::new(),
                HtmlImageCollector::new(),
                NoHydrator,
                RecordSchema::product()?,
                &config,
            );

            let mut document = Document::from_file(&file);
            if let Some(url) = url {
                document = document.with_url(url);
            }
            let unit = processor
                .prepare(&document)
                .await
                .with_context(|| format!("Failed to inspect {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&unit)?);
        }
    }

    Ok(())
}

fn load_schema(path: Option<&Path>) -> Result<RecordSchema> {
    let schema = match path {
        Some(path) => RecordSchema::from_file(path)?,
        None => RecordSchema::product()?,
    };
    tracing::debug!(schema = %schema.name, "Loaded record schema");
    Ok(schema)
}

/// Token cancelled on Ctrl-C or when the optional deadline passes.
fn cancel_on_signal(deadline: Option<Duration>) -> CancellationToken {
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling outstanding documents");
            on_signal.cancel();
        }
    });

    if let Some(deadline) = deadline {
        let on_deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tracing::warn!(?deadline, "Deadline reached, cancelling outstanding documents");
            on_deadline.cancel();
        });
    }

    cancel
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_defaults() {
        let cli = Cli::try_parse_from(["sift", "run", "--model", "m", "--api-key", "k"]).unwrap();
        match cli.command {
            Commands::Run {
                input, pipeline, ..
            } => {
                assert_eq!(input, PathBuf::from("data"));
                let config = pipeline.config().unwrap();
                assert_eq!(config.max_concurrency, 8);
                assert_eq!(config.hydration_timeout, Duration::from_secs(120));
                assert_eq!(config.image_policy.max_candidates, 8);
            }
            Commands::Inspect { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let cli = Cli::try_parse_from(["sift", "inspect", "page.html", "--max-concurrency", "0"])
            .unwrap();
        match cli.command {
            Commands::Inspect { pipeline, .. } => assert!(pipeline.config().is_err()),
            Commands::Run { .. } => panic!("expected inspect"),
        }
    }

    #[test]
    fn test_write_json_creates_parent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out/products.json");
        write_json(&path, &serde_json::json!([{"id": "mug"}])).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written[0]["id"], "mug");
    }
}
