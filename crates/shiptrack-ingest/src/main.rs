//! Shiptrack Ingest - shipment tracking fetch-and-parse tool

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use shiptrack_common::logging::{init_logging, LogConfig, LogLevel};
use shiptrack_ingest::batch::{BatchSet, DEFAULT_BATCH_PREFIX, DEFAULT_CSV_COLUMN};
use shiptrack_ingest::config::PipelineConfig;
use shiptrack_ingest::pipeline::TrackingPipeline;
use shiptrack_ingest::progress::{ConsoleSink, LogSink, ProgressSink};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "shiptrack-ingest")]
#[command(author, version, about = "Fetch and parse shipment tracking events from a partner API")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    partner: PartnerArgs,

    /// Show a progress bar instead of logging progress
    #[arg(long, global = true)]
    progress: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and parse a batch source, then print the run summary
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Also write the run summary to this file
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Fetch stage only: persist raw responses
    Fetch {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Parse stage only, over stored raw responses or the batches of a source
    Parse {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Print the partner URLs a batch source expands to
    Urls {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Args, Debug)]
struct PartnerArgs {
    /// Partner name, used in store paths
    #[arg(long, global = true, env = "SHIPTRACK_PARTNER")]
    partner: Option<String>,

    /// Endpoint template; `{ids}` is replaced by the joined identifiers
    #[arg(long, global = true, env = "SHIPTRACK_URL_TEMPLATE")]
    url_template: Option<String>,

    /// Workers per stage
    #[arg(long, global = true, env = "SHIPTRACK_WORKERS")]
    workers: Option<usize>,

    /// Maximum identifiers per request
    #[arg(long, global = true, env = "SHIPTRACK_IDS_PER_REQUEST")]
    ids_per_request: Option<usize>,

    /// Separator between identifiers in a URL
    #[arg(long, global = true, env = "SHIPTRACK_ID_SEPARATOR")]
    id_separator: Option<String>,

    /// Retries for transient fetch failures
    #[arg(long, global = true, env = "SHIPTRACK_MAX_RETRIES")]
    max_retries: Option<u32>,

    #[arg(long, global = true, env = "SHIPTRACK_BACKOFF_BASE_MS")]
    backoff_base_ms: Option<u64>,

    #[arg(long, global = true, env = "SHIPTRACK_BACKOFF_FACTOR")]
    backoff_factor: Option<f64>,

    #[arg(long, global = true, env = "SHIPTRACK_BACKOFF_MAX_MS")]
    backoff_max_ms: Option<u64>,

    #[arg(long, global = true, env = "SHIPTRACK_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: Option<u64>,

    /// Root directory of the intermediate store
    #[arg(long, global = true, env = "SHIPTRACK_STORE_ROOT")]
    store_root: Option<PathBuf>,

    /// Minimum percentage points between progress reports
    #[arg(long, global = true, env = "SHIPTRACK_PROGRESS_STEP")]
    progress_step: Option<u8>,

    /// Keep raw responses after a successful parse
    #[arg(long, global = true, env = "SHIPTRACK_RETAIN_RAW")]
    retain_raw: Option<bool>,

    /// Fallback datetime formats (chrono syntax), `;`-separated
    #[arg(long, global = true, env = "SHIPTRACK_DATETIME_FORMATS", value_delimiter = ';')]
    datetime_formats: Option<Vec<String>>,
}

impl PartnerArgs {
    fn into_config(self) -> Result<PipelineConfig> {
        let partner = self
            .partner
            .context("partner name is required (--partner or SHIPTRACK_PARTNER)")?;
        let template = self
            .url_template
            .context("URL template is required (--url-template or SHIPTRACK_URL_TEMPLATE)")?;

        let mut config = PipelineConfig::new(partner, template);
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.ids_per_request.is_some() {
            config.ids_per_request = self.ids_per_request;
        }
        if let Some(separator) = self.id_separator {
            config.id_separator = separator;
        }
        if let Some(retries) = self.max_retries {
            config.retry.max_retries = retries;
        }
        if let Some(base) = self.backoff_base_ms {
            config.retry.base_delay_ms = base;
        }
        if let Some(factor) = self.backoff_factor {
            config.retry.factor = factor;
        }
        if let Some(max) = self.backoff_max_ms {
            config.retry.max_delay_ms = max;
        }
        if let Some(timeout) = self.request_timeout_secs {
            config.request_timeout_secs = timeout;
        }
        if let Some(root) = self.store_root {
            config.store_root = root;
        }
        if let Some(step) = self.progress_step {
            config.progress_step = step;
        }
        if let Some(retain) = self.retain_raw {
            config.retain_raw = retain;
        }
        if let Some(formats) = self.datetime_formats {
            config.datetime_formats = formats
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// JSON file mapping batch names to tracking identifiers
    #[arg(long, conflicts_with = "csv")]
    batches: Option<PathBuf>,

    /// CSV file of tracking identifiers, split into batches
    #[arg(long)]
    csv: Option<PathBuf>,

    /// CSV column holding the identifiers
    #[arg(long, default_value = DEFAULT_CSV_COLUMN)]
    column: String,

    /// Identifiers per batch when splitting a CSV file
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Name prefix for batches split from a CSV file
    #[arg(long, default_value = DEFAULT_BATCH_PREFIX)]
    prefix: String,
}

impl SourceArgs {
    fn load(&self) -> Result<Option<BatchSet>> {
        let set = match (&self.batches, &self.csv) {
            (Some(path), _) => BatchSet::from_json_file(path)?,
            (None, Some(path)) => {
                BatchSet::from_csv_file(path, &self.column, &self.prefix, self.batch_size)?
            },
            (None, None) => return Ok(None),
        };
        Ok(Some(set))
    }

    fn require(&self) -> Result<BatchSet> {
        match self.load()? {
            Some(set) => Ok(set),
            None => bail!("a batch source is required (--batches <json> or --csv <file>)"),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
    println!("{}", json);
    Ok(json)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("shiptrack-ingest")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let config = cli.partner.into_config()?;
    let sink: Arc<dyn ProgressSink> = if cli.progress {
        Arc::new(ConsoleSink::new())
    } else {
        Arc::new(LogSink)
    };

    match cli.command {
        Command::Run { source, summary } => {
            let batches = source.require()?;
            let pipeline = TrackingPipeline::new(config)?.with_progress_sink(sink);
            let run = pipeline.run(batches).await;

            let json = print_json(&run)?;
            if let Some(path) = summary {
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write summary to {}", path.display()))?;
                info!(path = %path.display(), "Wrote run summary");
            }
        },
        Command::Fetch { source } => {
            let batches = source.require()?;
            let pipeline = TrackingPipeline::new(config)?.with_progress_sink(sink);
            let report = pipeline.fetch_stage(batches).await;
            print_json(&report)?;
        },
        Command::Parse { source } => {
            let pipeline = TrackingPipeline::new(config)?.with_progress_sink(sink);
            let names = match source.load()? {
                Some(batches) => batches.names(),
                None => pipeline.stored_batches().await?,
            };
            let report = pipeline.parse_stage(names).await;
            print_json(&report)?;
        },
        Command::Urls { source } => {
            let batches = source.require()?;
            let pipeline = TrackingPipeline::new(config)?;
            for batch in batches.iter() {
                match pipeline.url_builder().requests_for(batch) {
                    Ok(requests) => {
                        for request in requests {
                            println!("{}\t{}", request.batch_name, request.url);
                        }
                    },
                    Err(e) => eprintln!("{}\t{}", batch.name(), e),
                }
            }
        },
    }

    Ok(())
}
