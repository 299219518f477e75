use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use faultline_config::InferenceProviderKind;
use faultline_infer::ProviderOverrides;
use faultline_store::QueueName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsOutputFormat {
    #[default]
    Table,
    Json,
}

impl StatsOutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for StatsOutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid output format '{other}', expected one of: table, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RunArgs {
    #[arg(
        long,
        help = "Serve the read-only query API on this address (example: 127.0.0.1:7878)"
    )]
    pub query_addr: Option<SocketAddr>,

    #[arg(long, value_parser = parse_inference_provider)]
    pub inference_provider: Option<InferenceProviderKind>,

    #[arg(long)]
    pub inference_model: Option<String>,

    #[arg(long)]
    pub inference_endpoint: Option<String>,

    #[arg(long)]
    pub inference_api_key_env: Option<String>,
}

impl RunArgs {
    pub fn provider_overrides(&self) -> ProviderOverrides {
        ProviderOverrides {
            provider: self.inference_provider,
            model: self.inference_model.clone(),
            endpoint: self.inference_endpoint.clone(),
            api_key_env: self.inference_api_key_env.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct IngestArgs {
    #[arg(
        long,
        help = "JSON-lines file of ingest records or producer payloads; stdin when omitted"
    )]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct StatsArgs {
    #[arg(long, help = "Restrict the report to one namespace key")]
    pub namespace: Option<String>,

    #[arg(long, help = "Sliding window in seconds (defaults to [drift].window_secs)")]
    pub window_secs: Option<u64>,

    #[arg(
        long,
        default_value = "table",
        value_parser = parse_stats_output_format,
        help = "Output format: table or json"
    )]
    pub output: StatsOutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct FeedbackArgs {
    #[arg(long, help = "Alert that was misclassified")]
    pub alert_id: String,

    #[arg(long, help = "Category the alert should have had")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct DeadLettersArgs {
    #[arg(
        long,
        default_value = "enrich_retry",
        value_parser = parse_queue_name,
        help = "Queue whose dead letters are listed"
    )]
    pub queue: QueueName,

    #[arg(long, default_value_t = 50, help = "Maximum records (clamped to 1..10000)")]
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Run every pipeline stage until ctrl-c
    Run(RunArgs),
    /// Enqueue JSON-lines log records on the logs queue
    Ingest(IngestArgs),
    /// Print per-namespace cluster quality and drift
    Stats(StatsArgs),
    /// Run one prototype improvement pass and print its report
    Improve,
    /// Record a misclassified alert for the next improvement pass
    Feedback(FeedbackArgs),
    /// List dead-lettered items of one queue
    DeadLetters(DeadLettersArgs),
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "FAULTLINE telemetry clustering daemon")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .faultline/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_inference_provider(value: &str) -> Result<InferenceProviderKind, String> {
    value.parse()
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_stats_output_format(value: &str) -> Result<StatsOutputFormat, String> {
    value.parse()
}

fn parse_queue_name(value: &str) -> Result<QueueName, String> {
    value.parse()
}
