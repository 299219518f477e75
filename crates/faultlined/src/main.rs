use anyhow::{Context, Result};
use faultline_config::{ensure_workspace_config, validate_config};
use faultlined::cli::{Commands, parse_cli};
use faultlined::feedback::{run_dead_letters_command, run_feedback_command, run_improve_command};
use faultlined::ingest::run_ingest_command;
use faultlined::logging::init_tracing;
use faultlined::runtime::run_daemon;
use faultlined::stats::run_stats_command;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);

    std::fs::create_dir_all(&cli.workspace)
        .with_context(|| format!("failed to create workspace {}", cli.workspace.display()))?;
    let workspace = cli
        .workspace
        .canonicalize()
        .with_context(|| format!("invalid workspace path {}", cli.workspace.display()))?;
    let config = ensure_workspace_config(&workspace).context("failed to prepare workspace config")?;
    for warning in validate_config(&config) {
        eprintln!("faultline config warning [{}]: {}", warning.code, warning.message);
    }

    match cli.command {
        Commands::Run(args) => build_runtime()?.block_on(run_daemon(
            &workspace,
            args.provider_overrides(),
            args.query_addr,
        )),
        Commands::Ingest(args) => run_ingest_command(&workspace, args),
        Commands::Stats(args) => run_stats_command(&workspace, args),
        Commands::Improve => build_runtime()?.block_on(run_improve_command(&workspace)),
        Commands::Feedback(args) => run_feedback_command(&workspace, args),
        Commands::DeadLetters(args) => run_dead_letters_command(&workspace, args),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}
