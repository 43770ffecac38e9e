use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use reqwest::Url;
use tracing_subscriber::EnvFilter;

use biopipeline::analysis;
use biopipeline::app::{AnalysisResponse, App};
use biopipeline::config::{ConfigLoader, ResolvedConfig};
use biopipeline::domain::StoredFilename;
use biopipeline::error::PipelineError;
use biopipeline::fasta;
use biopipeline::fetch::{FastaFetcher, HttpFastaFetcher};
use biopipeline::history::HistoryQuery;
use biopipeline::http;
use biopipeline::output::JsonOutput;

#[derive(Parser)]
#[command(name = "biopipeline")]
#[command(about = "FASTA ingestion service with a hash-chained provenance ledger")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Serve the HTTP API")]
    Serve(ServeArgs),
    #[command(about = "Ingest a local FASTA file")]
    Ingest(IngestArgs),
    #[command(about = "Analyze a local FASTA file without recording it")]
    Analyze(AnalyzeArgs),
    #[command(about = "Print the ledger")]
    Ledger,
    #[command(about = "Verify the ledger hash chain")]
    Verify,
    #[command(about = "Print analysis history")]
    History(HistoryArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[derive(Args)]
struct IngestArgs {
    path: Utf8PathBuf,

    /// Name to store the file under; defaults to the file's own name.
    #[arg(long)]
    filename: Option<String>,
}

#[derive(Args)]
struct AnalyzeArgs {
    path: Utf8PathBuf,
}

#[derive(Args)]
struct HistoryArgs {
    #[arg(long)]
    filename: Option<String>,

    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::NotFound(_)
        | PipelineError::Validation(_)
        | PipelineError::Parse(_)
        | PipelineError::TooLarge(_) => 2,
        PipelineError::Fetch(_) | PipelineError::FetchStatus { .. } => 3,
        PipelineError::ChainIntegrity { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Serve(args) => {
            if let Some(bind) = args.bind {
                config.bind = bind;
            }
            run_serve(&config)
        }
        Commands::Ingest(args) => run_ingest(args, &config),
        Commands::Analyze(args) => run_analyze(args, &config),
        Commands::Ledger => {
            let app = App::open_read_only(&config, NopFetcher)?;
            JsonOutput::print_ledger(&app.ledger()).into_diagnostic()
        }
        Commands::Verify => {
            let app = App::open_read_only(&config, NopFetcher)?;
            let verification = app.verify_ledger();
            JsonOutput::print_verification(&verification).into_diagnostic()?;
            verification.into_result()?;
            Ok(())
        }
        Commands::History(args) => {
            let app = App::open_read_only(&config, NopFetcher)?;
            let query = HistoryQuery {
                filename: args.filename,
                limit: args.limit,
            };
            JsonOutput::print_history(&app.history(&query)).into_diagnostic()
        }
    }
}

fn run_serve(config: &ResolvedConfig) -> miette::Result<()> {
    let fetcher = HttpFastaFetcher::new(&config.fetch)?;
    let app = App::open(config, fetcher)?;

    let verification = app.verify_ledger();
    if let Some(index) = verification.first_broken_index {
        tracing::warn!(index, "ledger failed verification; serving anyway");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    let app = Arc::new(app);
    runtime.block_on(http::serve(
        Arc::clone(&app),
        config.bind,
        config.max_upload_bytes,
        shutdown_signal(),
    ))?;
    drop(runtime);

    match Arc::try_unwrap(app) {
        Ok(app) => app.close()?,
        Err(_) => tracing::warn!("requests still hold the stores; skipping final flush"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn run_ingest(args: IngestArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let content = std::fs::read(args.path.as_std_path())
        .map_err(|_| PipelineError::NotFound(args.path.to_string()))?;
    let raw_name = match args.filename {
        Some(name) => name,
        None => args
            .path
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Validation(format!("{} has no file name", args.path)))?,
    };
    let filename: StoredFilename = raw_name.parse()?;

    let app = App::open(config, NopFetcher)?;
    let outcome = app.ingest(&filename, &content);
    app.close()?;
    JsonOutput::print_ingest(&outcome?).into_diagnostic()
}

fn run_analyze(args: AnalyzeArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let content = std::fs::read(args.path.as_std_path())
        .map_err(|_| PipelineError::NotFound(args.path.to_string()))?;
    let records = fasta::parse(&content)?;
    let analysis = analysis::analyze(&records, config.analysis_unit)?;
    let response = AnalysisResponse {
        filename: args.path.file_name().unwrap_or(args.path.as_str()).to_string(),
        analysis,
    };
    JsonOutput::print_analysis(&response).into_diagnostic()
}

/// Fetcher for commands that never go to the network.
struct NopFetcher;

impl FastaFetcher for NopFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, PipelineError> {
        Err(PipelineError::Fetch(format!(
            "remote fetch of {url} is not available from this command"
        )))
    }
}
