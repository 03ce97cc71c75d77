use anyhow::{Context, Result, bail};
use assess::{ModelInvoker, PromptBuilder, Provider, RetryPolicy, Usage, build_client};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use toe::{AppConfig, OperationMode, ReportFormat, build_orchestrator, load_controls, ocr_engine, write_report};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "toe-review", version, about = "Review control test-of-effectiveness evidence with a language model")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Assess every control in a control sheet and write the report
    Run(RunArgs),
    /// Check that the configured model endpoint answers
    Ping(ModelArgs),
}

#[derive(Args)]
struct ModelArgs {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Preset used for settings the config file leaves out
    #[arg(long, value_enum)]
    mode: Option<OperationMode>,
    #[arg(long, value_parser = parse_provider)]
    provider: Option<Provider>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    model: ModelArgs,
    /// Control sheet (csv, xlsx, xls or ods)
    #[arg(long)]
    controls: PathBuf,
    /// Folder holding one evidence folder per control
    #[arg(long)]
    evidence_root: Option<PathBuf>,
    /// Report path
    #[arg(long, short, default_value = "toe_results.csv")]
    output: PathBuf,
    /// Report format; defaults to the output file extension
    #[arg(long, value_enum)]
    format: Option<ReportFormat>,
    /// Controls processed in parallel
    #[arg(long)]
    concurrency: Option<usize>,
    /// Stop starting new controls after this many seconds
    #[arg(long)]
    batch_timeout: Option<u64>,
    #[arg(long)]
    no_ocr: bool,
    /// Ask the model even when a control has no usable evidence
    #[arg(long)]
    assess_without_evidence: bool,
}

fn parse_provider(s: &str) -> Result<Provider, String> {
    match s.to_ascii_lowercase().as_str() {
        "openai" => Ok(Provider::OpenAi),
        "ollama" => Ok(Provider::Ollama),
        other => Err(format!("unknown provider '{}' (expected openai or ollama)", other)),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ModelArgs) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path, args.mode)?,
        None => AppConfig::preset(args.mode.unwrap_or(OperationMode::Balanced)),
    };
    config.apply_env(|key| std::env::var(key).ok());

    if let Some(provider) = args.provider {
        config.model.provider = provider;
    }
    if let Some(model) = &args.model {
        config.model.model = model.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.model.base_url = base_url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.cmd {
        Cmd::Run(args) => run(args).await,
        Cmd::Ping(args) => ping(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.model)?;
    if let Some(root) = args.evidence_root {
        config.evidence_root = root;
    }
    if let Some(n) = args.concurrency {
        config.concurrency.max_concurrent_controls = n;
    }
    if args.batch_timeout.is_some() {
        config.concurrency.batch_timeout_secs = args.batch_timeout;
    }
    if args.no_ocr {
        config.ocr.enabled = false;
    }
    if args.assess_without_evidence {
        config.assess_without_evidence = true;
    }
    config.validate()?;

    if !config.evidence_root.is_dir() {
        warn!(evidence_root = %config.evidence_root.display(), "Evidence root not found, every control will have no evidence");
    }

    let controls = load_controls(&args.controls)?;
    let model = build_client(&config.model).context("Failed to create model client")?;
    let orchestrator = build_orchestrator(&config, model, ocr_engine(&config.ocr));

    info!(
        mode = ?config.mode,
        provider = ?config.model.provider,
        model = %config.model.model,
        controls = controls.len(),
        "Configuration loaded"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing controls in flight");
                cancel.cancel();
            }
        }
    });

    let batch = orchestrator.run(controls, cancel).await;

    let format = args.format.unwrap_or_else(|| ReportFormat::from_path(&args.output));
    write_report(&args.output, format, &batch)?;

    println!(
        "{} controls: {} success, {} partial, {} failed ({} without evidence)",
        batch.results.len(),
        batch.counts.success,
        batch.counts.partial,
        batch.counts.failed,
        batch.counts.no_evidence
    );
    println!(
        "Model calls: {} ({} retries), tokens: {}, estimated cost: ${:.4}",
        batch.usage.calls, batch.usage.retries, batch.usage.total_tokens, batch.estimated_cost_usd
    );
    println!("Report: {}", args.output.display());

    if batch.cancelled {
        bail!("batch cancelled before every control was processed");
    }
    Ok(())
}

async fn ping(args: ModelArgs) -> Result<()> {
    let config = load_config(&args)?;
    config.validate()?;

    let model = build_client(&config.model).context("Failed to create model client")?;
    let invoker = ModelInvoker::new(
        model,
        RetryPolicy::new(&config.retry),
        1,
        config.request_timeout(),
        Usage::new(),
    );

    let response = invoker
        .invoke(&PromptBuilder::new(config.budget.max_request_chars).ping())
        .await
        .with_context(|| format!("Model endpoint {} did not answer", config.model.base_url))?;

    println!(
        "{} ({}) answered after {} attempt(s): {}",
        config.model.model,
        config.model.base_url,
        response.attempts,
        response.content.trim()
    );
    Ok(())
}
