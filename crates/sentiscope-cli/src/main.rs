use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sentiscope_contracts::credentials::{Credential, CredentialPool};
use sentiscope_contracts::errors::PipelineError;
use sentiscope_contracts::events::EventWriter;
use sentiscope_contracts::records::Envelope;
use sentiscope_contracts::runs::summary::{now_utc_iso, write_summary};
use sentiscope_contracts::store::{open_store, read_envelopes, JsonStore, OutputFormat};
use sentiscope_engine::normalize::fix_embedded_json;
use sentiscope_engine::providers::DEFAULT_MODEL;
use sentiscope_engine::stats::load_store_stats;
use sentiscope_engine::units::{enumerate_screenshots, units_from_envelopes, WorkUnit};
use sentiscope_engine::{
    AnalysisPipeline, AnalysisProvider, DryrunProvider, GeminiProvider, GenerationSettings,
    PipelineOptions, ResilientInvoker, RetryPolicy,
};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "sentiscope", version, about = "Screenshot sentiment extraction pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze every `<root>/<tweet-id>/*.png` screenshot.
    Analyze(AnalyzeArgs),
    /// Ask the model to rewrite stored raw responses as strict JSON.
    Repair(RepairArgs),
    /// Strip code fences from stored raw responses, offline.
    FixJson(FixJsonArgs),
    /// Flatten a JSON store into the 23-column CSV layout.
    ToCsv(ToCsvArgs),
    /// Summary statistics of a CSV store.
    Stats(StatsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    Gemini,
    Dryrun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Csv => OutputFormat::Csv,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct ModelArgs {
    #[arg(long, value_enum, default_value_t = ProviderKind::Gemini)]
    provider: ProviderKind,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long, default_value_t = 0.3)]
    temperature: f64,
    /// Seconds to wait after every credential has failed once.
    #[arg(long, default_value_t = 30)]
    backoff_secs: u64,
    /// Full passes over the credential pool before a unit is abandoned.
    #[arg(long, default_value_t = 1)]
    cycles: usize,
    #[arg(long, default_value_t = 90)]
    timeout_secs: u64,
    /// Run event log; defaults to `<out>.events.jsonl`.
    #[arg(long)]
    events: Option<PathBuf>,
}

impl ModelArgs {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::from_secs(self.backoff_secs),
            cycles: self.cycles.max(1),
        }
    }

    fn settings(&self) -> GenerationSettings {
        GenerationSettings {
            model: self.model.clone(),
            temperature: self.temperature,
            request_timeout: Duration::from_secs(self.timeout_secs),
            ..GenerationSettings::default()
        }
    }
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    root: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// Defaults to the extension of `--out`.
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
    /// Exemplar image sent ahead of every screenshot.
    #[arg(long)]
    reference: Option<PathBuf>,
    #[arg(long)]
    resume: bool,
    /// Store unnormalized responses (JSON output only).
    #[arg(long)]
    keep_raw: bool,
    /// Send unusable responses back with a correction prompt.
    #[arg(long)]
    repair: bool,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Parser)]
struct RepairArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    resume: bool,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Parser)]
struct FixJsonArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct ToCsvArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    /// Ask the model to convert entries that cannot be flattened locally.
    #[arg(long)]
    model_fallback: bool,
    #[arg(long)]
    resume: bool,
    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Debug, Parser)]
struct StatsArgs {
    #[arg(long)]
    input: PathBuf,
    /// Also write the table as CSV.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sentiscope error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Repair(args) => run_repair(args),
        Command::FixJson(args) => run_fix_json(args),
        Command::ToCsv(args) => run_to_csv(args),
        Command::Stats(args) => run_stats(args),
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let format = resolve_format(args.format, &args.out)?;
    if args.keep_raw && format == OutputFormat::Csv {
        bail!("--keep-raw needs a JSON output");
    }
    if let Some(reference) = &args.reference {
        if !reference.is_file() {
            return Err(PipelineError::StartupConfig(format!(
                "reference image {} not found",
                reference.display()
            ))
            .into());
        }
    }
    let units = enumerate_screenshots(&args.root)?;
    log::info!("{} screenshots under {}", units.len(), args.root.display());

    let mut options = PipelineOptions::new(format);
    options.reference = args.reference.clone();
    options.keep_raw = args.keep_raw;
    options.repair = args.repair;
    options.resume = args.resume;
    let provider = build_provider(&args.model);
    let pool = credential_pool(args.model.provider)?;
    run_pipeline(&args.model, provider, pool, &args.out, options, &units)
}

fn run_repair(args: RepairArgs) -> Result<i32> {
    let units = load_envelope_units(&args.input)?;
    let mut options = PipelineOptions::new(OutputFormat::Json);
    options.repair = true;
    options.resume = args.resume;
    let provider = build_provider(&args.model);
    let pool = credential_pool(args.model.provider)?;
    run_pipeline(&args.model, provider, pool, &args.out, options, &units)
}

fn run_to_csv(args: ToCsvArgs) -> Result<i32> {
    let units = load_envelope_units(&args.input)?;
    let mut options = PipelineOptions::new(OutputFormat::Csv);
    options.repair = args.model_fallback;
    options.resume = args.resume;
    let (provider, pool) = if args.model_fallback {
        (build_provider(&args.model), credential_pool(args.model.provider)?)
    } else {
        // Local conversion never reaches the provider.
        let provider: Box<dyn AnalysisProvider> = Box::new(DryrunProvider::new());
        (provider, offline_pool()?)
    };
    run_pipeline(&args.model, provider, pool, &args.out, options, &units)
}

fn run_fix_json(args: FixJsonArgs) -> Result<i32> {
    let envelopes = read_envelopes(&args.input)?;
    let mut store = JsonStore::open(&args.out, false)?;
    let (fixed, unparsed) = fix_envelopes(&envelopes, &mut store)?;
    println!(
        "Fixed {fixed} of {} responses; {} left as text",
        envelopes.len(),
        unparsed.len()
    );
    for key in &unparsed {
        log::warn!("response for {key} still does not parse");
    }
    println!("Results saved to {}", args.out.display());
    Ok(0)
}

fn run_stats(args: StatsArgs) -> Result<i32> {
    let stats = load_store_stats(&args.input)?;
    print!("{}", stats.render());
    if let Some(out) = &args.out {
        fs::write(out, stats.describe_csv())
            .with_context(|| format!("failed writing {}", out.display()))?;
        println!("Results saved to {}", out.display());
    }
    Ok(0)
}

fn run_pipeline(
    model: &ModelArgs,
    provider: Box<dyn AnalysisProvider>,
    pool: CredentialPool,
    out: &Path,
    options: PipelineOptions,
    units: &[WorkUnit],
) -> Result<i32> {
    let run_id = Uuid::new_v4().to_string();
    let started_at = now_utc_iso();
    let events_path = model
        .events
        .clone()
        .unwrap_or_else(|| out.with_extension("events.jsonl"));
    let events = EventWriter::new(&events_path, &run_id);
    log::info!(
        "run {run_id}: {} via {} with {} credential(s) {:?}",
        model.model,
        provider.name(),
        pool.len(),
        pool.labels()
    );

    let store = open_store(options.format, out, options.resume)?;
    let invoker = ResilientInvoker::new(provider, pool, model.retry_policy(), events.clone());
    let mut pipeline = AnalysisPipeline::new(invoker, store, options, events);
    let report = pipeline.run(units);

    let summary = report.summary(&run_id, &started_at, &now_utc_iso());
    let mut extra = Map::new();
    let provider_name = pipeline.invoker().provider().name().to_string();
    extra.insert("provider".to_string(), Value::String(provider_name));
    extra.insert("model".to_string(), Value::String(model.model.clone()));
    extra.insert("events".to_string(), Value::String(events_path.display().to_string()));
    write_summary(&out.with_extension("summary.json"), &summary, Some(&extra))?;

    println!(
        "{} units: {} written ({} records), {} dropped, {} abandoned, {} already done",
        report.units_total,
        report.units_written + report.units_kept_raw,
        report.records_written,
        report.units_dropped,
        report.units_abandoned,
        report.units_already_done
    );
    if report.pending_flush {
        eprintln!("some results could not be written to {}", out.display());
        return Ok(2);
    }
    println!("Results saved to {}", out.display());
    Ok(0)
}

fn resolve_format(format: Option<FormatArg>, out: &Path) -> Result<OutputFormat> {
    match format {
        Some(format) => Ok(format.into()),
        None => OutputFormat::from_path(out).with_context(|| {
            format!(
                "cannot infer output format from {}; pass --format",
                out.display()
            )
        }),
    }
}

fn build_provider(model: &ModelArgs) -> Box<dyn AnalysisProvider> {
    match model.provider {
        ProviderKind::Gemini => Box::new(GeminiProvider::new(model.settings())),
        ProviderKind::Dryrun => Box::new(DryrunProvider::new()),
    }
}

fn credential_pool(kind: ProviderKind) -> Result<CredentialPool, PipelineError> {
    match kind {
        ProviderKind::Gemini => CredentialPool::from_env(),
        ProviderKind::Dryrun => CredentialPool::from_env().or_else(|_| offline_pool()),
    }
}

fn offline_pool() -> Result<CredentialPool, PipelineError> {
    CredentialPool::new(vec![Credential::new("offline", "")])
}

fn load_envelope_units(path: &Path) -> Result<Vec<WorkUnit>> {
    let envelopes = read_envelopes(path)?;
    log::info!("{} entries in {}", envelopes.len(), path.display());
    Ok(units_from_envelopes(&envelopes))
}

/// Copies every envelope into `store`, replacing raw string responses with
/// their decoded JSON when possible. Returns the number fixed and the
/// `tweet_id/file_name` of responses that still do not decode.
fn fix_envelopes(envelopes: &[Envelope], store: &mut JsonStore) -> Result<(usize, Vec<String>)> {
    let mut fixed = 0;
    let mut unparsed = Vec::new();
    for envelope in envelopes {
        let mut entry = envelope.clone();
        if let Some(raw) = envelope.raw_text() {
            match fix_embedded_json(raw) {
                Some(value) => {
                    entry.response = value;
                    fixed += 1;
                }
                None => unparsed.push(format!("{}/{}", envelope.tweet_id, envelope.file_name)),
            }
        }
        store.push(entry)?;
    }
    Ok((fixed, unparsed))
}
