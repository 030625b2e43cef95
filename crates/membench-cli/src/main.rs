mod config;
mod perf;
mod runner;
mod signal;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use membench_core::{
    aggregate, BackendMode, Dataset, Oracle, RetrievalConfig, RunStatus, FULL_CONTEXT_TECHNIQUE,
};
use membench_http::{ChatClient, Mem0Client};
use membench_store::layout::SCORES_CSV_FILE;
use membench_store::{read_evaluation_metrics, write_text_atomic};

use crate::config::Config;
use crate::perf::{PerformanceEvaluator, RankingKey};
use crate::runner::{ingest_dataset, CancelFlag, Collaborators, ExperimentRunner, RunConfig};

#[derive(Parser)]
#[command(
    name = "membench",
    version,
    about = "Benchmark harness for conversational memory retrieval"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation; several top-k values compare configurations
    Run {
        /// Dataset file (LoCoMo-style JSON)
        #[arg(long)]
        data_file: PathBuf,

        /// Parent directory for run directories
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Fragments retrieved per speaker (comma-separated for a comparison)
        #[arg(long, default_value = "10")]
        top_k: String,

        /// Query the graph-augmented backend
        #[arg(long)]
        graph: bool,

        /// Ask the backend to filter memories
        #[arg(long)]
        filter_memories: bool,

        /// Concurrent question workers
        #[arg(long)]
        workers: Option<usize>,

        /// Continue an interrupted run directory
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Add the conversations to the memory service first
        #[arg(long)]
        ingest: bool,

        /// Technique label used in names and ids (comma-separated to compare;
        /// `full-context` answers from the whole conversation)
        #[arg(long)]
        technique: Option<String>,

        /// Metric used to rank configurations
        #[arg(long, value_enum, default_value_t = RankingKey::LlmJudge)]
        rank_by: RankingKey,

        /// Items between checkpoints
        #[arg(long)]
        checkpoint_every: Option<usize>,

        /// Answer model (overrides config)
        #[arg(long)]
        model: Option<String>,

        /// Judge model (overrides config)
        #[arg(long)]
        judge_model: Option<String>,

        /// Skip the LLM judge; only lexical metrics are computed
        #[arg(long)]
        no_judge: bool,
    },

    /// Add a dataset to the memory service without evaluating
    Add {
        #[arg(long)]
        data_file: PathBuf,
    },

    /// Rebuild the score table from evaluation_metrics.json
    Scores {
        #[arg(long)]
        input: PathBuf,

        /// CSV destination (default: scores.csv next to the input)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show dataset statistics
    Stats {
        #[arg(long)]
        data_file: PathBuf,
    },

    /// Show active configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data_file,
            output_dir,
            top_k,
            graph,
            filter_memories,
            workers,
            resume,
            ingest,
            technique,
            rank_by,
            checkpoint_every,
            model,
            judge_model,
            no_judge,
        } => {
            let cfg = config::load_config()?;
            let top_ks = parse_top_k(&top_k)?;
            let mode = if graph {
                BackendMode::Graph
            } else {
                BackendMode::Plain
            };
            let techniques = parse_list(
                technique.as_deref().unwrap_or(&cfg.run.technique),
                "technique",
            )?;
            let configs = build_configs(&techniques, &top_ks, mode, filter_memories);
            let base = RunConfig {
                retrieval: configs[0].clone(),
                data_file,
                output_dir: output_dir.unwrap_or_else(|| PathBuf::from(&cfg.run.output_dir)),
                workers: workers.unwrap_or(cfg.run.workers),
                checkpoint_every: checkpoint_every.unwrap_or(cfg.run.checkpoint_every),
                ingest,
                resume,
                add_batch_size: cfg.memory.add_batch_size,
                bleu_max_n: cfg.run.bleu_max_n,
            };
            let models = Models {
                answer: model,
                judge: judge_model,
                judge_enabled: !no_judge,
            };
            let ok = if configs.len() > 1 {
                if base.resume.is_some() {
                    bail!("--resume works on a single run directory; pass one technique and top-k");
                }
                cmd_compare(&cfg, base, models, &configs, rank_by)?
            } else {
                cmd_run(&cfg, base, models)?
            };
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Add { data_file } => cmd_add(&data_file)?,
        Commands::Scores { input, output } => cmd_scores(&input, output)?,
        Commands::Stats { data_file } => cmd_stats(&data_file)?,
        Commands::Config => cmd_config()?,
    }

    Ok(())
}

fn parse_list(raw: &str, what: &str) -> Result<Vec<String>> {
    let mut values: Vec<String> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if !values.iter().any(|v| v == part) {
            values.push(part.to_string());
        }
    }
    if values.is_empty() {
        bail!("no {what} given");
    }
    Ok(values)
}

/// One configuration per technique and top-k. `full-context` retrieves
/// nothing, so it appears once whatever the top-k list.
fn build_configs(
    techniques: &[String],
    top_ks: &[usize],
    mode: BackendMode,
    filter_memories: bool,
) -> Vec<RetrievalConfig> {
    let mut configs = Vec::new();
    for technique in techniques {
        if technique == FULL_CONTEXT_TECHNIQUE {
            configs.push(RetrievalConfig::full_context());
            continue;
        }
        for &k in top_ks {
            let mut c = RetrievalConfig::new(technique.clone(), k).with_mode(mode);
            c.filter_memories = filter_memories;
            configs.push(c);
        }
    }
    configs
}

fn parse_top_k(raw: &str) -> Result<Vec<usize>> {
    let mut values = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let k: usize = part
            .parse()
            .with_context(|| format!("invalid top-k value: {part}"))?;
        if k == 0 {
            bail!("top-k must be at least 1");
        }
        if !values.contains(&k) {
            values.push(k);
        }
    }
    if values.is_empty() {
        bail!("no top-k value given");
    }
    Ok(values)
}

/// Model choices from the command line.
struct Models {
    answer: Option<String>,
    judge: Option<String>,
    judge_enabled: bool,
}

/// Live clients for one invocation.
struct Clients {
    backend: Mem0Client,
    answerer: ChatClient,
    judge: Option<ChatClient>,
    policy: membench_core::BackoffPolicy,
}

impl Clients {
    fn build(cfg: &Config, models: &Models) -> Self {
        let backend = Mem0Client::new(
            &cfg.memory.base_url,
            Duration::from_secs(cfg.memory.timeout_secs),
        );
        let answer_model = models.answer.as_deref().unwrap_or(&cfg.oracle.model);
        let answerer = ChatClient::new(
            &cfg.oracle.base_url,
            answer_model,
            cfg.oracle.api_key(),
            cfg.oracle.max_tokens,
            Duration::from_secs(cfg.oracle.timeout_secs),
        );
        let judge = models.judge_enabled.then(|| {
            let judge_model = models
                .judge
                .as_deref()
                .or(cfg.oracle.judge_model.as_deref())
                .unwrap_or(answer_model);
            answerer.with_model(judge_model)
        });
        Self {
            backend,
            answerer,
            judge,
            policy: cfg.retry.policy(),
        }
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            backend: &self.backend,
            answerer: &self.answerer,
            judge: self.judge.as_ref().map(|j| j as &dyn Oracle),
            policy: &self.policy,
        }
    }
}

fn cmd_run(cfg: &Config, run_config: RunConfig, models: Models) -> Result<bool> {
    let clients = Clients::build(cfg, &models);
    let cancel = CancelFlag::new();
    signal::install(&cancel);

    eprintln!(
        "Running {} on {} ({} workers)",
        run_config.retrieval,
        run_config.data_file.display(),
        run_config.workers
    );
    let outcome = ExperimentRunner::new(&run_config, clients.collaborators(), cancel).run()?;

    println!("{}", outcome.report.render_table());
    let counts = &outcome.metadata.counts;
    println!(
        "questions: {}  scored: {}  excluded: {}  failed: {}  unjudged: {}",
        counts.questions, counts.scored, counts.excluded, counts.failed, counts.unjudged
    );
    if counts.ingest_failures > 0 {
        println!("ingestion failures: {}", counts.ingest_failures);
    }
    println!("Results: {}", outcome.dir.display());

    if !outcome.succeeded() {
        eprintln!(
            "Run {}: {}",
            outcome.metadata.status,
            outcome.metadata.error.as_deref().unwrap_or("unknown error")
        );
        eprintln!("Resume with: --resume {}", outcome.dir.display());
    }
    Ok(outcome.succeeded())
}

fn cmd_compare(
    cfg: &Config,
    template: RunConfig,
    models: Models,
    configs: &[RetrievalConfig],
    rank_by: RankingKey,
) -> Result<bool> {
    let clients = Clients::build(cfg, &models);
    let cancel = CancelFlag::new();
    signal::install(&cancel);

    eprintln!("Comparing {} configurations", configs.len());
    let summary =
        PerformanceEvaluator::new(template, clients.collaborators(), cancel, rank_by).run(configs)?;

    println!("{}", summary.render_table());
    for c in summary.configs.iter().filter(|c| c.status != RunStatus::Completed) {
        println!(
            "  {} {}: {}",
            c.config_id,
            c.status,
            c.error.as_deref().unwrap_or("")
        );
    }
    println!("Results: {}", summary.dir);
    Ok(summary.all_completed())
}

fn cmd_add(data_file: &Path) -> Result<()> {
    let cfg = config::load_config()?;
    let dataset = Dataset::from_file(data_file)?;
    let backend = Mem0Client::new(
        &cfg.memory.base_url,
        Duration::from_secs(cfg.memory.timeout_secs),
    );
    let policy = cfg.retry.policy();

    eprintln!(
        "Adding {} conversations to {}",
        dataset.conversations.len(),
        cfg.memory.base_url
    );
    let phase = ingest_dataset(&backend, &policy, cfg.memory.add_batch_size, &dataset);
    if phase.failures > 0 {
        bail!(
            "{} of {} conversations failed to ingest",
            phase.failures,
            phase.conversations
        );
    }
    println!(
        "Added {} conversations in {:.1} ms ({:.1} ms avg)",
        phase.conversations,
        phase.total_ms,
        phase.avg_ms.unwrap_or(0.0)
    );
    Ok(())
}

fn cmd_scores(input: &Path, output: Option<PathBuf>) -> Result<()> {
    let results = read_evaluation_metrics(input)?;
    let config_id = results
        .scored
        .first()
        .map(|r| r.config_id.as_str())
        .unwrap_or("unknown");
    let report = aggregate(config_id, &results);

    let output = output.unwrap_or_else(|| {
        input
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SCORES_CSV_FILE)
    });
    write_text_atomic(&output, &report.to_csv())
        .with_context(|| format!("writing {}", output.display()))?;

    println!("{}", report.render_table());
    println!("Wrote {}", output.display());
    Ok(())
}

fn cmd_stats(data_file: &Path) -> Result<()> {
    let dataset = Dataset::from_file(data_file)?;
    let stats = dataset.stats();

    println!("Dataset: {}", dataset.name);
    println!("  fingerprint:   {}", dataset.fingerprint);
    println!("  conversations: {}", stats.conversations);
    println!("  sessions:      {}", stats.sessions);
    println!("  turns:         {}", stats.turns);
    println!("  questions:     {}", stats.questions);
    for (category, count) in &stats.by_category {
        println!("    {:<12} {count}", category.to_string());
    }
    println!(
        "  answer length: min {} / max {} / avg {:.1}",
        stats.answer_len_min, stats.answer_len_max, stats.answer_len_avg
    );
    Ok(())
}

fn cmd_config() -> Result<()> {
    let cfg = config::load_config()?;
    println!("Config: {}", config::show_config_path());
    println!();
    println!("[memory]");
    println!("  base_url = {}", cfg.memory.base_url);
    println!("  timeout_secs = {}", cfg.memory.timeout_secs);
    println!("  add_batch_size = {}", cfg.memory.add_batch_size);
    println!();
    println!("[oracle]");
    println!("  base_url = {}", cfg.oracle.base_url);
    println!(
        "  api_key_env = {} ({})",
        cfg.oracle.api_key_env,
        if cfg.oracle.api_key().is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!("  model = {}", cfg.oracle.model);
    println!("  judge_model = {}", cfg.oracle.judge_model());
    println!("  max_tokens = {}", cfg.oracle.max_tokens);
    println!("  timeout_secs = {}", cfg.oracle.timeout_secs);
    println!();
    println!("[retry]");
    println!("  max_attempts = {}", cfg.retry.max_attempts);
    println!("  base_delay_ms = {}", cfg.retry.base_delay_ms);
    println!("  max_delay_ms = {}", cfg.retry.max_delay_ms);
    println!("  multiplier = {}", cfg.retry.multiplier);
    println!("  jitter = {}", cfg.retry.jitter);
    println!();
    println!("[run]");
    println!("  workers = {}", cfg.run.workers);
    println!("  checkpoint_every = {}", cfg.run.checkpoint_every);
    println!("  output_dir = {}", cfg.run.output_dir);
    println!("  technique = {}", cfg.run.technique);
    println!("  bleu_max_n = {}", cfg.run.bleu_max_n);
    Ok(())
}
