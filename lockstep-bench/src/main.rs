use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, Style, Table};
use lockstep_core::{
    initialize_logging, AdapterRegistry, EngineBuilder, EngineConfig, EngineHandle, LocalFabric,
    Request, Response, SamplingParams, SimulatedModel, Usage,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about = "Drive the serving core against a simulated replica group", long_about = None)]
struct Args {
    /// TOML file with an engine configuration. Flags given explicitly override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of tensor-parallel replicas to simulate.
    #[arg(long, default_value_t = 1)]
    replicas: usize,

    /// Number of requests to submit.
    #[arg(long, short = 'n', default_value_t = 32)]
    requests: usize,

    /// Shortest random prompt.
    #[arg(long, default_value_t = 8)]
    min_prompt_len: usize,

    /// Longest random prompt.
    #[arg(long, default_value_t = 256)]
    max_prompt_len: usize,

    /// Number of tokens to generate per request.
    #[arg(long, short = 'g', default_value_t = 64)]
    n_gen: usize,

    /// Sampling temperature. Greedy when omitted.
    #[arg(long)]
    temperature: Option<f64>,

    /// Integer seed to ensure reproducible random number generation.
    #[arg(short, long)]
    seed: Option<u64>,

    #[arg(long)]
    num_blocks: Option<usize>,

    #[arg(long)]
    block_size: Option<usize>,

    #[arg(long)]
    max_batch_tokens: Option<usize>,

    #[arg(long)]
    max_num_seqs: Option<usize>,

    /// Log throughput periodically while the bench runs.
    #[arg(long, default_value_t = false)]
    throughput_log: bool,
}

/// Model geometry of the simulated replicas, read from the `[model]` table of
/// the config file.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ModelSection {
    vocab_size: usize,
    hidden_size: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            vocab_size: 32_768,
            hidden_size: 64,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BenchFile {
    engine: EngineConfig,
    model: ModelSection,
}

fn load_config(args: &Args) -> anyhow::Result<BenchFile> {
    let mut file = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => BenchFile::default(),
    };
    let engine = &mut file.engine;
    if let Some(seed) = args.seed {
        engine.seed = seed;
    }
    if let Some(num_blocks) = args.num_blocks {
        engine.cache.num_blocks = num_blocks;
    }
    if let Some(block_size) = args.block_size {
        engine.cache.block_size = block_size;
    }
    if let Some(max_batch_tokens) = args.max_batch_tokens {
        engine.scheduler.max_batch_tokens = max_batch_tokens;
    }
    if let Some(max_num_seqs) = args.max_num_seqs {
        engine.scheduler.max_num_seqs = max_num_seqs;
    }
    engine.throughput_logging |= args.throughput_log;
    Ok(file)
}

#[derive(Default)]
struct Outcome {
    usages: Vec<Usage>,
    errored: usize,
    cancelled: usize,
    streamed: usize,
}

async fn collect(
    handle: &EngineHandle,
    prompts: Vec<Vec<u32>>,
    params: SamplingParams,
) -> anyhow::Result<Outcome> {
    let mut streams = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let submission = handle.submit(Request::new(prompt, params.clone()))?;
        streams.push(tokio::spawn(async move {
            let mut rx = submission.responses;
            let mut streamed = 0;
            while let Some(response) = rx.recv().await {
                match response {
                    Response::Tokens { tokens, .. } => streamed += tokens.len(),
                    terminal => return (streamed, Some(terminal)),
                }
            }
            (streamed, None)
        }));
    }

    let mut outcome = Outcome::default();
    for stream in streams {
        let (streamed, terminal) = stream.await?;
        outcome.streamed += streamed;
        match terminal {
            Some(Response::Done { usage, .. }) => outcome.usages.push(usage),
            Some(Response::Cancelled { .. }) => outcome.cancelled += 1,
            Some(Response::Error { id, error }) => {
                warn!("Request {id} failed: {error}");
                outcome.errored += 1;
            }
            Some(Response::Tokens { .. }) | None => outcome.errored += 1,
        }
    }
    Ok(outcome)
}

fn print_summary(args: &Args, handle: &EngineHandle, outcome: &Outcome, elapsed: Duration) {
    let stats = handle.stats();
    let cache = handle.kv_cache_info();
    let prompt_tokens: usize = outcome.usages.iter().map(|u| u.prompt_tokens).sum();
    let mean_ttft = if outcome.usages.is_empty() {
        0.
    } else {
        outcome.usages.iter().map(|u| u.time_to_first_token_sec).sum::<f32>()
            / outcome.usages.len() as f32
    };
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let rows = vec![vec![
        args.replicas.cell().justify(Justify::Right),
        args.requests.cell().justify(Justify::Right),
        outcome.usages.len().cell().justify(Justify::Right),
        outcome.errored.cell().justify(Justify::Right),
        outcome.cancelled.cell().justify(Justify::Right),
        prompt_tokens.cell().justify(Justify::Right),
        outcome.streamed.cell().justify(Justify::Right),
        format!("{:.1}", outcome.streamed as f64 / secs)
            .cell()
            .justify(Justify::Right),
        format!("{:.1}", 1000. * mean_ttft).cell().justify(Justify::Right),
        stats.preemptions.cell().justify(Justify::Right),
        stats.iterations.cell().justify(Justify::Right),
        format!("{:.1}%", 100. * cache.utilization())
            .cell()
            .justify(Justify::Right),
    ]];
    let table = rows
        .table()
        .title(vec![
            "replicas".cell().bold(true),
            "requests".cell().bold(true),
            "done".cell().bold(true),
            "errored".cell().bold(true),
            "cancelled".cell().bold(true),
            "prompt tok".cell().bold(true),
            "gen tok".cell().bold(true),
            "gen t/s".cell().bold(true),
            "ttft ms".cell().bold(true),
            "preemptions".cell().bold(true),
            "iterations".cell().bold(true),
            "kv used".cell().bold(true),
        ])
        .bold(true);
    if let Err(e) = print_stdout(table) {
        warn!("Cannot print summary: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    anyhow::ensure!(args.replicas > 0, "--replicas must be positive");
    anyhow::ensure!(
        args.min_prompt_len > 0 && args.min_prompt_len <= args.max_prompt_len,
        "prompt length range is empty"
    );
    let BenchFile { engine: config, model } = load_config(&args)?;
    config.validate()?;
    anyhow::ensure!(
        model.vocab_size % args.replicas == 0,
        "vocab size {} cannot be split across {} replicas",
        model.vocab_size,
        args.replicas
    );

    let fabric = LocalFabric::new(args.replicas, config.sync_timeout());
    let sim = Arc::new(SimulatedModel::new(model.vocab_size, model.hidden_size, config.seed));
    let adapters = Arc::new(AdapterRegistry::new());
    let mut backends = fabric.backends(sim).into_iter();
    let leader_backend = backends
        .next()
        .context("replica group has no rank 0")?;
    let followers = backends
        .map(|backend| {
            EngineBuilder::new(backend)
                .with_config(config.clone())
                .with_adapters(adapters.clone())
                .spawn()
        })
        .collect::<Result<Vec<_>, _>>()?;
    let leader = EngineBuilder::new(leader_backend)
        .with_config(config.clone())
        .with_adapters(adapters)
        .spawn()?;
    info!(
        "Running {} requests on {} replicas ({} cache blocks of {} tokens).",
        args.requests, args.replicas, config.cache.num_blocks, config.cache.block_size
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let prompts: Vec<Vec<u32>> = (0..args.requests)
        .map(|_| {
            let len = rng.gen_range(args.min_prompt_len..=args.max_prompt_len);
            (0..len)
                .map(|_| rng.gen_range(0..model.vocab_size as u32))
                .collect()
        })
        .collect();
    let params = SamplingParams {
        temperature: args.temperature,
        max_new_tokens: Some(args.n_gen),
        ..Default::default()
    };

    let start = Instant::now();
    let outcome = collect(&leader, prompts, params).await?;
    let elapsed = start.elapsed();
    print_summary(&args, &leader, &outcome, elapsed);

    let fatal = leader.last_fatal();
    leader.shutdown()?;
    for follower in &followers {
        follower.join()?;
    }
    if let Some(e) = fatal {
        anyhow::bail!("engine stopped on a fatal error: {e}");
    }
    Ok(())
}
