//! `pipeline-runner` — drives one [`attractor_pipeline::Runner`] invocation
//! from the command line.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use attractor_pipeline::{Runner, RunnerConfig};

/// Execute a pipeline graph described by a DOT file.
#[derive(Parser, Debug)]
#[command(name = "pipeline-runner", about = "Run an Attractor pipeline graph to completion")]
struct Cli {
    /// Path to the DOT file describing the pipeline graph.
    dot_file: PathBuf,

    /// Resume an existing run directory instead of starting a fresh one.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Directory under which fresh run directories are created.
    #[arg(long, default_value = "./pipelines")]
    pipelines_dir: PathBuf,

    /// Maximum number of times any single node may be visited before the
    /// run is aborted as a detected loop.
    #[arg(long)]
    max_node_visits: Option<u32>,

    /// JSON file whose top-level object seeds the initial pipeline context.
    #[arg(long)]
    context: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let initial_context: HashMap<String, serde_json::Value> = match &cli.context {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading context file {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing context file {}", path.display()))?
        }
        None => HashMap::new(),
    };

    let mut config = RunnerConfig::new(cli.dot_file, cli.pipelines_dir).with_initial_context(initial_context);
    if let Some(run_dir) = cli.resume {
        config = config.with_resume(run_dir);
    }
    if let Some(max_visits) = cli.max_node_visits {
        config = config.with_max_node_visits(max_visits);
    }

    let checkpoint = Runner::new().run(config).await?;

    let succeeded = checkpoint
        .node_records
        .last()
        .map(|record| {
            record.handler_type == "exit"
                && checkpoint.context.get("$pipeline_outcome") == Some(&serde_json::json!("success"))
        })
        .unwrap_or(false);

    if succeeded {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
