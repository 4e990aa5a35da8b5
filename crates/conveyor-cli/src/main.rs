//! CLI binary for running and validating Conveyor pipelines.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Deterministic pipeline runner for agent workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline from a .dot file
    Run {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,

        /// Source directory copied into the per-run workspace
        #[arg(short, long)]
        workdir: PathBuf,

        /// Parent directory for run directories
        #[arg(short, long)]
        runs_dir: PathBuf,

        /// Run id (defaults to a UTC timestamp)
        #[arg(long)]
        run_id: Option<String>,

        /// Resume the run named by --run-id from its checkpoint
        #[arg(long)]
        resume: bool,
    },

    /// Validate a pipeline .dot file
    Validate {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let level = std::env::var("CONVEYOR_LOG").unwrap_or_else(|_| {
        if verbose {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    });
    let format = std::env::var("CONVEYOR_LOG_FORMAT").unwrap_or_default();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr);
    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            pipeline,
            workdir,
            runs_dir,
            run_id,
            resume,
        } => {
            if resume && run_id.is_none() {
                anyhow::bail!("--run-id is required with --resume");
            }
            let mut cfg = conveyor_pipeline::RunConfig::new(pipeline, workdir, runs_dir);
            cfg.run_id = run_id;
            cfg.resume = resume;
            conveyor_pipeline::run_pipeline(cfg).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Info { pipeline } => {
            cmd_info(&pipeline)?;
        }
    }

    Ok(())
}

fn load_pipeline(path: &std::path::Path) -> anyhow::Result<conveyor_pipeline::PipelineGraph> {
    let source = std::fs::read_to_string(path)?;
    let dot = conveyor_dot::parse(&source)?;
    Ok(conveyor_pipeline::PipelineGraph::from_dot(dot))
}

fn cmd_validate(path: &std::path::Path) -> anyhow::Result<()> {
    let graph = load_pipeline(path)?;
    let diagnostics = conveyor_pipeline::validate(&graph);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            conveyor_pipeline::Severity::Error => {
                has_error = true;
                "ERROR"
            }
            conveyor_pipeline::Severity::Warning => "WARN",
            conveyor_pipeline::Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &std::path::Path) -> anyhow::Result<()> {
    let graph = load_pipeline(path)?;

    println!("Pipeline: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("Goal: {}", graph.goal);
    }
    println!("Nodes: {}", graph.all_nodes().count());
    println!("Edges: {}", graph.all_edges().len());

    if let Some(start) = graph.start_node() {
        println!("Start: {} ({})", start.id, start.label);
    }

    println!("\nNodes:");
    let mut nodes: Vec<_> = graph.all_nodes().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    for node in nodes {
        println!(
            "  {} [{}] shape={} kind={}",
            node.id,
            node.label,
            node.shape,
            node.kind().as_str()
        );
    }

    Ok(())
}
