use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "insights",
    version,
    about = "Structural insights over analyzed runs",
    after_help = r#"Examples:
  insights load --db runs.sqlite --graph-db graph.sqlite --bundle run-43.json
  insights serve --db runs.sqlite --graph-db graph.sqlite --run 43
  insights request --db runs.sqlite --method resources/list
  insights request --db runs.sqlite --method resources/read --params '{"uri":"insights://runs/43/critical-files"}'
  insights rebuild-graph --db runs.sqlite --graph-db graph.sqlite --run 43
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve Content-Length framed JSON-RPC over stdin/stdout.
    Serve {
        #[arg(long, default_value = "insights.sqlite")]
        db: PathBuf,
        /// Optional graph store; graph queries fall back to relational rows without it.
        #[arg(long)]
        graph_db: Option<PathBuf>,
        /// Run to answer about by default (latest run when omitted).
        #[arg(long)]
        run: Option<i64>,
    },
    /// Persist a JSON run bundle and print the ingest report.
    Load {
        #[arg(long, default_value = "insights.sqlite")]
        db: PathBuf,
        #[arg(long)]
        graph_db: Option<PathBuf>,
        #[arg(long, value_name = "PATH")]
        bundle: PathBuf,
    },
    /// Run a single request and exit.
    Request {
        #[arg(long, default_value = "insights.sqlite")]
        db: PathBuf,
        #[arg(long)]
        graph_db: Option<PathBuf>,
        #[arg(long)]
        run: Option<i64>,
        #[arg(long)]
        method: String,
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, value_name = "PATH")]
        params_file: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        id: String,
    },
    /// Re-mirror a run's edges from the relational store into the graph store.
    RebuildGraph {
        #[arg(long, default_value = "insights.sqlite")]
        db: PathBuf,
        #[arg(long)]
        graph_db: Option<PathBuf>,
        #[arg(long)]
        run: i64,
    },
}
