use anyhow::Result;
use clap::Parser;
use insights::ingest::{RunBundle, ingest_run};
use insights::repository::Repository;
use insights::{cli, mcp};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    // stdout carries protocol frames
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing();

    match args.command {
        cli::Command::Serve { db, graph_db, run } => {
            let mut state = mcp::State::open(&db, graph_db.as_deref(), run)?;
            let cancel = Arc::new(AtomicBool::new(false));
            mcp::serve(&mut state, cancel)
        }
        cli::Command::Load {
            db,
            graph_db,
            bundle,
        } => {
            let bundle = RunBundle::from_path(&bundle)?;
            let repo = Repository::open(&db, graph_db.as_deref())?;
            let report = ingest_run(&repo, &bundle.new_run(), &bundle, &bundle, &bundle)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        cli::Command::Request {
            db,
            graph_db,
            run,
            method,
            params,
            params_file,
            id,
        } => {
            let params_raw = if let Some(path) = params_file {
                std::fs::read_to_string(&path)?
            } else {
                params
            };
            let response = mcp::call(&db, graph_db.as_deref(), run, &method, &params_raw, &id)?;
            println!("{response}");
            Ok(())
        }
        cli::Command::RebuildGraph { db, graph_db, run } => {
            let repo = Repository::open(&db, graph_db.as_deref())?;
            let edges = repo.rebuild_graph(run)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "run_id": run, "edges": edges }))?
            );
            Ok(())
        }
    }
}
