//! Command-line entry point.
//!
//! `reengage run`    — execute one evaluation pass and exit
//! `reengage serve`  — run the cron scheduler loop in the foreground
//! `reengage status` — print at-risk counts and the next scheduled run

use std::path::PathBuf;
use std::process::ExitCode;

use reengage::config::{load_config, EngineConfig};
use reengage::db::EngineDb;
use reengage::dispatch::{Dispatcher, HttpPushGateway, PushGateway};
use reengage::engine::{run_pass, RunContext};
use reengage::error::EngineError;
use reengage::scheduler::{next_run_time, Scheduler};
use reengage::signals::default_registry;
use reengage::template::PlaceholderRenderer;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("run");

    let result = match command {
        "run" => cmd_run(),
        "serve" => cmd_serve(),
        "status" => cmd_status(),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!("Usage: reengage [run | serve | status]");
}

fn open_db(config: &EngineConfig) -> Result<EngineDb, EngineError> {
    match &config.db_path {
        Some(path) => Ok(EngineDb::open_at(PathBuf::from(path))?),
        None => Ok(EngineDb::open()?),
    }
}

/// One evaluation pass, then exit.
fn cmd_run() -> Result<(), EngineError> {
    let config = load_config()?;
    let db = open_db(&config)?;

    let registry = default_registry();
    let renderer = PlaceholderRenderer;
    let push = config.push_gateway_url.clone().map(HttpPushGateway::new);
    let push_ref: Option<&dyn PushGateway> = push.as_ref().map(|p| p as &dyn PushGateway);

    let ctx = RunContext::new(&registry, &renderer, Dispatcher::new(push_ref));
    let summary = run_pass(&db, &ctx)?;
    println!("{}", summary);
    Ok(())
}

/// Foreground scheduler loop.
fn cmd_serve() -> Result<(), EngineError> {
    let config = load_config()?;
    let db = open_db(&config)?;

    if !config.schedule.enabled {
        log::warn!("Schedule is disabled in config; serve will idle");
    } else {
        log::info!(
            "Serving schedule '{}' ({})",
            config.schedule.cron,
            config.schedule.timezone
        );
    }

    // Current-thread runtime: the engine is synchronous over a single SQLite
    // connection, only the poll timer is async.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| EngineError::Configuration(format!("Failed to build runtime: {}", e)))?;

    let mut scheduler = Scheduler::new(db, config);
    runtime.block_on(scheduler.run());
    Ok(())
}

/// Print per-rule at-risk counts and the next scheduled run.
fn cmd_status() -> Result<(), EngineError> {
    let config = load_config()?;
    let db = open_db(&config)?;

    let counts = db.at_risk_counts().map_err(EngineError::Db)?;
    if counts.is_empty() {
        println!("No users currently above stage 0.");
    } else {
        println!("Users at risk (stage > 0):");
        for (rule_id, count) in counts {
            println!("  {}: {}", rule_id, count);
        }
    }

    if config.schedule.enabled {
        let next = next_run_time(&config.schedule)?;
        println!("Next scheduled pass: {}", next.to_rfc3339());
    } else {
        println!("Schedule: disabled");
    }
    Ok(())
}
