//! Runner Bridge CLI
//!
//! Loads runner bundles and prints their profiles, optionally calling one
//! runner method and printing the decoded result.

use runner_bridge::core::{self, config::CliArgs, ErrorReport};
use runner_bridge::plugin::{EngineOptions, MemoryKeyValueStore, RunnerHandle, RunnerManager};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    let config = match core::Config::load(&cli_args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let logger = match core::Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting Runner Bridge v{}", runner_bridge::VERSION);
    info!(
        runner_dir = ?config.bridge.runner_dir,
        call_timeout_ms = config.bridge.call_timeout_ms,
        ready_timeout_ms = config.bridge.ready_timeout_ms,
        "Bridge configuration"
    );

    let options = EngineOptions::from_config(&config.bridge, Arc::new(MemoryKeyValueStore::new()))?;
    let manager = RunnerManager::new(options, config.bridge.call_timeout());

    let outcome = run(&manager, &cli_args, &config.bridge.runner_dir).await;
    manager.shutdown_all().await;

    if let Err(e) = outcome {
        let report = ErrorReport::from_error(&e);
        error!("{}", report);
        println!("{}", serde_json::to_string_pretty(&report)?);
        drop(logger);
        std::process::exit(1);
    }
    drop(logger);
    Ok(())
}

async fn run(
    manager: &RunnerManager,
    cli_args: &CliArgs,
    runner_dir: &std::path::Path,
) -> runner_bridge::Result<()> {
    let Some(bundle) = &cli_args.bundle else {
        manager.discover(runner_dir).await?;
        for descriptor in manager.descriptors().await {
            print_json(&descriptor)?;
        }
        return Ok(());
    };

    let handle = manager.load(bundle).await?;
    print_json(&handle.profile())?;

    if let Some(method) = &cli_args.call {
        let result = call(&handle, method, &cli_args.args, cli_args.sync).await?;
        print_json(&result)?;
    }
    Ok(())
}

async fn call(handle: &RunnerHandle, method: &str, raw_args: &str, sync: bool) -> runner_bridge::Result<Value> {
    let args: Vec<Value> = serde_json::from_str(raw_args)
        .context("--args must be a JSON array")
        .map_err(|e| runner_bridge::BridgeError::Validation(format!("{:#}", e)))?;

    info!(runner = %handle.id(), method = %method, sync, "Calling runner");
    if sync {
        handle.call_synchronous(method, &args)
    } else {
        handle.call_returning(method, &args).await
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> runner_bridge::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| runner_bridge::BridgeError::Validation(format!("Failed to render output: {}", e)))?;
    println!("{}", text);
    Ok(())
}
