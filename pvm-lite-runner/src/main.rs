//! PVM-Lite runner
//!
//! Loads process definitions from YAML, starts one instance, and drives it
//! until it ends or nothing is left to do. Prints the final execution tree
//! snapshot as JSON.
//!
//! Usage:
//!   cargo run --bin pvm-lite -- \
//!     --definition flows/claims.yaml \
//!     --var amount=1200 \
//!     --var customer='"ACME"' \
//!     --complete-tasks
//!
//! Extra `--definition` files are deployed too, so call activities can
//! resolve their called elements. The first one is started unless
//! `--process` names another key.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::Value;

use pvm_lite_core::authoring::load_definition_file;
use pvm_lite_core::config::EngineConfig;
use pvm_lite_core::engine::Engine;
use pvm_lite_core::hook::NoopHook;
use pvm_lite_core::store_memory::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "pvm-lite")]
#[command(about = "Run a process definition to quiescence and print its execution tree")]
struct Args {
    /// Process definition YAML (can be specified multiple times)
    #[arg(long, short = 'd', required = true)]
    definition: Vec<PathBuf>,

    /// Key of the process to start (default: first definition)
    #[arg(long, short = 'p')]
    process: Option<String>,

    /// Engine config YAML
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Start variables as key=value; values are parsed as JSON, else taken as strings
    #[arg(long, short = 'v', value_parser = parse_key_val)]
    var: Vec<(String, Value)>,

    /// Complete every user/receive task as soon as it waits
    #[arg(long)]
    complete_tasks: bool,

    /// Upper bound on driver rounds
    #[arg(long, default_value_t = 1000)]
    max_rounds: usize,

    /// Also print the history log
    #[arg(long)]
    history: bool,
}

/// Parse key=value pairs from command line
fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: {}", s))?;
    let raw = &s[pos + 1..];
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((s[..pos].to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = Engine::new(Arc::new(MemoryStore::new()), Arc::new(NoopHook), config);

    let mut first_key = None;
    for path in &args.definition {
        let definition = load_definition_file(path)?;
        first_key.get_or_insert_with(|| definition.key.clone());
        engine.deploy(definition).await;
    }
    let key = args
        .process
        .clone()
        .or(first_key)
        .ok_or_else(|| anyhow!("No process definition given"))?;

    let variables: BTreeMap<String, Value> = args.var.iter().cloned().collect();
    let pid = engine.start_instance(&key, variables).await?;

    for round in 0..args.max_rounds {
        let mut progressed = engine.run_due_jobs().await? > 0;

        if args.complete_tasks {
            // one at a time; completing a task may cancel the others
            if let Some((execution, activity)) =
                engine.waiting_executions(pid).await?.into_iter().next()
            {
                tracing::info!(round, activity = %activity, "completing task");
                engine
                    .signal(pid, execution, "complete", Value::Null)
                    .await
                    .with_context(|| format!("Failed to complete {activity}"))?;
                progressed = true;
            }
        }

        let snapshot = engine
            .load(pid)
            .await?
            .ok_or_else(|| anyhow!("Instance {pid} vanished"))?;
        if snapshot.ended {
            tracing::info!(round, "instance ended");
            break;
        }
        if !progressed {
            match engine.next_job_due_in(pid).await? {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => {
                    tracing::info!(round, "instance is waiting for external signals");
                    break;
                }
            }
        }
    }

    let snapshot = engine
        .load(pid)
        .await?
        .ok_or_else(|| anyhow!("Instance {pid} vanished"))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if args.history {
        for event in engine.history(pid).await? {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    let dead = engine.dead_jobs(pid).await?;
    if !dead.is_empty() {
        for d in &dead {
            eprintln!("dead job {} ({}): {}", d.job.job_id, d.job.kind_name(), d.error);
        }
        return Err(anyhow!("{} job(s) exhausted their attempts", dead.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_key_val_json_or_string() {
        assert_eq!(
            parse_key_val("amount=1200").unwrap(),
            ("amount".to_string(), json!(1200))
        );
        assert_eq!(
            parse_key_val("name=ACME").unwrap(),
            ("name".to_string(), json!("ACME"))
        );
        assert_eq!(
            parse_key_val("flags={\"vip\":true}").unwrap(),
            ("flags".to_string(), json!({ "vip": true }))
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_bundled_flow_and_config_load() {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("flows");
        let definition = load_definition_file(&dir.join("claims.yaml")).unwrap();
        assert_eq!(definition.key, "claims");
        let config = EngineConfig::load_from_file(&dir.join("engine.yaml")).unwrap();
        assert!(config.verify_invariants);
        assert_eq!(config.job_batch_size, 16);
    }

    #[tokio::test]
    async fn test_bundled_flow_runs_to_end() {
        let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("flows");
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NoopHook),
            EngineConfig::load_from_file(&dir.join("engine.yaml")).unwrap(),
        );
        engine
            .deploy(load_definition_file(&dir.join("claims.yaml")).unwrap())
            .await;
        let pid = engine.start_instance("claims", BTreeMap::new()).await.unwrap();

        // async score task, then the review
        assert_eq!(engine.run_due_jobs().await.unwrap(), 1);
        engine
            .signal_activity(pid, "review", "complete", json!({ "fraud": false }))
            .await
            .unwrap();

        let snapshot = engine.load(pid).await.unwrap().unwrap();
        assert!(snapshot.ended);
    }
}
