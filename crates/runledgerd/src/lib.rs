use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use runledger_config::{RetentionConfig, RetentionPolicyKind, RunledgerConfig, database_path};
use runledger_core::{RunSelector, Secret};
use runledger_runs::{RetentionPolicy, RunStore};
use runledger_store::KvStore;
use serde::Serialize;
use serde_json::json;

use crate::api::ApiState;
use crate::cli::{CleanupArgs, Commands, ServeArgs};

pub mod api;
pub mod cli;

/// Opens the workspace database; the schema exists once this returns.
pub fn open_run_store(workspace: &Path, config: &RunledgerConfig) -> Result<RunStore> {
    let path = database_path(workspace, config);
    let kv = KvStore::open_sqlite(&path, config.storage.timeout())
        .with_context(|| format!("failed to open run store at {}", path.display()))?;
    Ok(RunStore::new(kv))
}

pub fn retention_policy(config: &RetentionConfig) -> RetentionPolicy {
    match config.policy {
        RetentionPolicyKind::KeepBest => RetentionPolicy::KeepBest,
        RetentionPolicyKind::Tiered => RetentionPolicy::Tiered {
            keep_experimental: config.keep_experimental,
        },
    }
}

pub fn run_command(
    store: &RunStore,
    config: &RunledgerConfig,
    command: &Commands,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Serve(args) => serve_blocking(store.clone(), config, args),
        Commands::Runs => print_json(out, &store.list_runs()),
        Commands::Latest => print_json(
            out,
            &json!({
                "latest_run": store.latest_run_id(),
                "current_run": store.current_run_id(),
            }),
        ),
        Commands::Compare(args) => {
            let run_a = store.resolve_read(&RunSelector::parse(Some(args.run_a.as_str()))?);
            let run_b = store.resolve_read(&RunSelector::parse(Some(args.run_b.as_str()))?);
            print_json(out, &store.compare_runs(&run_a, &run_b))
        }
        Commands::Cleanup(args) => {
            let policy = cleanup_policy(&config.retention, args);
            let report = store.cleanup(policy).context("cleanup failed")?;
            print_json(out, &report)
        }
    }
}

fn cleanup_policy(config: &RetentionConfig, args: &CleanupArgs) -> RetentionPolicy {
    let mut retention = config.clone();
    if let Some(policy) = args.policy {
        retention.policy = policy;
    }
    if let Some(keep) = args.keep_experimental {
        retention.keep_experimental = keep;
    }
    retention_policy(&retention)
}

fn serve_blocking(store: RunStore, config: &RunledgerConfig, args: &ServeArgs) -> Result<()> {
    let bind = match args.bind {
        Some(bind) => bind,
        None => config
            .server
            .bind
            .parse()
            .with_context(|| format!("invalid [server].bind '{}'", config.server.bind))?,
    };

    let secret = Secret::from_env(&config.server.secret_env);
    if secret.is_none() {
        tracing::warn!(
            env = %config.server.secret_env,
            "no API secret set, every protected endpoint will answer 401"
        );
    }
    let state = ApiState::new(
        store,
        config.storage.timeout(),
        secret,
        retention_policy(&config.retention),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build HTTP runtime")?;
    runtime.block_on(api::serve(state, bind))
}

fn print_json<T: Serialize + ?Sized>(out: &mut dyn Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value).context("failed to encode output")?;
    writeln!(out).context("failed to write output")?;
    Ok(())
}
