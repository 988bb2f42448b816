//! `kestreld`: wires the reference filesystem loader, the state-tree engine,
//! and the reference plug-ins into one runnable process.
//!
//! `--config <dir>` changes the process working directory to `dir` before
//! anything else starts, so every subsequent relative path (including the
//! loader's own default root) resolves against it, mirroring
//! `pykzee.core.__main__`'s `--config` handling.

use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use kestrel_engine::Engine;
use kestrel_loader::{Loader, LoaderConfig};
use kestrel_plugin::PluginFactoryRegistry;
use kestrel_value::Value;

#[derive(Debug, Parser)]
#[command(name = "kestreld")]
#[command(about = "kestrel state-tree engine daemon")]
struct Cli {
    /// Directory to read as the engine's configuration tree. The process
    /// working directory is changed to this path before startup.
    #[arg(long, default_value = ".")]
    config: std::path::PathBuf,

    /// Quiescence window the loader waits for after a filesystem event
    /// before rereading the configuration tree.
    #[arg(long, value_parser = parse_debounce, default_value = "2s")]
    debounce: Duration,
}

fn parse_debounce(s: &str) -> Result<Duration, String> {
    let secs = s.strip_suffix('s').unwrap_or(s);
    secs.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").compact().init();

    let cli = Cli::parse();
    std::env::set_current_dir(&cli.config)
        .with_context(|| format!("failed to chdir into config directory {}", cli.config.display()))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the tokio runtime")?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(cli.debounce))
}

async fn run(debounce: Duration) -> Result<()> {
    let mut registry = PluginFactoryRegistry::new();
    kestrel_plugins::register_all(&mut registry);
    let engine = Engine::new(registry);

    let loader = Loader::new(LoaderConfig::new(".").debounce(debounce)).context("failed to start config directory watcher")?;

    let initial = loader.read_state_from_disk().await.context("failed to read initial configuration tree")?;
    engine.set_raw_state(initial).context("initial configuration tree is not a JSON mapping")?;

    let update_loop = tokio::task::spawn_local(engine.clone().run());

    let loader_engine = engine.clone();
    let loader_task = tokio::task::spawn_local(async move {
        loader
            .run(move |value: Value| {
                if let Err(err) = loader_engine.set_raw_state(value) {
                    tracing::warn!(%err, "reread configuration tree rejected");
                }
            })
            .await;
    });

    // Logs a line per dispatched update to the resolved root, so an operator
    // running `kestreld` interactively can see the engine live.
    let _root_subscription = engine
        .subscribe(
            None,
            vec![(kestrel_value::Path::root(), kestrel_index::StateType::Resolved)],
            Rc::new(|values| {
                tracing::info!(root = ?values[0].as_ref().map(Value::to_json), "resolved state updated");
            }),
            true,
        )
        .expect("root subscription is never registered by a disabled plug-in");

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, stopping");
    update_loop.abort();
    loader_task.abort();
    Ok(())
}
