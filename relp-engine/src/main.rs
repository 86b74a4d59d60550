// relpd: RELP receiver daemon. Prints every received message to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relp_engine::config;
use relp_engine::{DebugSink, Engine, LineConsumer, TracingSink};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relpd", version, about = "Receive syslog messages over RELP")]
struct Cli {
    /// Config file (default: ~/.config/relpd/config.toml, then /etc/relpd/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on; repeat for several listeners
    #[arg(short, long = "port")]
    ports: Vec<String>,

    /// Bind only this address
    #[arg(short, long)]
    address: Option<String>,

    /// Outstanding commands allowed per session
    #[arg(short, long)]
    window: Option<usize>,

    /// Verbose logging, including engine debug output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut cfg = config::load(cli.config.as_deref()).context("loading configuration")?;
    if !cli.ports.is_empty() {
        cfg.listen_ports = cli.ports.clone();
    }
    if cli.address.is_some() {
        cfg.listen_address = cli.address.clone();
    }
    if let Some(window) = cli.window {
        cfg.window_size = window;
    }

    // One worker thread: the engine loop and the signal handler share it.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let session_config = cfg.session_config()?;
        let engine = Arc::new(Engine::new(session_config, Arc::new(LineConsumer::stdout()))?);
        if cli.verbose {
            engine.set_debug_sink(Some(Arc::new(TracingSink) as Arc<dyn DebugSink>));
        }

        for port in &cfg.listen_ports {
            engine
                .add_listener_on(cfg.listen_address.as_deref(), Some(port))
                .await
                .with_context(|| format!("listening on port {port}"))?;
        }
        info!(addrs = ?engine.local_addrs(), "relpd started");

        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.run().await });

        shutdown_signal().await?;
        info!("shutting down");
        engine.stop();
        task.await??;
        Ok::<_, anyhow::Error>(())
    })
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "trace" } else { "info" }));
    // stdout carries the messages; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
