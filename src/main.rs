//! meshbridge-client - serves a geometry engine to a meshbridge host.
//!
//! The host spawns this binary (locally or through `ssh`) and talks to it
//! over stdin/stdout. Logs go to stderr so they never mix with the protocol.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshbridge::client::serve;
use meshbridge::engine::SandboxEngine;
use meshbridge::transport::FramedChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    /// Deterministic in-memory geometry kernel
    Sandbox,
    /// Engine module inside an embedded Python interpreter
    Python,
}

#[derive(Parser)]
#[command(name = "meshbridge-client")]
#[command(version)]
#[command(about = "Serve a geometry engine to a meshbridge host over stdin/stdout")]
struct Cli {
    /// Engine binding to serve
    #[arg(long, value_enum, default_value_t = EngineKind::Sandbox)]
    engine: EngineKind,

    /// Directory that makes the engine library locatable (repeatable)
    #[arg(long = "library-dir")]
    library_dirs: Vec<PathBuf>,

    /// Python module exposing the engine (python engine only)
    #[arg(long, default_value = "cubit")]
    module: String,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "meshbridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    tracing::info!(
        "Starting meshbridge-client v{} ({:?} engine)",
        env!("CARGO_PKG_VERSION"),
        cli.engine
    );

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut channel = FramedChannel::new(stdin.lock(), stdout.lock());

    match cli.engine {
        EngineKind::Sandbox => {
            if !cli.library_dirs.is_empty() {
                tracing::debug!("Sandbox engine ignores {:?}", cli.library_dirs);
            }
            serve(SandboxEngine::new(), &mut channel).context("Sandbox engine session failed")
        }
        EngineKind::Python => run_python(&cli, &mut channel),
    }
}

#[cfg(feature = "python")]
fn run_python<R, W>(cli: &Cli, channel: &mut FramedChannel<R, W>) -> Result<()>
where
    R: io::BufRead,
    W: io::Write,
{
    let engine = meshbridge::engine::PythonEngine::new(&cli.module, cli.library_dirs.clone());
    serve(engine, channel).with_context(|| format!("Python engine '{}' session failed", cli.module))
}

#[cfg(not(feature = "python"))]
fn run_python<R, W>(cli: &Cli, _channel: &mut FramedChannel<R, W>) -> Result<()>
where
    R: io::BufRead,
    W: io::Write,
{
    anyhow::bail!(
        "Python engine '{}' requested, but meshbridge-client was built without the `python` feature",
        cli.module
    )
}
