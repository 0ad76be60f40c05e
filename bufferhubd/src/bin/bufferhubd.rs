use bufferhub::BufferHub;
use bufferhubd::{Config, Server};
use clap::Parser;
use eyre::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::sleep;
use std::time::{Duration, Instant};

static LONG_VERSION: OnceLock<String> = OnceLock::new();

fn get_long_version() -> &'static str {
    LONG_VERSION.get_or_init(|| {
        format!(
            "{} (commit: {}, protocol: {})",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_REVISION", "unknown"),
            protocol::VERSION
        )
    })
}

#[derive(Parser)]
#[command(name = "bufferhubd")]
#[command(about = "shared graphics buffer broker")]
#[command(version = None, long_version = get_long_version())]
struct Args {
    #[arg(help = "configuration file path (toml format)")]
    config: Option<String>,

    #[arg(short, long, help = "unix socket to listen on, overrides the config")]
    socket: Option<String>,

    #[arg(
        short,
        long,
        value_parser = humantime::parse_duration,
        help = "serve for this long, then exit (e.g. 10s, 5m, 1h)"
    )]
    duration: Option<Duration>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config path={}", path))?,
        None => Config::default(),
    };
    if let Some(socket) = args.socket {
        config.socket = socket;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received ctrl+c, shutting down gracefully...");
        r.store(false, Ordering::SeqCst);
    })?;

    let hub = Arc::new(BufferHub::new(config.allocator.build()));
    let server = Server::start(&config.socket, Arc::clone(&hub))
        .with_context(|| format!("failed to listen on socket={}", config.socket))?;

    let start_time = Instant::now();
    let duration = args.duration;
    while running.load(Ordering::SeqCst) && duration.is_none_or(|d| start_time.elapsed() < d) {
        if !server.is_running() {
            break;
        }
        sleep(Duration::from_millis(100));
    }

    server.stop().context("listener thread failed")?;
    tracing::info!(buffers = hub.buffer_count(), "bufferhubd stopped");
    Ok(())
}
