//! Beam receiver — entry point.
//!
//! ```text
//! beam-receiver                  Listen on the configured port
//! beam-receiver --config <path>  Load a custom config TOML
//! beam-receiver --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beam_core::codec::ZstdDecoder;
use beam_core::service::ReceiverService;
use beam_core::types::PixelFormat;
use beam_receiver::config::AppConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "beam-receiver", about = "Adaptive screen-video receiver")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "beam-receiver.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&AppConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = AppConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("beam-receiver v{}", env!("CARGO_PKG_VERSION"));
    info!("listening on {}", config.network.bind);

    let (service, handle) = ReceiverService::new(config.to_receiver_options());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        ctrl_c.cancel();
    });

    // Periodic delivery statistics until a display surface is wired
    // in; the watch channel is the integration point for one.
    let stats_interval = Duration::from_secs(config.recovery.stats_interval_s.max(1));
    let stats_cancel = cancel.clone();
    let stats_handle = handle.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(stats_interval);
        tick.tick().await; // immediate first tick carries no data
        loop {
            tokio::select! {
                _ = stats_cancel.cancelled() => break,
                _ = tick.tick() => {
                    let stats = *stats_handle.stats.borrow();
                    let frame = stats_handle
                        .frames
                        .borrow()
                        .as_ref()
                        .map(|f| (f.seq, f.width, f.height));
                    info!(?stats, latest = ?frame, "delivery");
                }
            }
        }
    });

    service.run(ZstdDecoder::new(PixelFormat::Bgra8), cancel).await?;
    Ok(())
}
