//! Beam sender — entry point.
//!
//! ```text
//! beam-sender                    Stream the test pattern to the peer
//! beam-sender --config <path>    Load a custom config TOML
//! beam-sender --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use beam_core::codec::{CodecConfig, ZstdCodec};
use beam_core::service::SenderService;
use beam_core::types::PixelFormat;
use beam_sender::config::AppConfig;
use beam_sender::pattern::TestPatternSource;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "beam-sender", about = "Adaptive screen-video sender")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "beam-sender.toml")]
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

    info!("beam-sender v{}", env!("CARGO_PKG_VERSION"));
    info!("peer: {}", config.network.peer);
    info!("target FPS: {}", config.video.fps);
    info!(
        "bitrate band: {} - {} bps",
        config.adaptation.min_bitrate_bps, config.adaptation.max_bitrate_bps
    );

    let options = config.to_sender_options();
    let source = TestPatternSource::new(config.video.width, config.video.height, config.video.fps);
    let codec = ZstdCodec::new(
        PixelFormat::Bgra8,
        CodecConfig {
            target_bitrate_bps: config.adaptation.start_bitrate_bps,
            ..CodecConfig::default()
        },
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        ctrl_c.cancel();
    });

    SenderService::new(options).run(source, codec, cancel).await?;
    Ok(())
}
