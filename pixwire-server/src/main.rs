//! pixwire server entry point.
//!
//! ```text
//! pixwire-server                  Run in the foreground
//! pixwire-server --config <path>  Load a custom config TOML
//! pixwire-server --port <port>    Override network.listen_port
//! pixwire-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pixwire_server::config::ServerConfig;
use pixwire_server::service::PixwireService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pixwire-server", about = "pixwire remote display server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "pixwire-server.toml")]
    config: PathBuf,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(port) = cli.port {
        config.network.listen_port = port;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    info!("pixwire-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "listening on {}:{}",
        config.network.listen_address, config.network.listen_port
    );
    info!(
        "test pattern: {}x{} {} at {} fps",
        config.capture.width, config.capture.height, config.capture.mode, config.capture.fps
    );
    info!("client encodings: {:?}", config.client.encodings);

    let service = PixwireService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
