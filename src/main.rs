use anyhow::Context;
use clap::Parser;
use sipbridge::application::{CallBridge, RegistrationService};
use sipbridge::config::{Config, MediaMode};
use sipbridge::domain::media::MediaAnchor;
use sipbridge::domain::registration::LocationRegistry;
use sipbridge::infrastructure::media::{LocalEndpointBridge, RelayPassthrough, RtpMediaServer};
use sipbridge::infrastructure::metrics::init_metrics;
use sipbridge::infrastructure::protocols::ng::NgClient;
use sipbridge::infrastructure::protocols::sip::SipServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// SIP registrar and back-to-back call bridge
#[derive(Debug, Parser)]
#[command(name = "sipbridge", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sipbridge");
    info!("Configuration loaded: {:?}", config);

    if let Some(listen) = config.metrics.listen {
        init_metrics(listen).context("installing Prometheus exporter")?;
    }

    let registry = LocationRegistry::new();
    let registration = RegistrationService::new(registry.clone(), config.registrar.max_expires);
    let sweeper = registration.spawn_sweeper(config.registrar.sweep_interval());

    let anchor: Arc<dyn MediaAnchor> = match config.media.mode {
        MediaMode::Relay => {
            let relay = &config.media.relay;
            let client = NgClient::connect(relay.address, relay.timeout())
                .await
                .context("binding relay control socket")?;
            if let Err(e) = client.ping().await {
                warn!("Relay at {} did not answer ping: {}", relay.address, e);
            }
            Arc::new(RelayPassthrough::new(Arc::new(client), relay.strip_ice))
        }
        MediaMode::Local => {
            let media = Arc::new(RtpMediaServer::new(config.media.local.server_config()));
            Arc::new(LocalEndpointBridge::new(media))
        }
    };
    info!("Media anchor: {:?}", anchor.kind());

    let server = SipServer::bind(&config.sip.server_config(), registration)
        .await
        .context("starting SIP transport")?;

    let bridge = Arc::new(CallBridge::new(
        registry,
        anchor,
        server.user_agent(),
        config.bridge.bridge_config(),
    ));
    let sip_task = server.spawn(bridge.clone());

    info!("sipbridge initialized successfully");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");

    bridge.shutdown().await;
    sip_task.abort();
    sweeper.abort();

    Ok(())
}
