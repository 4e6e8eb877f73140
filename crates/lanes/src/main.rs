//! Lanes server entry point.
//!
//! Loads the configuration, installs logging, builds a single lane server
//! with echo hooks and runs it until a termination signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::anyhow;
use lane_server::axum::routing::get;
use lane_server::{Network, Server, ServerBuilder};
use tracing::{error, info, warn};

use cli::CliArgs;
use config::AppConfig;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    config.apply_cli(&args);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

    logging::setup_logging(config.log_level(), config.logging.json_format)?;

    let network = config.network()?;
    info!(
        config = %args.config_path.display(),
        %network,
        listen = %config.server.listen,
        cores = config.engine.core,
        "🌟 Starting lanes v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut builder = ServerBuilder::new(network).config(config.engine.clone());
    if network == Network::Http {
        builder = builder.http_routes(|router| router.route("/health", get(|| async { "ok" })));
    }
    let server = builder.build().await?;
    register_echo(&server);

    let signal_server = server.clone();
    tokio::spawn(async move {
        match signals::wait_for_shutdown().await {
            Ok(_) => {
                info!("🛑 Shutdown signal received, initiating graceful shutdown...");
                signal_server.shutdown(None, None).await;
            }
            Err(e) => error!(error = %e, "❌ Failed to install signal handlers"),
        }
    });

    server.run(&config.server.listen).await?;
    info!("👋 lanes stopped");
    Ok(())
}

/// Writes every inbound packet straight back to its sender.
fn register_echo(server: &Server) {
    let events = server.events();

    events.on_connection_opened(|_, conn| {
        info!(conn = %conn.id(), network = %conn.network(), "🔗 Connection opened");
    });
    events.on_connection_closed(|_, conn, err| match err {
        Some(err) => warn!(conn = %conn.id(), error = %err, "Connection closed with error"),
        None => info!(conn = %conn.id(), "Connection closed"),
    });

    events.on_connection_receive_packet(|_, conn, packet| {
        if let Err(e) = conn.write(packet) {
            warn!(conn = %conn.id(), error = %e, "echo failed");
        }
    });
    events.on_connection_receive_websocket_packet(|_, conn, packet, _| {
        if let Err(e) = conn.write(packet) {
            warn!(conn = %conn.id(), error = %e, "echo failed");
        }
    });

    events.on_message_error(|_, msg, err| {
        error!(kind = %msg.kind(), error = %err, "❌ Message handling failed");
    });
    events.on_message_low_latency(|_, msg, cost| {
        warn!(kind = %msg.kind(), ?cost, "🐢 Slow message");
    });
}
