use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fanout_server::config::Config;
use fanout_server::ice::IceServerProvider;
use fanout_server::relay::Relay;
use fanout_server::sfu::{
    ForwarderConfig, ForwarderRegistry, SessionConfig, TargetBitrate, WebRtcTransportFactory,
};
use fanout_server::signaling::{OrchestratorSettings, ws};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout_server=debug,fanout_media=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fanout relay...");

    let config = Config::load()?;

    let registry = Arc::new(ForwarderRegistry::with_config(ForwarderConfig {
        queue_capacity: config.forwarder_queue_capacity,
        overflow_policy: config.overflow_policy,
    }));
    let ice = Arc::new(IceServerProvider::from_config(&config));
    let factory = Arc::new(WebRtcTransportFactory::new(ice));

    let settings = OrchestratorSettings {
        codec: config.codec,
        slot_capacity: config.slot_capacity,
        session: SessionConfig {
            failed_grace: config.failed_grace,
            bitrate: TargetBitrate::new(config.bitrate_kbps),
        },
    };

    let (client, outbound) = ws::SignalClient::channel();
    let relay = Relay::new(settings, registry, factory, Arc::new(client));
    let stats = relay.spawn_stats(config.sync_interval);

    let url = ws::node_url(&config.signal_url, &config.node_id);
    tracing::info!(
        node_id = %config.node_id,
        codec = ?config.codec,
        bitrate_kbps = config.bitrate_kbps,
        slots = config.slot_capacity,
        "Relay configured"
    );

    tokio::select! {
        _ = ws::run(url, outbound, relay.clone(), config.reconnect_delay) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutdown requested");
        }
    }

    stats.abort();
    relay.shutdown().await;

    Ok(())
}
