mod config;
mod device;
mod error;
mod handler;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use benchlink_agent_server::{AgentServer, Broadcaster, ServerConfig};
use benchlink_drivers::Registry;

use config::AgentConfig;
use device::Device;
use handler::AgentHandler;

/// Period of the background session check.
const SESSION_CHECK_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let path = config::config_path(&args)?;
    let config = AgentConfig::load_or_create(&path)?;

    let broadcaster = Broadcaster::new();
    let device = Device::new(&config, &Registry::builtin(), broadcaster.clone())
        .context("failed to set up the device drivers")?;
    let device = Arc::new(device);
    device.start().context("failed to start the console")?;

    let server = AgentServer::new(
        ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: config.port,
            ..Default::default()
        },
        Arc::new(AgentHandler::new(Arc::clone(&device))),
        broadcaster,
    );

    let ticker = {
        let device = Arc::clone(&device);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_CHECK_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let device = Arc::clone(&device);
                if let Err(e) = tokio::task::spawn_blocking(move || device.tick()).await {
                    tracing::error!("session check failed: {e}");
                }
            }
        })
    };

    let runner = Arc::clone(&server);
    let serve = tokio::spawn(async move { runner.run().await });
    tracing::info!(name = %config.name, port = config.port, "benchlink agent running");

    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c").map(|()| {
                tracing::info!("shutting down");
            })
        }
        result = serve => result
            .context("server task panicked")
            .and_then(|served| served.context("server stopped")),
    };

    ticker.abort();
    server.shutdown();
    tokio::task::spawn_blocking(move || device.shutdown()).await?;
    outcome
}
