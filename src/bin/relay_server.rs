//! Relay server: accepts TCP connections and fans every received message
//! out to all connected peers. Stateless; one global broadcast domain per
//! process.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use posecast::config::RelayConfig;
use posecast::relay;

const CONFIG_PATH: &str = "relay.toml";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    println!("posecast relay ({})", env!("GIT_VERSION"));

    let config = RelayConfig::load_or_default(CONFIG_PATH);
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    log::info!(
        "listening on {} (echo_to_sender={})",
        config.listen_addr,
        config.echo_to_sender
    );

    let cancel = CancellationToken::new();
    let serve = relay::serve(listener, config, cancel.clone());
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            cancel.cancel();
            let _ = serve.await;
        }
    }

    Ok(())
}
