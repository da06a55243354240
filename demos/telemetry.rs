//! Telemetry and RPC demo
//!
//! Connects with the credentials file given as first argument (or the default
//! location), answers every RPC request with `{"ok": true}` and publishes a
//! counter as telemetry every five seconds.
//!
//! ```text
//! cargo run --example telemetry -- ./credentials.toml
//! ```

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tb_device_client::{ConnectionConfig, DeviceClient, InboundMessage, TracingSink};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = std::env::args()
        .nth(1)
        .map(Into::into)
        .unwrap_or_else(ConnectionConfig::default_path);
    info!("Loading credentials from {}", path.display());
    let config = ConnectionConfig::from_file(&path)?;

    let client = DeviceClient::builder(config)
        .log_sink(Arc::new(TracingSink::new("demo")))
        .build()?;

    let (rpc_tx, mut rpc_rx) = mpsc::unbounded_channel::<InboundMessage>();
    client.register_message_listener("rpc", move |event| match event {
        Ok(message) => {
            if rpc_tx.send(message.clone()).is_err() {
                warn!("RPC queue closed");
            }
        }
        Err(e) => error!("Listener error: {}", e),
    });

    client
        .connect()
        .await
        .map_err(|e| eyre!("Failed to connect: {}", e))?;
    let subscribed = client.subscribe(["v1/devices/me/rpc/request/+"]).await?;
    info!("Subscribed: {:?} ({:?})", subscribed.topics, subscribed.ack.return_codes);

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                counter += 1;
                let payload = format!(r#"{{"counter": {}}}"#, counter);
                if let Err(e) = client.publish(payload, "v1/devices/me/telemetry").await {
                    error!("Telemetry publish failed: {}", e);
                }
            }
            Some(request) = rpc_rx.recv() => {
                info!("RPC request on {}: {}", request.topic, request.payload);
                let response = client.respond_to_rpc_request(&request.topic, r#"{"ok": true}"#);
                if let Err(e) = response.await {
                    error!("RPC response failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down");
    client.shutdown().await?;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
    Ok(())
}
