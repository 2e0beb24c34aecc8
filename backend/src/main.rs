use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

mod api;
mod config;
mod error;
mod mqtt;
mod relay;

use mqtt::{MqttPublisher, Publisher};

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::Config::from_env()?;
    if config.uses_default_api_key() {
        warn!("BRIDGE_API_KEY is not set, using the built-in default key");
    }

    let (publisher, connection) = MqttPublisher::connect(&config.broker);
    let publisher = Arc::new(publisher);
    let broker_task = actix_web::rt::spawn(connection.run());

    let relay = Arc::new(relay::Relay::from_config(
        publisher.clone() as Arc<dyn Publisher>,
        &config,
    ));

    // returns once the server got a shutdown signal and drained its workers
    let served = api::new_http_server(relay, &config).await;

    info!("Shutting down");
    publisher.disconnect().await;
    broker_task.abort();

    served?;
    Ok(())
}
