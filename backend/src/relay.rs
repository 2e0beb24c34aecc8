use std::{sync::Arc, time::Duration};

use common::{req::WifiCredentials, topic};
use log::{info, warn};
use subtle::ConstantTimeEq;

use crate::{
    config::Config,
    error::BridgeError,
    mqtt::{Publisher, QoS},
};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const NONE: Self = Self {
        max_retries: 0,
        base_delay: Duration::ZERO,
    };

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2_u32.saturating_pow(attempt))
            .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
    }
}

/// Forwards WiFi credentials to devices through the broker.
pub struct Relay {
    publisher: Arc<dyn Publisher>,
    api_key: String,
    publish_timeout: Duration,
    retry: RetryPolicy,
}

impl Relay {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        api_key: impl Into<String>,
        publish_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            publisher,
            api_key: api_key.into(),
            publish_timeout,
            retry,
        }
    }

    pub fn from_config(publisher: Arc<dyn Publisher>, config: &Config) -> Self {
        let retry = match config.publish_retries {
            0 => RetryPolicy::NONE,
            max_retries => RetryPolicy {
                max_retries,
                base_delay: config.publish_backoff,
            },
        };
        Self::new(publisher, config.api_key.clone(), config.publish_timeout, retry)
    }

    /// Any holder of the key may target any device.
    pub fn authorize(&self, key: Option<&str>) -> Result<(), BridgeError> {
        // constant time, so response timing says nothing about the key
        match key {
            Some(key) if bool::from(key.as_bytes().ct_eq(self.api_key.as_bytes())) => Ok(()),
            _ => Err(BridgeError::Unauthorized),
        }
    }

    pub fn broker_connected(&self) -> bool {
        self.publisher.is_connected()
    }

    /// Publishes `creds` to the device's config topic and returns the topic
    /// once the broker acknowledged it.
    pub async fn push_credentials(
        &self,
        device: &str,
        creds: &WifiCredentials,
    ) -> Result<String, BridgeError> {
        topic::validate_identifier(device)?;
        let topic = topic::config_topic(device);
        let payload = serde_json::to_vec(creds)
            .map_err(|e| BridgeError::Delivery(format!("cannot encode payload: {e}")))?;

        let mut attempt = 0;
        loop {
            match self.publish_once(&topic, payload.clone()).await {
                Ok(()) => {
                    info!("Published config to {topic}");
                    return Ok(topic);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    attempt += 1;
                    warn!(
                        "Publish to {topic} failed ({e}), retry {attempt}/{} in {delay:?}",
                        self.retry.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish_once(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let publish = self.publisher.publish(topic, payload, QoS::AtLeastOnce);
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(res) => res,
            Err(_) => Err(BridgeError::Delivery(format!(
                "no broker acknowledgment within {:?}",
                self.publish_timeout
            ))),
        }
    }
}
