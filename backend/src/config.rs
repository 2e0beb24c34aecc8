use std::{env, time::Duration};

use anyhow::{bail, Context, Result};
use url::{Host, Url};

pub const DEFAULT_API_KEY: &str = "change_me_in_production";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Broker {
    /// Accepts `mqtt://`, `tcp://`, `mqtts://` and `ssl://` URLs, optionally
    /// with `user:password@`, or a bare `host[:port]`.
    pub fn from_url(raw: &str, client_id: impl Into<String>) -> Result<Self> {
        let url = if raw.contains("://") {
            Url::parse(raw)
        } else {
            Url::parse(&format!("mqtt://{raw}"))
        }
        .with_context(|| format!("invalid broker URL '{raw}'"))?;

        let (tls, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (false, 1883),
            "mqtts" | "ssl" => (true, 8883),
            scheme => bail!("unsupported broker scheme '{scheme}' in '{raw}'"),
        };
        let host = match url.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            Some(host) => host.to_string(),
            None => String::new(),
        };
        if host.is_empty() {
            bail!("missing broker host in '{raw}'");
        }

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            tls,
            client_id: client_id.into(),
            username: Some(url.username())
                .filter(|s| !s.is_empty())
                .map(String::from),
            password: url.password().map(String::from),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_key: String,
    pub broker: Broker,
    pub bind_addr: String,
    pub port: u16,
    pub publish_timeout: Duration,
    pub publish_retries: u32,
    pub publish_backoff: Duration,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a non-negative integer, got '{v}'")),
                None => Ok(default),
            }
        };

        let mut broker = Broker::from_url(
            &var("MQTT_URL", "mqtt://127.0.0.1:1883"),
            var("MQTT_CLIENT_ID", "mqtt-bridge"),
        )?;
        if let Some(username) = lookup("MQTT_USERNAME").filter(|s| !s.is_empty()) {
            broker.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            broker.password = Some(password);
        }

        let port = u16::try_from(number("PORT", 3001)?).context("PORT out of range")?;
        let publish_retries =
            u32::try_from(number("PUBLISH_RETRIES", 0)?).context("PUBLISH_RETRIES out of range")?;

        let cors_origins = lookup("CORS_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            api_key: var("BRIDGE_API_KEY", DEFAULT_API_KEY),
            broker,
            bind_addr: var("BIND_ADDR", "0.0.0.0"),
            port,
            publish_timeout: Duration::from_millis(number("PUBLISH_TIMEOUT_MS", 5000)?),
            publish_retries,
            publish_backoff: Duration::from_millis(number("PUBLISH_BACKOFF_MS", 200)?),
            cors_origins,
        })
    }

    pub fn uses_default_api_key(&self) -> bool {
        self.api_key == DEFAULT_API_KEY
    }
}
