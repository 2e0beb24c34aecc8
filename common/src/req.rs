// keep in sync with the dashboard's settings page and the device firmware

/// WiFi credentials pushed to a single device.
///
/// The dashboard posts `wifi_ssid`/`wifi_password`, devices expect
/// `ssid`/`password`; both spellings are accepted, only the short one is
/// written.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct WifiCredentials {
    #[serde(alias = "wifi_ssid")]
    pub ssid: String,
    #[serde(alias = "wifi_password")]
    pub password: String,
}

impl WifiCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub const OK: Self = Self { ok: true };
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub broker_connected: bool,
}
