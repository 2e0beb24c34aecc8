//! MQTT topic naming shared by the bridge and the devices.
//!
//! Every device subscribes to `devices/{identifier}/config`, where the
//! identifier is the MAC-like token shown on the dashboard.

use thiserror::Error;

pub const DEVICE_PREFIX: &str = "devices";
pub const CONFIG_SUFFIX: &str = "config";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Missing mac in path")]
    Empty,
    #[error("device identifier contains reserved character {0:?}")]
    ReservedCharacter(char),
}

/// Checks that `identifier` fits in a single topic level.
pub fn validate_identifier(identifier: &str) -> Result<(), TopicError> {
    if identifier.trim().is_empty() {
        return Err(TopicError::Empty);
    }
    match identifier.chars().find(|c| matches!(c, '/' | '+' | '#' | '\0')) {
        Some(c) => Err(TopicError::ReservedCharacter(c)),
        None => Ok(()),
    }
}

pub fn config_topic(identifier: &str) -> String {
    format!("{DEVICE_PREFIX}/{identifier}/{CONFIG_SUFFIX}")
}

/// Inverse of [`config_topic`].
pub fn identifier_from_config_topic(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix(DEVICE_PREFIX)?.strip_prefix('/')?;
    let identifier = rest.strip_suffix(CONFIG_SUFFIX)?.strip_suffix('/')?;
    validate_identifier(identifier).ok().map(|_| identifier)
}
