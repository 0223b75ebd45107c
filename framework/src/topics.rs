//! Topic namespace for one node
//!
//! ```text
//! <prefix>/<device_id>/sensor/<field>          scalar, QoS 1
//! <prefix>/<device_id>/sensor                  aggregated JSON, retained
//! <prefix>/<device_id>/status                  online / offline, retained
//! <prefix>/<device_id>/diagnostics             heap + uptime snapshot
//! <hub_prefix>/sensor/<device_id>/<metric>/config   discovery, retained
//! ```

use crate::telemetry::Field;

pub const STATE_PATH: &str = "sensor";
pub const STATUS_PATH: &str = "status";
pub const DIAGNOSTICS_PATH: &str = "diagnostics";
pub const CONFIG_PATH: &str = "config";
pub const DEVICE_FAMILY: &str = "sensor";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic segment '{0}' is empty")]
    EmptySegment(&'static str),
    #[error("topic segment '{name}' contains reserved character in '{value}'")]
    ReservedCharacter { name: &'static str, value: String },
}

/// Validate a segment (or a `/`-separated prefix) and strip trailing slashes
fn clean(name: &'static str, value: &str) -> Result<String, TopicError> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(str::is_empty) {
        return Err(TopicError::EmptySegment(name));
    }
    if trimmed.contains(['+', '#']) {
        return Err(TopicError::ReservedCharacter {
            name,
            value: value.to_string(),
        });
    }
    Ok(trimmed.to_string())
}

/// Topics owned by one (prefix, device id) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamespace {
    base: String,
}

impl TopicNamespace {
    pub fn new(prefix: &str, device_id: &str) -> Result<Self, TopicError> {
        let prefix = clean("prefix", prefix)?;
        let device_id = clean("device_id", device_id)?;
        if device_id.contains('/') {
            return Err(TopicError::ReservedCharacter {
                name: "device_id",
                value: device_id,
            });
        }
        Ok(Self {
            base: format!("{}/{}", prefix, device_id),
        })
    }

    /// `<prefix>/<device_id>`
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn scalar(&self, field: Field) -> String {
        format!("{}/{}/{}", self.base, STATE_PATH, field.topic_leaf())
    }

    pub fn envelope(&self) -> String {
        format!("{}/{}", self.base, STATE_PATH)
    }

    pub fn availability(&self) -> String {
        format!("{}/{}", self.base, STATUS_PATH)
    }

    pub fn diagnostics(&self) -> String {
        format!("{}/{}", self.base, DIAGNOSTICS_PATH)
    }
}

/// `<hub_prefix>/sensor/<device_id>/<metric>/config`
pub fn discovery_topic(hub_prefix: &str, device_id: &str, metric: &str) -> Result<String, TopicError> {
    let hub_prefix = clean("hub_prefix", hub_prefix)?;
    let device_id = clean("device_id", device_id)?;
    let metric = clean("metric", metric)?;
    Ok(format!(
        "{}/{}/{}/{}/{}",
        hub_prefix, DEVICE_FAMILY, device_id, metric, CONFIG_PATH
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_in_prefix_is_trimmed() {
        let ns = TopicNamespace::new("pressure_sensor/", "A1B2C3D4E5F6").unwrap();
        assert_eq!(ns.envelope(), "pressure_sensor/A1B2C3D4E5F6/sensor");
        assert_eq!(
            ns.scalar(Field::Pressure),
            "pressure_sensor/A1B2C3D4E5F6/sensor/pressure"
        );
        assert_eq!(ns.availability(), "pressure_sensor/A1B2C3D4E5F6/status");
        assert_eq!(ns.diagnostics(), "pressure_sensor/A1B2C3D4E5F6/diagnostics");
    }

    #[test]
    fn test_multi_level_prefix() {
        let ns = TopicNamespace::new("site/boiler", "dev1").unwrap();
        assert_eq!(
            ns.scalar(Field::LinearMultiplier),
            "site/boiler/dev1/sensor/multiplier"
        );
    }

    #[test]
    fn test_rejects_empty_and_wildcards() {
        assert_eq!(
            TopicNamespace::new("", "dev"),
            Err(TopicError::EmptySegment("prefix"))
        );
        assert_eq!(
            TopicNamespace::new("a//b", "dev"),
            Err(TopicError::EmptySegment("prefix"))
        );
        assert!(matches!(
            TopicNamespace::new("home/+", "dev"),
            Err(TopicError::ReservedCharacter { .. })
        ));
        assert!(matches!(
            TopicNamespace::new("home", "de/v"),
            Err(TopicError::ReservedCharacter { .. })
        ));
    }

    #[test]
    fn test_discovery_topic() {
        assert_eq!(
            discovery_topic("homeassistant", "A1B2C3D4E5F6", "pressure").unwrap(),
            "homeassistant/sensor/A1B2C3D4E5F6/pressure/config"
        );
        assert!(discovery_topic("homeassistant", "", "pressure").is_err());
    }
}
