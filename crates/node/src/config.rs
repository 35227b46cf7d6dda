//! Configuration loading for the node binary.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use beacon_coordinator::ProtocolConfig;

/// Load the protocol configuration from a JSON file, or use the defaults.
pub fn load_config(path: Option<&Path>) -> Result<ProtocolConfig> {
    let Some(path) = path else {
        return Ok(ProtocolConfig::default());
    };
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = serde_json::from_str(&data)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub threshold: Option<u32>,
    pub participants: Option<Vec<String>>,
    pub network_delay_ms: Option<u64>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut ProtocolConfig) {
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(participants) = self.participants {
            config.participants = participants;
        }
        if let Some(delay) = self.network_delay_ms {
            config.network_delay_ms = delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon.json");
        fs::write(
            &path,
            r#"{"threshold": 3, "participants": ["a", "b", "c", "d"], "network_delay_ms": 20}"#,
        )
        .unwrap();

        let mut config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.threshold, 3);

        ConfigOverrides {
            threshold: Some(2),
            ..Default::default()
        }
        .apply(&mut config);
        assert_eq!(config.threshold, 2);
        assert_eq!(config.participants.len(), 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(dir.path().join("absent.json").as_path())).is_err());
        assert_eq!(load_config(None).unwrap(), ProtocolConfig::default());
    }
}
