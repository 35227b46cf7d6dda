//! Protocol configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;

/// Tunables shared by every node of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Minimum number of signature shares needed to recover a round signature
    pub threshold: u32,
    /// Ordered node identifiers of the epoch
    pub participants: Vec<String>,
    /// Expected one-way network delay
    pub network_delay_ms: u64,
    /// Retransmission interval as a multiple of the network delay
    pub retransmit_factor: u32,
    /// How far ahead of the current round signature shares are buffered
    pub max_buffered_rounds: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            participants: vec![
                "miner-1".to_string(),
                "miner-2".to_string(),
                "miner-3".to_string(),
            ],
            network_delay_ms: 50,
            retransmit_factor: 4,
            max_buffered_rounds: 4,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.participants.is_empty() {
            return Err(CoordinatorError::InvalidConfig(
                "participant list is empty".to_string(),
            ));
        }
        let n = self.participants.len();
        if self.threshold == 0 || self.threshold as usize > n {
            return Err(CoordinatorError::InvalidConfig(format!(
                "threshold {} must be within 1..={n}",
                self.threshold
            )));
        }
        if self.network_delay_ms == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "network_delay_ms must be positive".to_string(),
            ));
        }
        if self.retransmit_factor == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "retransmit_factor must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Period of the DKG share retransmission task.
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(
            self.network_delay_ms
                .saturating_mul(u64::from(self.retransmit_factor)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ProtocolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retransmit_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_invalid_threshold() {
        let config = ProtocolConfig {
            threshold: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CoordinatorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ProtocolConfig =
            serde_json::from_str(r#"{"threshold": 3, "network_delay_ms": 10}"#).unwrap();
        assert_eq!(config.threshold, 3);
        assert_eq!(config.participants.len(), 3);
        assert_eq!(config.retransmit_interval(), Duration::from_millis(40));
    }
}
