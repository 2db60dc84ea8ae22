//! Process-wide arbitration configuration
//!
//! Loaded once at startup and passed explicitly into every device, arbitrator
//! and press helper.

use crate::collision::CollisionPolicy;
use crate::error::AutomationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const DEFAULT_BLOCK_MS: f64 = 60.0 * 60.0 * 1000.0;

/// Upper bound for the per-device command history
pub const MAX_HISTORY_CAPACITY: usize = 4096;

/// Upper bound for any timer duration (ten years)
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Convert a millisecond value from untrusted input into a duration.
///
/// Negative, NaN and infinite values clamp to zero with a warning, values
/// beyond [`MAX_DURATION`] clamp to it.
#[must_use] pub fn duration_from_millis(ms: f64) -> Duration {
    if !ms.is_finite() || ms < 0.0 {
        tracing::warn!(target: "automation::config", "Invalid duration {}ms, using 0", ms);
        return Duration::ZERO;
    }
    match Duration::try_from_secs_f64(ms / 1000.0) {
        Ok(duration) if duration <= MAX_DURATION => duration,
        _ => {
            tracing::warn!(target: "automation::config", "Duration {}ms too large, clamping", ms);
            MAX_DURATION
        }
    }
}

/// Defaults applied when a block command leaves a field unset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDefaults {
    pub duration_ms: f64,
    pub collision_policy: CollisionPolicy,
    pub revert_on_lift: bool,
}

impl Default for BlockDefaults {
    fn default() -> Self {
        Self {
            duration_ms: DEFAULT_BLOCK_MS,
            collision_policy: CollisionPolicy::default(),
            revert_on_lift: false,
        }
    }
}

impl BlockDefaults {
    #[must_use] pub fn duration(&self) -> Duration {
        duration_from_millis(self.duration_ms)
    }
}

/// Self-reset windows of the press debounce helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressTimings {
    pub short_reset_ms: u64,
    pub long_reset_ms: u64,
}

impl Default for PressTimings {
    fn default() -> Self {
        Self {
            short_reset_ms: 1000,
            long_reset_ms: 5000,
        }
    }
}

/// Arbitration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub block: BlockDefaults,
    /// Number of recent commands each device keeps for diagnostics
    pub history_capacity: usize,
    pub press: PressTimings,
    /// Manual writes block automatic control with the block defaults
    pub manual_block_on_write: bool,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            block: BlockDefaults::default(),
            history_capacity: 32,
            press: PressTimings::default(),
            manual_block_on_write: true,
        }
    }
}

impl ArbitrationConfig {
    /// Path of the config file: `$DATA_DIR/arbitration.json` (default `./data`)
    #[must_use] pub fn default_path() -> PathBuf {
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        PathBuf::from(data_dir).join("arbitration.json")
    }

    /// Read and parse a config file, failing on any error
    pub async fn from_file(path: &Path) -> Result<Self, AutomationError> {
        let contents = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config.sanitized())
    }

    /// Load a config file, falling back to defaults when absent or unparsable
    pub async fn load(path: &Path) -> Self {
        match Self::from_file(path).await {
            Ok(config) => {
                tracing::info!("Loaded arbitration config from {:?}", path);
                config
            }
            Err(AutomationError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No arbitration config at {:?}, using defaults", path);
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load arbitration config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    fn sanitized(mut self) -> Self {
        if !self.block.duration_ms.is_finite() || self.block.duration_ms < 0.0 {
            tracing::warn!(
                target: "automation::config",
                "Invalid default block duration {}ms, clamping to 0",
                self.block.duration_ms
            );
            self.block.duration_ms = 0.0;
        }
        if self.history_capacity == 0 {
            tracing::warn!(target: "automation::config", "history_capacity 0, keeping 1 entry");
            self.history_capacity = 1;
        } else if self.history_capacity > MAX_HISTORY_CAPACITY {
            tracing::warn!(
                target: "automation::config",
                "history_capacity {} too large, clamping to {}",
                self.history_capacity,
                MAX_HISTORY_CAPACITY
            );
            self.history_capacity = MAX_HISTORY_CAPACITY;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_from_millis_clamps() {
        assert_eq!(duration_from_millis(1500.0), Duration::from_millis(1500));
        assert_eq!(duration_from_millis(-5.0), Duration::ZERO);
        assert_eq!(duration_from_millis(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_millis(f64::INFINITY), Duration::ZERO);
        assert_eq!(duration_from_millis(1e300), MAX_DURATION);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ArbitrationConfig =
            serde_json::from_str(r#"{ "block": { "collision_policy": "extend" } }"#).unwrap();
        assert_eq!(config.block.collision_policy, CollisionPolicy::Extend);
        assert_eq!(config.block.duration(), Duration::from_secs(3600));
        assert!(!config.block.revert_on_lift);
        assert_eq!(config.history_capacity, 32);
        assert_eq!(config.press, PressTimings::default());
    }

    #[tokio::test]
    async fn test_load_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("arbitration-{}.json", uuid::Uuid::new_v4()));
        assert_eq!(ArbitrationConfig::load(&path).await, ArbitrationConfig::default());
        assert!(matches!(
            ArbitrationConfig::from_file(&path).await,
            Err(AutomationError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_negative_duration_is_clamped_on_load() {
        let path = std::env::temp_dir().join(format!("arbitration-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "block": { "duration_ms": -20 }, "history_capacity": 0 }"#).unwrap();

        let config = ArbitrationConfig::from_file(&path).await.unwrap();
        assert_eq!(config.block.duration(), Duration::ZERO);
        assert_eq!(config.history_capacity, 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_huge_history_capacity_is_clamped_on_load() {
        let path = std::env::temp_dir().join(format!("arbitration-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "history_capacity": 18446744073709551615 }"#).unwrap();

        let config = ArbitrationConfig::from_file(&path).await.unwrap();
        assert_eq!(config.history_capacity, MAX_HISTORY_CAPACITY);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_unparsable_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("arbitration-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "not json").unwrap();

        assert_eq!(ArbitrationConfig::load(&path).await, ArbitrationConfig::default());
        assert!(matches!(
            ArbitrationConfig::from_file(&path).await,
            Err(AutomationError::Json(_))
        ));
        let _ = std::fs::remove_file(&path);
    }
}
