//! Configuration types for devplace

use serde::{Deserialize, Serialize};

/// Placement engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Device sharing configuration
    pub sharing: SharingConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl PlacementConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::DevplaceError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::DevplaceError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::DevplaceError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// How device instances may be shared between running allocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Whether instances used by several running allocations count as a collision
    pub collision_policy: CollisionPolicy,
    /// Device types placed by remaining capacity instead of by affinity score
    pub shared_device_types: Vec<String>,
    /// Device attribute holding the shareable capacity (e.g. "memory")
    pub capacity_attribute: String,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            collision_policy: CollisionPolicy::Shared,
            shared_device_types: vec!["gpu".to_string()],
            capacity_attribute: "memory".to_string(),
        }
    }
}

impl SharingConfig {
    /// Whether requests for this device type go through the shared path
    pub fn is_shared_type(&self, device_type: &str) -> bool {
        self.shared_device_types.iter().any(|t| t == device_type)
    }
}

/// Collision reporting for instances claimed by running allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Co-location is allowed; running allocations never collide
    #[default]
    Shared,
    /// Any instance claimed twice is reported as a collision
    Exclusive,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
