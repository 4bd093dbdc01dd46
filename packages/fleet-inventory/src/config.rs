//! Inventory configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One partition definition from the server configuration: either a leaf
/// condition text or an ordered list of subpartition names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpartitions: Option<Vec<String>>,
}

impl PartitionDef {
    pub fn leaf(name: impl Into<String>, condition: impl Into<String>) -> Self {
        PartitionDef {
            name: name.into(),
            condition: Some(condition.into()),
            subpartitions: None,
        }
    }

    pub fn superpartition(name: impl Into<String>, children: Vec<String>) -> Self {
        PartitionDef {
            name: name.into(),
            condition: None,
            subpartitions: Some(children),
        }
    }
}

/// Inventory configuration block of the server config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Directory holding the persistent table files
    pub data_dir: PathBuf,
    /// Partition definitions, leaves before superpartitions
    #[serde(default)]
    pub partitions: Vec<PartitionDef>,
    /// Maximum retry attempts for transient I/O errors
    #[serde(default = "default_max_retries")]
    pub persistence_max_retries: u32,
    /// Delay between retry attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub persistence_retry_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./inventory"),
            partitions: vec![PartitionDef::leaf("global", "true")],
            persistence_max_retries: default_max_retries(),
            persistence_retry_delay_ms: default_retry_delay_ms(),
        }
    }
}
