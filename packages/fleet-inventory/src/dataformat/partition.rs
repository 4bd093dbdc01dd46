//! Named storage partitions.

use serde::{Deserialize, Serialize};

use super::condition::ReplicaCondition;

/// A named slice of every site's storage.
///
/// A leaf partition holds a condition expression; a superpartition references
/// an ordered tuple of leaf subpartitions. The tree has depth at most 2.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Store-assigned numeric id (0 until persisted)
    pub id: u32,
    pub name: String,
    /// Classification predicate; `None` for superpartitions
    pub condition: Option<ReplicaCondition>,
    /// Ordered subpartition names; `None` for leaf partitions
    pub subpartitions: Option<Vec<String>>,
    /// Owning superpartition, if any
    pub parent: Option<String>,
}

impl Partition {
    pub fn is_leaf(&self) -> bool {
        self.subpartitions.is_none()
    }

    pub fn to_record(&self) -> PartitionRecord {
        PartitionRecord {
            name: self.name.clone(),
            condition: self.condition.clone(),
            subpartitions: self.subpartitions.clone(),
        }
    }
}

/// Unlinked partition description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ReplicaCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpartitions: Option<Vec<String>>,
}
