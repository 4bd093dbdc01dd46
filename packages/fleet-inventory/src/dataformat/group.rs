//! Replica-owning groups.

use serde::{Deserialize, Serialize};

use crate::error::ObjectError;

/// Minimum granularity at which a group owns data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipLevel {
    Dataset,
    Block,
}

impl OwnershipLevel {
    pub fn name(self) -> &'static str {
        match self {
            OwnershipLevel::Dataset => "Dataset",
            OwnershipLevel::Block => "Block",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Dataset" => Some(OwnershipLevel::Dataset),
            "Block" => Some(OwnershipLevel::Block),
            _ => None,
        }
    }
}

/// A user group owning block replicas.
///
/// The "null group" (unowned data) is not a `Group` instance; replicas carry
/// `group: Option<String>` and `None` marks unowned.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Store-assigned numeric id (0 until persisted)
    pub id: u32,
    pub name: String,
    pub olevel: OwnershipLevel,
}

impl Group {
    pub fn copy_from(&mut self, record: &GroupRecord) -> Result<(), ObjectError> {
        if self.name != record.name {
            return Err(ObjectError::IdentityMismatch {
                this: format!("group {}", self.name),
                other: format!("group {}", record.name),
            });
        }
        self.olevel = record.olevel;
        Ok(())
    }

    pub fn to_record(&self, attrs: bool) -> GroupRecord {
        GroupRecord {
            name: self.name.clone(),
            olevel: if attrs {
                self.olevel
            } else {
                OwnershipLevel::Block
            },
        }
    }
}

/// Unlinked group description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub olevel: OwnershipLevel,
}

impl GroupRecord {
    pub fn new(name: impl Into<String>, olevel: OwnershipLevel) -> Self {
        Self {
            name: name.into(),
            olevel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_rejects_identity_change() {
        let mut group = Group {
            id: 1,
            name: "prod".into(),
            olevel: OwnershipLevel::Block,
        };
        let err = group
            .copy_from(&GroupRecord::new("analysis", OwnershipLevel::Dataset))
            .unwrap_err();
        assert!(matches!(err, ObjectError::IdentityMismatch { .. }));

        group
            .copy_from(&GroupRecord::new("prod", OwnershipLevel::Dataset))
            .unwrap();
        assert_eq!(group.olevel, OwnershipLevel::Dataset);
    }
}
