//! Identifiers shared across the recording and checkpoint layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a recordable unit of the simulated system (one cell/node).
///
/// Entities are owned by exactly one worker; nothing in this workspace
/// shares an entity's buffer or dataset across workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded time series: a named floating-point variable of one entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordedVariable {
    /// Owning entity.
    pub entity: EntityId,
    /// Variable name as understood by the engine's sampler (e.g. `"v"`).
    pub name: String,
}

impl RecordedVariable {
    /// Creates a new descriptor.
    pub fn new(entity: EntityId, name: impl Into<String>) -> Self {
        Self {
            entity,
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordedVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_display_and_order() {
        let a = EntityId::from(3);
        let b = EntityId(11);
        assert!(a < b);
        assert_eq!(a.to_string(), "3");
        assert_eq!(b.get(), 11);
    }

    #[test]
    fn test_entity_id_serialises_transparently() {
        let json = serde_json::to_string(&EntityId(42)).unwrap();
        assert_eq!(json, "42");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntityId(42));
    }

    #[test]
    fn test_recorded_variable_display() {
        let var = RecordedVariable::new(EntityId(7), "cai");
        assert_eq!(var.to_string(), "7/cai");
    }
}
