use std::collections::BTreeMap;

use crate::world::EntityId;

/// Which visibility pass admitted an entity into a player's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewSource {
    /// Scene-block diff over the per-vision-level entity indexes.
    Scene,
    /// AI-world player-to-player grid crossing.
    Peer,
}

/// Entities a client has been told about. Appear and disappear both go through here so a
/// duplicate of either is never sent.
#[derive(Debug, Default, Clone)]
pub struct VisibilityLedger {
    visible: BTreeMap<EntityId, ViewSource>,
}

impl VisibilityLedger {
    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.visible.contains_key(&entity_id)
    }

    pub fn source(&self, entity_id: EntityId) -> Option<ViewSource> {
        self.visible.get(&entity_id).copied()
    }

    /// Returns `true` when the entity was not yet visible.
    pub fn admit(&mut self, entity_id: EntityId, source: ViewSource) -> bool {
        if self.visible.contains_key(&entity_id) {
            return false;
        }
        self.visible.insert(entity_id, source);
        true
    }

    /// Returns `true` when the entity was visible.
    pub fn evict(&mut self, entity_id: EntityId) -> bool {
        self.visible.remove(&entity_id).is_some()
    }

    pub fn ids_from(&self, source: ViewSource) -> Vec<EntityId> {
        self.visible
            .iter()
            .filter(|(_, from)| **from == source)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.visible.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }

    pub fn clear(&mut self) -> Vec<EntityId> {
        let ids = self.ids();
        self.visible.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_and_evict_are_idempotent() {
        let mut ledger = VisibilityLedger::default();
        assert!(ledger.admit(EntityId(1), ViewSource::Scene));
        assert!(!ledger.admit(EntityId(1), ViewSource::Peer));
        assert_eq!(ledger.source(EntityId(1)), Some(ViewSource::Scene));
        assert!(ledger.evict(EntityId(1)));
        assert!(!ledger.evict(EntityId(1)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn ids_are_partitioned_by_source() {
        let mut ledger = VisibilityLedger::default();
        ledger.admit(EntityId(3), ViewSource::Peer);
        ledger.admit(EntityId(1), ViewSource::Scene);
        ledger.admit(EntityId(2), ViewSource::Scene);
        assert_eq!(ledger.ids_from(ViewSource::Scene), vec![EntityId(1), EntityId(2)]);
        assert_eq!(ledger.ids_from(ViewSource::Peer), vec![EntityId(3)]);
        assert_eq!(ledger.clear().len(), 3);
    }
}
