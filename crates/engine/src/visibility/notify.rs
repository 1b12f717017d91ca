use serde::Serialize;

use crate::world::{EntityDescriptor, EntityId, FightProp, PlayerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AppearReason {
    Born,
    Meet,
    Transport,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisappearReason {
    Miss,
    Transport,
    Replace,
    Die,
}

/// Messages addressed to one player's session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Notification {
    EntityAppear {
        reason: AppearReason,
        entities: Vec<EntityDescriptor>,
    },
    EntityDisappear {
        reason: DisappearReason,
        entity_ids: Vec<EntityId>,
    },
    FightPropUpdate {
        entity_id: EntityId,
        prop: FightProp,
        value: f32,
    },
    CombatForward {
        source: PlayerId,
        entity_id: EntityId,
        payload: Vec<u8>,
    },
}

/// The caller-supplied send function visibility and combat code deliver through.
pub trait NotificationSink {
    fn deliver(&mut self, player_id: PlayerId, notification: Notification);
}

impl<F> NotificationSink for F
where
    F: FnMut(PlayerId, Notification),
{
    fn deliver(&mut self, player_id: PlayerId, notification: Notification) {
        self(player_id, notification)
    }
}

/// Keeps every delivery in order; used by tests and tooling.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub delivered: Vec<(PlayerId, Notification)>,
}

impl RecordingSink {
    pub fn for_player(&self, player_id: PlayerId) -> Vec<&Notification> {
        self.delivered
            .iter()
            .filter(|(to, _)| *to == player_id)
            .map(|(_, notification)| notification)
            .collect()
    }

    pub fn appeared(&self, player_id: PlayerId) -> Vec<EntityId> {
        self.for_player(player_id)
            .into_iter()
            .flat_map(|notification| match notification {
                Notification::EntityAppear { entities, .. } => {
                    entities.iter().map(|entity| entity.entity_id).collect()
                }
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn disappeared(&self, player_id: PlayerId) -> Vec<EntityId> {
        self.for_player(player_id)
            .into_iter()
            .flat_map(|notification| match notification {
                Notification::EntityDisappear { entity_ids, .. } => entity_ids.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.delivered.clear();
    }
}

impl NotificationSink for RecordingSink {
    fn deliver(&mut self, player_id: PlayerId, notification: Notification) {
        self.delivered.push((player_id, notification));
    }
}

pub(crate) fn send_appear(
    sink: &mut dyn NotificationSink,
    player_id: PlayerId,
    reason: AppearReason,
    entities: Vec<EntityDescriptor>,
    max_batch: usize,
) {
    let max_batch = max_batch.max(1);
    let mut remaining = entities;
    while !remaining.is_empty() {
        let rest = remaining.split_off(remaining.len().min(max_batch));
        sink.deliver(
            player_id,
            Notification::EntityAppear {
                reason,
                entities: remaining,
            },
        );
        remaining = rest;
    }
}

pub(crate) fn send_disappear(
    sink: &mut dyn NotificationSink,
    player_id: PlayerId,
    reason: DisappearReason,
    entity_ids: Vec<EntityId>,
    max_batch: usize,
) {
    for chunk in entity_ids.chunks(max_batch.max(1)) {
        sink.deliver(
            player_id,
            Notification::EntityDisappear {
                reason,
                entity_ids: chunk.to_vec(),
            },
        );
    }
}
