use std::collections::BTreeSet;

use tracing::trace;

use crate::aoi::{GridId, SpatialIndex};
use crate::math::Vec3;
use crate::world::{EntityDescriptor, EntityId, PlayerId, WorldError, WorldManager};

use super::ledger::ViewSource;
use super::notify::{
    send_appear, send_disappear, AppearReason, DisappearReason, Notification, NotificationSink,
};

impl WorldManager {
    /// Moves a player in the AI-world peer index (`None` removes it) and exchanges avatar
    /// visibility with every player whose cell entered or left the neighbor block. The
    /// relation is symmetric: whenever the mover gains or loses a peer, the peer gains or loses
    /// the mover.
    pub(crate) fn move_peer(
        &mut self,
        player_id: PlayerId,
        target: Option<Vec3>,
        appear: AppearReason,
        disappear: DisappearReason,
        sink: &mut dyn NotificationSink,
    ) -> Result<(), WorldError> {
        let max_batch = self.config.visibility.max_batch;
        let (world_id, scene_id) = self.player_location(player_id)?;
        let (previous, own_avatar) = self
            .players
            .get(&player_id)
            .map(|player| (player.peer_position, player.avatar))
            .ok_or(WorldError::UnknownPlayer(player_id))?;

        let world = self
            .worlds
            .get_mut(&world_id)
            .ok_or(WorldError::UnknownWorld(world_id))?;
        let index = world
            .peer_index
            .as_mut()
            .ok_or(WorldError::NotInAiWorld(player_id))?;

        let target_grid = target
            .map(|position| index.grid_id_for_position(position))
            .transpose()?;
        let previous_grid = previous
            .map(|position| index.grid_id_for_position(position))
            .transpose()?;
        if previous_grid.is_some() && previous_grid == target_grid {
            if let Some(player) = self.players.get_mut(&player_id) {
                player.peer_position = target;
            }
            return Ok(());
        }

        if let Some(position) = previous {
            index.remove(i64::from(player_id.0), position)?;
        }
        let old_block = neighbor_block(index, previous_grid)?;
        let new_block = neighbor_block(index, target_grid)?;
        let left = occupants(index, old_block.difference(&new_block), player_id);
        let met = occupants(index, new_block.difference(&old_block), player_id);
        if let Some(position) = target {
            index.insert(i64::from(player_id.0), player_id, position)?;
        }
        if let Some(player) = self.players.get_mut(&player_id) {
            player.peer_position = target;
        }
        trace!(
            player_id = player_id.0,
            left = left.len(),
            met = met.len(),
            "peer_grid_changed"
        );

        let scene = self
            .worlds
            .get(&world_id)
            .and_then(|world| world.scenes.get(&scene_id))
            .ok_or(WorldError::UnknownScene(scene_id))?;
        let own_descriptor = own_avatar
            .and_then(|avatar| scene.entity(avatar))
            .map(|entity| entity.descriptor());

        let mut lost_peers = Vec::new();
        for peer in left {
            let Some(other) = self.players.get_mut(&peer) else {
                continue;
            };
            if let Some(avatar) = other.avatar {
                lost_peers.push(avatar);
            }
            if let Some(avatar) = own_avatar {
                if other.ledger.evict(avatar) {
                    sink.deliver(
                        peer,
                        Notification::EntityDisappear {
                            reason: disappear,
                            entity_ids: vec![avatar],
                        },
                    );
                }
            }
        }

        let mut met_peers: Vec<EntityDescriptor> = Vec::new();
        for peer in met {
            let Some(other) = self.players.get_mut(&peer) else {
                continue;
            };
            if let Some(entity) = other.avatar.and_then(|avatar| scene.entity(avatar)) {
                met_peers.push(entity.descriptor());
            }
            if let Some(descriptor) = &own_descriptor {
                if other.ledger.admit(descriptor.entity_id, ViewSource::Peer) {
                    sink.deliver(
                        peer,
                        Notification::EntityAppear {
                            reason: appear,
                            entities: vec![descriptor.clone()],
                        },
                    );
                }
            }
        }

        let player = self
            .players
            .get_mut(&player_id)
            .ok_or(WorldError::UnknownPlayer(player_id))?;
        let lost: Vec<EntityId> = lost_peers
            .into_iter()
            .filter(|avatar| player.ledger.evict(*avatar))
            .collect();
        let gained: Vec<EntityDescriptor> = met_peers
            .into_iter()
            .filter(|descriptor| player.ledger.admit(descriptor.entity_id, ViewSource::Peer))
            .collect();
        send_disappear(sink, player_id, disappear, lost, max_batch);
        send_appear(sink, player_id, appear, gained, max_batch);
        Ok(())
    }
}

fn neighbor_block(
    index: &SpatialIndex<PlayerId>,
    grid: Option<GridId>,
) -> Result<BTreeSet<GridId>, WorldError> {
    match grid {
        Some(grid) => Ok(index.neighbor_grids(grid)?.into_iter().collect()),
        None => Ok(BTreeSet::new()),
    }
}

fn occupants<'a>(
    index: &SpatialIndex<PlayerId>,
    grids: impl Iterator<Item = &'a GridId>,
    exclude: PlayerId,
) -> Vec<PlayerId> {
    let mut found: Vec<PlayerId> = grids
        .filter_map(|grid| index.objects_in_grid(*grid))
        .flat_map(|cell| cell.values().copied())
        .filter(|peer| *peer != exclude)
        .collect();
    found.sort();
    found
}
