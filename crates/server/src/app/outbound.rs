use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use engine::dispatch::{LocalEvent, Outbound, QueueHandles};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct OutboundStats {
    pub(crate) notifications: u64,
    pub(crate) persisted: u64,
    pub(crate) disconnects: u64,
}

/// Stands in for the session transport and the persistence layer: logs every delivery and
/// acknowledges each persistence request straight away. Runs until the dispatcher drops its
/// sender.
pub(crate) fn spawn(
    outbound: Receiver<Outbound>,
    handles: QueueHandles,
) -> io::Result<JoinHandle<OutboundStats>> {
    thread::Builder::new()
        .name("outbound".to_string())
        .spawn(move || {
            let mut stats = OutboundStats::default();
            for message in outbound {
                match message {
                    Outbound::Notify {
                        player_id,
                        notification,
                    } => {
                        stats.notifications += 1;
                        trace!(player_id = player_id.0, ?notification, "notify");
                    }
                    Outbound::Persist { snapshot } => {
                        stats.persisted += 1;
                        debug!(
                            player_id = snapshot.player_id.0,
                            scene_id = snapshot.scene_id.0,
                            "player_persisted"
                        );
                        let ack = LocalEvent::PersistenceFlushed {
                            player_id: snapshot.player_id,
                        };
                        if let Err(err) = handles.send_local(ack) {
                            warn!(error = %err, "persistence_ack_dropped");
                        }
                    }
                    Outbound::Disconnect { player_id, reason } => {
                        stats.disconnects += 1;
                        info!(player_id = player_id.0, ?reason, "session_closed");
                    }
                }
            }
            stats
        })
}
