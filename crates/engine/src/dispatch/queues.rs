use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use thiserror::Error;

use super::messages::{AdminCommand, AdminRequest, Envelope, InboundMessage, LocalEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dispatch queue '{0}' is closed")]
pub struct QueueClosed(pub &'static str);

/// Producer side of the three dispatcher inputs. Cheap to clone; one per session thread,
/// persistence worker or admin surface.
#[derive(Debug, Clone)]
pub struct QueueHandles {
    inbound: Sender<InboundMessage>,
    local: Sender<LocalEvent>,
    admin: Sender<AdminRequest>,
}

/// Consumer side, owned by the dispatcher.
#[derive(Debug)]
pub struct DispatchQueues {
    pub(crate) inbound: Receiver<InboundMessage>,
    pub(crate) local: Receiver<LocalEvent>,
    pub(crate) admin: Receiver<AdminRequest>,
}

pub fn dispatch_queues() -> (QueueHandles, DispatchQueues) {
    let (inbound_tx, inbound_rx) = unbounded();
    let (local_tx, local_rx) = unbounded();
    let (admin_tx, admin_rx) = unbounded();
    (
        QueueHandles {
            inbound: inbound_tx,
            local: local_tx,
            admin: admin_tx,
        },
        DispatchQueues {
            inbound: inbound_rx,
            local: local_rx,
            admin: admin_rx,
        },
    )
}

impl QueueHandles {
    pub fn send_inbound(&self, message: InboundMessage) -> Result<(), QueueClosed> {
        self.inbound
            .send(message)
            .map_err(|_| QueueClosed("inbound"))
    }

    pub fn send_local(&self, event: LocalEvent) -> Result<(), QueueClosed> {
        self.local.send(event).map_err(|_| QueueClosed("local"))
    }

    /// Queues an admin command and returns the channel its reply will arrive on.
    pub fn send_admin(
        &self,
        command: AdminCommand,
    ) -> Result<Receiver<Envelope<String>>, QueueClosed> {
        let (reply_tx, reply_rx) = bounded(1);
        self.admin
            .send(AdminRequest {
                command,
                reply: Some(reply_tx),
            })
            .map_err(|_| QueueClosed("admin"))?;
        Ok(reply_rx)
    }
}

impl DispatchQueues {
    pub fn pending(&self) -> usize {
        self.inbound.len() + self.local.len() + self.admin.len()
    }
}
