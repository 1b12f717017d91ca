//! The single-worker dispatch loop and the queues that feed it.

mod dispatcher;
mod drain;
mod handler;
mod messages;
mod metrics;
mod queues;

use thiserror::Error;

use crate::world::PlayerId;

pub use dispatcher::{DispatchItem, Dispatcher, DispatcherError};
pub use drain::{DrainState, DrainStep};
pub use handler::{ExternalHandler, HandlerContext, HandlerError, NoopHandler};
pub use messages::{
    AdminCommand, AdminRequest, DisconnectReason, Envelope, InboundCommand, InboundMessage,
    LocalEvent, Outbound, RetCode,
};
pub use metrics::{DispatchMetricsSnapshot, MetricsHandle};
pub use queues::{dispatch_queues, DispatchQueues, QueueClosed, QueueHandles};

/// A fault contained at the loop boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dispatch fault (actor {actor:?}): {reason}")]
pub struct DispatchFault {
    pub actor: Option<PlayerId>,
    pub reason: String,
}
