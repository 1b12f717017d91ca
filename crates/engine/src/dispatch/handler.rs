use thiserror::Error;

use crate::visibility::NotificationSink;
use crate::world::{PlayerId, WorldManager};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The message is dropped; the session stays up.
    #[error("message rejected: {0}")]
    Rejected(String),
    /// The handler's state can no longer be trusted; the loop contains it as a fault.
    #[error("handler fault: {0}")]
    Fault(String),
}

/// What a handler callback may touch while it runs on the dispatcher thread.
pub struct HandlerContext<'a> {
    pub worlds: &'a mut WorldManager,
    pub sink: &'a mut dyn NotificationSink,
    pub now_ms: u64,
}

/// Gameplay logic living outside the simulation core. Every callback runs on the dispatcher
/// thread, so no locking is needed around `WorldManager`.
pub trait ExternalHandler {
    fn handle_message(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        _player_id: PlayerId,
        _command_id: u32,
        _payload: &[u8],
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    fn on_period(&mut self, _ctx: &mut HandlerContext<'_>, _period_ms: u64) {}

    fn on_player_tick(&mut self, _ctx: &mut HandlerContext<'_>, _player_id: PlayerId) {}

    fn on_timer(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        _player_id: PlayerId,
        _tag: u32,
        _data: &[u8],
    ) {
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ExternalHandler for NoopHandler {}
