//! Per-player visibility: who is told about which entity, and when.
//!
//! Two regimes share one ledger per player. Regular worlds diff each player's view against the
//! per-vision-level entity indexes of its scene, throttled to one pass per check interval, and
//! load or unload config groups around players during the same pass. The AI world additionally
//! tracks players in a symmetric peer index and exchanges avatar visibility on grid crossings.

mod ai_world;
mod ledger;
mod movement;
mod notify;
mod scene_block;

pub use ledger::{ViewSource, VisibilityLedger};
pub use notify::{
    AppearReason, DisappearReason, Notification, NotificationSink, RecordingSink,
};

pub(crate) use notify::send_disappear;
