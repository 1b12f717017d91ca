use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, Sender};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::tick::{plan_base_ticks, LoopExit, TickCadence, TickError, STANDARD_PERIODS_MS};
use crate::visibility::{Notification, NotificationSink};
use crate::world::{EntityId, PlayerId, TimerAction, WorldError, WorldManager};

use super::drain::{DrainState, DrainStep};
use super::handler::{ExternalHandler, HandlerContext, HandlerError};
use super::messages::{
    AdminCommand, AdminRequest, DisconnectReason, Envelope, InboundCommand, InboundMessage,
    LocalEvent, Outbound,
};
use super::metrics::{MetricsAccumulator, MetricsHandle};
use super::queues::DispatchQueues;
use super::DispatchFault;

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tick(#[from] TickError),
}

/// One unit of work taken from a producer queue or the ticker.
#[derive(Debug, Clone)]
pub enum DispatchItem {
    Inbound(InboundMessage),
    Tick,
    Local(LocalEvent),
    Admin(AdminRequest),
}

impl DispatchItem {
    /// The player the item acts on behalf of, if any. A fault while processing it disconnects
    /// that player.
    pub fn actor(&self) -> Option<PlayerId> {
        match self {
            Self::Inbound(message) => Some(message.player_id),
            Self::Tick => None,
            Self::Local(LocalEvent::PlayerJoined { snapshot, .. }) => Some(snapshot.player_id),
            Self::Local(LocalEvent::PlayerLeft { player_id })
            | Self::Local(LocalEvent::ScheduleTimer { player_id, .. }) => Some(*player_id),
            Self::Local(LocalEvent::PersistenceFlushed { .. }) | Self::Local(LocalEvent::Drain) => {
                None
            }
            Self::Admin(request) => match &request.command {
                AdminCommand::Teleport { player_id, .. }
                | AdminCommand::CreateMonster { player_id, .. }
                | AdminCommand::CreateGadget { player_id, .. } => Some(*player_id),
                AdminCommand::KillEntity { .. } | AdminCommand::Status => None,
            },
        }
    }
}

/// Forwards notifications onto the outbound channel.
struct OutboundSink<'a> {
    outbound: &'a Sender<Outbound>,
    delivered: u64,
}

impl<'a> OutboundSink<'a> {
    fn new(outbound: &'a Sender<Outbound>) -> Self {
        Self {
            outbound,
            delivered: 0,
        }
    }
}

impl NotificationSink for OutboundSink<'_> {
    fn deliver(&mut self, player_id: PlayerId, notification: Notification) {
        self.delivered = self.delivered.saturating_add(1);
        if self
            .outbound
            .send(Outbound::Notify {
                player_id,
                notification,
            })
            .is_err()
        {
            trace!(player_id = player_id.0, "outbound_closed");
        }
    }
}

/// The single worker that owns all simulation state. Items are processed one at a time to
/// completion, so nothing it touches needs a lock.
pub struct Dispatcher<H: ExternalHandler> {
    worlds: WorldManager,
    handler: H,
    queues: DispatchQueues,
    outbound: Sender<Outbound>,
    cadence: TickCadence,
    max_catch_up_ticks: u32,
    metrics: MetricsAccumulator,
    metrics_handle: MetricsHandle,
    drain: DrainState,
}

impl<H: ExternalHandler> Dispatcher<H> {
    pub fn new(
        config: Arc<ServerConfig>,
        handler: H,
        queues: DispatchQueues,
        outbound: Sender<Outbound>,
    ) -> Result<Self, DispatcherError> {
        let mut cadence = TickCadence::new(config.tick.base_ms)?;
        for period_ms in STANDARD_PERIODS_MS {
            if period_ms % config.tick.base_ms == 0 {
                cadence.register(period_ms)?;
            } else {
                warn!(period_ms, base_ms = config.tick.base_ms, "period_skipped");
            }
        }
        let metrics_interval = Duration::from_millis(config.tick.metrics_period_ms);
        let max_catch_up_ticks = config.tick.max_catch_up_ticks.max(1);
        let drain = DrainState::new(&config.shutdown);
        let worlds = WorldManager::new(config)?;
        Ok(Self {
            worlds,
            handler,
            queues,
            outbound,
            cadence,
            max_catch_up_ticks,
            metrics: MetricsAccumulator::new(metrics_interval),
            metrics_handle: MetricsHandle::default(),
            drain,
        })
    }

    pub fn worlds(&self) -> &WorldManager {
        &self.worlds
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn metrics_handle(&self) -> MetricsHandle {
        self.metrics_handle.clone()
    }

    /// Logical time in milliseconds, derived from the base-tick counter.
    pub fn now_ms(&self) -> u64 {
        self.cadence.elapsed_ms()
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_draining()
    }

    /// Waits on every producer queue and the ticker, processing one ready item per iteration
    /// until the drain completes, the producers hang up, or an item faults.
    pub fn run_until_exit(&mut self) -> LoopExit {
        let base = Duration::from_millis(self.cadence.base_ms());
        let ticker = tick(base);
        let mut last_wake = Instant::now();
        let mut owed = Duration::ZERO;
        info!(
            base_ms = self.cadence.base_ms(),
            max_catch_up_ticks = self.max_catch_up_ticks,
            "dispatch_loop_started"
        );

        loop {
            if let Some(exit) = self.poll_drain(Instant::now()) {
                return exit;
            }

            let item = select! {
                recv(self.queues.inbound) -> message => match message {
                    Ok(message) => DispatchItem::Inbound(message),
                    Err(_) => return LoopExit::ProducersClosed,
                },
                recv(self.queues.local) -> event => match event {
                    Ok(event) => DispatchItem::Local(event),
                    Err(_) => return LoopExit::ProducersClosed,
                },
                recv(self.queues.admin) -> request => match request {
                    Ok(request) => DispatchItem::Admin(request),
                    Err(_) => return LoopExit::ProducersClosed,
                },
                recv(ticker) -> _ => DispatchItem::Tick,
            };

            let result = match item {
                DispatchItem::Tick => {
                    let now = Instant::now();
                    owed = owed.saturating_add(now.saturating_duration_since(last_wake));
                    last_wake = now;
                    let plan = plan_base_ticks(owed, base, self.max_catch_up_ticks);
                    owed = plan.remaining;
                    if plan.dropped_backlog > Duration::ZERO {
                        self.metrics.record_dropped_backlog(plan.dropped_backlog);
                        warn!(
                            dropped_backlog_ms = plan.dropped_backlog.as_millis() as u64,
                            max_catch_up_ticks = self.max_catch_up_ticks,
                            "tick_clamp_triggered"
                        );
                    }
                    let mut result = Ok(());
                    for _ in 0..plan.ticks_to_run {
                        result = self.dispatch_guarded(DispatchItem::Tick);
                        if result.is_err() {
                            break;
                        }
                    }
                    result
                }
                item => self.dispatch_guarded(item),
            };
            if let Err(fault) = result {
                return LoopExit::Faulted(fault);
            }

            if let Some(snapshot) = self.metrics.maybe_snapshot(Instant::now()) {
                self.metrics_handle.publish(snapshot);
                let status = self.worlds.status();
                info!(
                    tps = snapshot.tps,
                    messages_per_second = snapshot.messages_per_second,
                    notifications_per_second = snapshot.notifications_per_second,
                    mean_dispatch_us = snapshot.mean_dispatch_us,
                    players = status.players,
                    entities = status.entities,
                    projectiles = status.projectiles,
                    "dispatch_metrics"
                );
            }
        }
    }

    /// Processes one item behind the loop boundary. Panics and handler faults are contained:
    /// the acting player, if any, is disconnected and the fault is returned to the caller.
    pub fn dispatch_guarded(&mut self, item: DispatchItem) -> Result<(), DispatchFault> {
        let actor = item.actor();
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(item)));
        self.metrics.record_dispatch(started.elapsed());

        let fault = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(fault)) => fault,
            Err(payload) => DispatchFault {
                actor,
                reason: panic_message(payload.as_ref()),
            },
        };
        error!(
            actor = ?fault.actor.map(|player| player.0),
            reason = %fault.reason,
            "dispatch_fault"
        );
        if let Some(player_id) = fault.actor {
            self.force_disconnect(player_id, DisconnectReason::Fault);
        }
        Err(fault)
    }

    /// Processes one item to completion.
    pub fn process(&mut self, item: DispatchItem) -> Result<(), DispatchFault> {
        match item {
            DispatchItem::Inbound(message) => {
                self.metrics.record_message();
                self.handle_inbound(message)
            }
            DispatchItem::Tick => {
                self.metrics.record_tick();
                self.run_base_tick()
            }
            DispatchItem::Local(event) => {
                self.handle_local(event);
                Ok(())
            }
            DispatchItem::Admin(request) => {
                self.handle_admin(request);
                Ok(())
            }
        }
    }

    /// Advances the drain state machine. Returns the loop exit once the drain has finished.
    pub fn poll_drain(&mut self, now: Instant) -> Option<LoopExit> {
        loop {
            match self.drain.poll(now) {
                DrainStep::Idle | DrainStep::Wait => return None,
                DrainStep::Disconnect(player_id) => {
                    self.force_disconnect(player_id, DisconnectReason::Shutdown);
                }
                DrainStep::Teardown => {
                    self.worlds.teardown();
                    info!("drain_finished");
                    return Some(LoopExit::Drained);
                }
                DrainStep::Done => return Some(LoopExit::Drained),
            }
        }
    }

    fn handle_inbound(&mut self, message: InboundMessage) -> Result<(), DispatchFault> {
        let InboundMessage { player_id, command } = message;
        let name = command.name();
        let now_ms = self.cadence.elapsed_ms();
        let mut sink = OutboundSink::new(&self.outbound);

        let result = match command {
            InboundCommand::EntityMove(report) => {
                self.worlds
                    .apply_entity_move(player_id, report, now_ms, &mut sink)
            }
            InboundCommand::CombatForward {
                target,
                entity_id,
                payload,
            } => self
                .worlds
                .forward_combat(player_id, target, entity_id, payload, &mut sink),
            InboundCommand::ProjectileFire(launch) => self
                .worlds
                .fire_projectile(player_id, launch, &mut sink)
                .map(|_| ()),
            InboundCommand::EntityDestroy { entity_id } => {
                self.worlds
                    .destroy_client_entity(player_id, entity_id, &mut sink)
            }
            InboundCommand::Passthrough {
                command_id,
                payload,
            } => {
                let mut ctx = HandlerContext {
                    worlds: &mut self.worlds,
                    sink: &mut sink,
                    now_ms,
                };
                match self
                    .handler
                    .handle_message(&mut ctx, player_id, command_id, &payload)
                {
                    Ok(()) => Ok(()),
                    Err(HandlerError::Rejected(reason)) => {
                        warn!(player_id = player_id.0, command_id, %reason, "handler_rejected");
                        Ok(())
                    }
                    Err(HandlerError::Fault(reason)) => {
                        self.metrics.record_notifications(sink.delivered);
                        return Err(DispatchFault {
                            actor: Some(player_id),
                            reason,
                        });
                    }
                }
            }
        };
        self.metrics.record_notifications(sink.delivered);
        if let Err(error) = result {
            log_rejected(player_id, name, &error);
        }
        Ok(())
    }

    fn run_base_tick(&mut self) -> Result<(), DispatchFault> {
        let fired = self.cadence.advance();
        let base_ms = self.cadence.base_ms();
        let now_ms = self.cadence.elapsed_ms();
        let mut sink = OutboundSink::new(&self.outbound);

        self.worlds.advance_scene_time(base_ms);
        let events = self.worlds.step_physics(base_ms, &mut sink);
        if !events.is_empty() {
            trace!(events = events.len(), now_ms, "physics_events");
        }
        self.worlds.flush_pending_visibility(now_ms, &mut sink);

        for (player_id, action) in self.worlds.take_due_timers(now_ms) {
            match action {
                TimerAction::RefreshVisibility => {
                    if let Err(error) =
                        self.worlds
                            .refresh_visibility(player_id, now_ms, &mut sink)
                    {
                        log_rejected(player_id, "timer_refresh", &error);
                    }
                }
                TimerAction::Handler { tag, data } => {
                    let mut ctx = HandlerContext {
                        worlds: &mut self.worlds,
                        sink: &mut sink,
                        now_ms,
                    };
                    self.handler.on_timer(&mut ctx, player_id, tag, &data);
                }
            }
        }

        for player_id in self.worlds.due_player_ticks(now_ms) {
            let mut ctx = HandlerContext {
                worlds: &mut self.worlds,
                sink: &mut sink,
                now_ms,
            };
            self.handler.on_player_tick(&mut ctx, player_id);
        }

        for period in fired {
            let mut ctx = HandlerContext {
                worlds: &mut self.worlds,
                sink: &mut sink,
                now_ms,
            };
            self.handler.on_period(&mut ctx, period.period_ms);
        }
        self.metrics.record_notifications(sink.delivered);
        Ok(())
    }

    fn handle_local(&mut self, event: LocalEvent) {
        let now_ms = self.cadence.elapsed_ms();
        let mut sink = OutboundSink::new(&self.outbound);
        match event {
            LocalEvent::PlayerJoined { snapshot, choice } => {
                let player_id = snapshot.player_id;
                if self.drain.is_draining() {
                    warn!(player_id = player_id.0, "join_rejected_while_draining");
                    self.send_outbound(Outbound::Disconnect {
                        player_id,
                        reason: DisconnectReason::Shutdown,
                    });
                } else if let Err(error) =
                    self.worlds
                        .player_join(snapshot, choice, now_ms, &mut sink)
                {
                    log_rejected(player_id, "player_join", &error);
                }
            }
            LocalEvent::PlayerLeft { player_id } => {
                match self.worlds.player_leave(player_id, &mut sink) {
                    Ok(snapshot) => self.send_outbound(Outbound::Persist { snapshot }),
                    Err(error) => log_rejected(player_id, "player_leave", &error),
                }
            }
            LocalEvent::PersistenceFlushed { player_id } => {
                let was_pending = self.drain.acknowledge(player_id);
                debug!(player_id = player_id.0, was_pending, "persistence_flushed");
            }
            LocalEvent::ScheduleTimer {
                player_id,
                delay_ms,
                action,
            } => {
                if let Err(error) = self
                    .worlds
                    .schedule_timer(player_id, now_ms, delay_ms, action)
                {
                    log_rejected(player_id, "schedule_timer", &error);
                }
            }
            LocalEvent::Drain => {
                let players = self.worlds.online_players();
                if self.drain.begin(players.clone(), Instant::now()) {
                    for player_id in players {
                        if let Some(player) = self.worlds.player(player_id) {
                            let snapshot = player.snapshot();
                            self.send_outbound(Outbound::Persist { snapshot });
                        }
                    }
                }
            }
        }
        self.metrics.record_notifications(sink.delivered);
    }

    fn handle_admin(&mut self, request: AdminRequest) {
        let AdminRequest { command, reply } = request;
        let name = command.name();
        let now_ms = self.cadence.elapsed_ms();
        let mut sink = OutboundSink::new(&self.outbound);

        let result = match command {
            AdminCommand::Teleport {
                player_id,
                scene_id,
                position,
            } => self
                .worlds
                .teleport(player_id, scene_id, position, now_ms, &mut sink)
                .map(|()| format!("player {} moved to scene {}", player_id.0, scene_id.0)),
            AdminCommand::KillEntity { entity_id } => self
                .worlds
                .kill_entity(entity_id, &mut sink)
                .map(|()| format!("entity {} killed", entity_id.0)),
            AdminCommand::CreateMonster {
                player_id,
                monster_id,
                position,
                count,
            } => self
                .worlds
                .create_monster(player_id, monster_id, position, count, &mut sink)
                .map(|ids| format_ids(&ids)),
            AdminCommand::CreateGadget {
                player_id,
                gadget_id,
                position,
                count,
            } => self
                .worlds
                .create_gadget(player_id, gadget_id, position, count, &mut sink)
                .map(|ids| format_ids(&ids)),
            AdminCommand::Status => Ok(serde_json::to_string(&self.worlds.status())
                .unwrap_or_else(|error| format!("status unavailable: {error}"))),
        };
        self.metrics.record_notifications(sink.delivered);

        match &result {
            Ok(_) => info!(command = name, "admin_command_applied"),
            Err(error) => warn!(command = name, error = %error, "admin_command_failed"),
        }
        if let Some(reply) = reply {
            if reply.send(Envelope::from(result)).is_err() {
                debug!(command = name, "admin_reply_dropped");
            }
        }
    }

    fn force_disconnect(&mut self, player_id: PlayerId, reason: DisconnectReason) {
        let mut sink = OutboundSink::new(&self.outbound);
        let left = panic::catch_unwind(AssertUnwindSafe(|| {
            self.worlds.player_leave(player_id, &mut sink)
        }));
        match left {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => debug!(player_id = player_id.0, error = %error, "disconnect_without_state"),
            Err(payload) => error!(
                player_id = player_id.0,
                reason = %panic_message(payload.as_ref()),
                "disconnect_cleanup_faulted"
            ),
        }
        self.send_outbound(Outbound::Disconnect { player_id, reason });
        info!(player_id = player_id.0, reason = ?reason, "player_disconnected");
    }

    fn send_outbound(&self, message: Outbound) {
        if self.outbound.send(message).is_err() {
            warn!("outbound_closed");
        }
    }
}

fn log_rejected(player_id: PlayerId, operation: &'static str, error: &WorldError) {
    if error.is_stale_reference() {
        debug!(player_id = player_id.0, operation, error = %error, "stale_reference");
    } else {
        warn!(player_id = player_id.0, operation, error = %error, "request_rejected");
    }
}

fn format_ids(ids: &[EntityId]) -> String {
    ids.iter()
        .map(|id| id.0.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
