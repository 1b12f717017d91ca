use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use engine::config::{ServerConfig, ShutdownConfig, SupervisorConfig};
use engine::dispatch::{
    dispatch_queues, DisconnectReason, Dispatcher, ExternalHandler, HandlerContext, HandlerError,
    InboundCommand, InboundMessage, LocalEvent, NoopHandler, Outbound,
};
use engine::math::Vec3;
use engine::tick::{LoopExit, Supervisor, SupervisorError};
use engine::world::{PlayerId, PlayerSnapshot, SceneId, WorldChoice};

fn joined(id: u32) -> LocalEvent {
    LocalEvent::PlayerJoined {
        snapshot: PlayerSnapshot {
            player_id: PlayerId(id),
            scene_id: SceneId(3),
            position: Vec3::new(id as f32, 0.0, 0.0),
            rotation: Vec3::ZERO,
        },
        choice: WorldChoice::AiWorld,
    }
}

#[test]
fn drain_persists_everyone_before_disconnecting_anyone() {
    let config = ServerConfig {
        shutdown: ShutdownConfig {
            flush_timeout_ms: 2_000,
            disconnect_stagger_ms: 1,
        },
        ..ServerConfig::default()
    };
    let (handles, queues) = dispatch_queues();
    let (outbound_tx, outbound_rx) = unbounded();
    let acker_handles = handles.clone();
    let acker = thread::spawn(move || {
        let mut seen = Vec::new();
        for message in outbound_rx {
            if let Outbound::Persist { snapshot } = &message {
                acker_handles
                    .send_local(LocalEvent::PersistenceFlushed {
                        player_id: snapshot.player_id,
                    })
                    .expect("ack");
            }
            if !matches!(message, Outbound::Notify { .. }) {
                seen.push(message);
            }
        }
        seen
    });

    let mut dispatcher =
        Dispatcher::new(Arc::new(config), NoopHandler, queues, outbound_tx).expect("dispatcher");
    for id in [1, 2, 3] {
        handles.send_local(joined(id)).expect("join");
    }
    handles.send_local(LocalEvent::Drain).expect("drain");
    handles.send_local(joined(4)).expect("late join");

    assert_eq!(dispatcher.run_until_exit(), LoopExit::Drained);
    assert_eq!(dispatcher.worlds().status().players, 0);
    drop(dispatcher);
    drop(handles);

    let seen = acker.join().expect("acker");
    let mut persisted: Vec<PlayerId> = seen
        .iter()
        .filter_map(|message| match message {
            Outbound::Persist { snapshot } => Some(snapshot.player_id),
            _ => None,
        })
        .collect();
    persisted.sort();
    assert_eq!(persisted, vec![PlayerId(1), PlayerId(2), PlayerId(3)]);

    let first_disconnect = seen
        .iter()
        .position(|message| matches!(message, Outbound::Disconnect { .. }))
        .expect("disconnects");
    assert!(seen[..first_disconnect]
        .iter()
        .all(|message| matches!(message, Outbound::Persist { .. })));
    let disconnected: Vec<PlayerId> = seen
        .iter()
        .filter_map(|message| match message {
            Outbound::Disconnect { player_id, reason } => {
                assert_eq!(*reason, DisconnectReason::Shutdown);
                Some(*player_id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(disconnected.len(), 4);
    for id in 1..=4 {
        assert!(disconnected.contains(&PlayerId(id)));
    }
}

struct AlwaysPanics;

impl ExternalHandler for AlwaysPanics {
    fn handle_message(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        player_id: PlayerId,
        _command_id: u32,
        _payload: &[u8],
    ) -> Result<(), HandlerError> {
        panic!("handler panicked for {}", player_id.0);
    }
}

#[test]
fn repeated_faults_inside_the_window_stop_the_supervisor() {
    let config = ServerConfig {
        supervisor: SupervisorConfig {
            max_restarts: 10,
            window_ms: 60_000,
            grace_ms: 0,
        },
        ..ServerConfig::default()
    };
    let (handles, queues) = dispatch_queues();
    let (outbound_tx, _outbound_rx) = unbounded();
    let mut dispatcher =
        Dispatcher::new(Arc::new(config.clone()), AlwaysPanics, queues, outbound_tx)
            .expect("dispatcher");
    for id in 0..11 {
        handles
            .send_inbound(InboundMessage {
                player_id: PlayerId(100 + id),
                command: InboundCommand::Passthrough {
                    command_id: 9,
                    payload: Vec::new(),
                },
            })
            .expect("queue");
    }

    let mut supervisor = Supervisor::new(&config.supervisor);
    let outcome = supervisor.run(|| dispatcher.run_until_exit());
    match outcome {
        Err(SupervisorError::FaultStorm {
            restarts,
            last_fault,
            ..
        }) => {
            assert_eq!(restarts, 11);
            assert!(last_fault.reason.starts_with("handler panicked"));
        }
        other => panic!("expected a fault storm, got {other:?}"),
    }
    drop(handles);
}

#[test]
fn a_single_fault_is_survived_and_the_loop_resumes() {
    let (handles, queues) = dispatch_queues();
    let (outbound_tx, outbound_rx) = unbounded();
    let config = ServerConfig::default();
    let mut dispatcher =
        Dispatcher::new(Arc::new(config.clone()), AlwaysPanics, queues, outbound_tx)
            .expect("dispatcher");
    handles
        .send_inbound(InboundMessage {
            player_id: PlayerId(1),
            command: InboundCommand::Passthrough {
                command_id: 1,
                payload: Vec::new(),
            },
        })
        .expect("queue");
    let hang_up = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        drop(handles);
    });

    let mut supervisor = Supervisor::new(&config.supervisor);
    let mut runs = 0;
    let exit = supervisor
        .run(|| {
            runs += 1;
            dispatcher.run_until_exit()
        })
        .expect("supervisor");
    assert_eq!(exit, LoopExit::ProducersClosed);
    assert_eq!(runs, 2);
    hang_up.join().expect("hang up");
    assert!(outbound_rx.try_iter().any(|message| message
        == Outbound::Disconnect {
            player_id: PlayerId(1),
            reason: DisconnectReason::Fault,
        }));
}
