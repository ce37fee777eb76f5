//! Session lifecycle orchestration: lobby, naming, game, conclusion.

use crate::connection::NetEvent;
use crate::engine::{Effect, Engine, Phase};
use crate::listener::accept_participants;
use crate::naming::resolve_names;
use crate::registry::Registry;
use log::{info, warn};
use shared::{ClientOpcode, Role, ServerOpcode, MAX_PARTICIPANTS, MIN_PARTICIPANTS};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// External knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Hard ceiling on connections accepted (5..=10).
    pub max_participants: usize,
    pub connect_timeout: Duration,
    pub naming_timeout: Duration,
}

/// Fatal session failures. Recoverable protocol trouble never surfaces
/// here; it is answered on the wire with an `error` frame instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("nobody connected before the deadline")]
    NoParticipants,
    #[error("nobody sent a name before the deadline")]
    NoNames,
    #[error("{got} named players is not enough to start (need at least {need})")]
    TooFewParticipants { got: usize, need: usize },
    #[error("max participants must be between 5 and 10, got {0}")]
    InvalidCapacity(usize),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Where the session currently is in its life, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Lobby,
    Naming,
    InProgress,
    Concluded,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Winner(Role),
    Cancelled,
}

/// Binds the configured address and runs one full session to its end.
pub async fn run(config: SessionConfig) -> Result<SessionOutcome, SessionError> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| SessionError::Bind {
            addr: addr.clone(),
            source,
        })?;
    run_with_listener(listener, &config).await
}

/// Runs a session on an already-bound listener (tests bind their own
/// ephemeral ports).
pub async fn run_with_listener(
    listener: TcpListener,
    config: &SessionConfig,
) -> Result<SessionOutcome, SessionError> {
    if !(MIN_PARTICIPANTS..=MAX_PARTICIPANTS).contains(&config.max_participants) {
        return Err(SessionError::InvalidCapacity(config.max_participants));
    }
    let mut state = SessionState::Lobby;
    if let Ok(addr) = listener.local_addr() {
        info!("Session open on {} ({:?})", addr, state);
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let connections = accept_participants(
        &listener,
        config.max_participants,
        config.connect_timeout,
        &events_tx,
    )
    .await?;
    // Reader tasks hold their own clones; keeping ours would stop the
    // channel from ever closing.
    drop(events_tx);

    state = SessionState::Naming;
    info!("Collecting names ({:?})", state);
    let participants = resolve_names(connections, config.naming_timeout, &mut events_rx).await?;

    if participants.len() < MIN_PARTICIPANTS {
        let got = participants.len();
        warn!(
            "Only {} of the required {} players named up, refusing to start",
            got, MIN_PARTICIPANTS
        );
        let mut registry = Registry::new(participants);
        registry
            .broadcast_opcode(
                ServerOpcode::Error,
                &["Not enough players to start the game!"],
            )
            .await;
        registry.close_all().await;
        return Err(SessionError::TooFewParticipants {
            got,
            need: MIN_PARTICIPANTS,
        });
    }

    let mut registry = Registry::new(participants);
    state = SessionState::InProgress;
    info!("Starting with {} players ({:?})", registry.len(), state);

    let roster = registry.roster();
    let Some(mut engine) = Engine::new(&roster, &mut rand::thread_rng()) else {
        // Unreachable given the checks above, but never panic on it.
        let got = registry.len();
        registry.close_all().await;
        return Err(SessionError::TooFewParticipants {
            got,
            need: MIN_PARTICIPANTS,
        });
    };

    let fx = engine.start();
    apply_effects(&mut registry, fx).await;
    process_lost(&mut registry, &mut engine).await;

    loop {
        if let Some(outcome) = finished(&engine) {
            state = match outcome {
                SessionOutcome::Winner(_) => SessionState::Concluded,
                SessionOutcome::Cancelled => SessionState::Cancelled,
            };
            info!("Session over: {:?} ({:?})", outcome, state);
            registry.close_all().await;
            return Ok(outcome);
        }

        let event = match events_rx.recv().await {
            Some(event) => event,
            None => {
                warn!("Every connection is gone, abandoning the session");
                return Ok(SessionOutcome::Cancelled);
            }
        };

        match event {
            NetEvent::Frame {
                conn,
                opcode,
                payload,
            } => {
                if !registry.contains(conn) {
                    continue;
                }
                match ClientOpcode::try_from(opcode) {
                    Ok(op) => {
                        let fx = engine.handle(conn, op, &payload);
                        apply_effects(&mut registry, fx).await;
                    }
                    Err(e) => {
                        warn!("Bad frame from {:?}: {}", registry.name_of(conn), e);
                        registry
                            .send_opcode(conn, ServerOpcode::Error, &["Unrecognized opcode"])
                            .await;
                    }
                }
            }
            NetEvent::Dropped { conn } => {
                if registry.remove(conn).is_some() {
                    let fx = engine.remove_player(conn);
                    apply_effects(&mut registry, fx).await;
                }
            }
        }
        process_lost(&mut registry, &mut engine).await;
    }
}

fn finished(engine: &Engine) -> Option<SessionOutcome> {
    match engine.phase() {
        Phase::Concluded(winner) => Some(SessionOutcome::Winner(winner)),
        Phase::Cancelled => Some(SessionOutcome::Cancelled),
        _ => None,
    }
}

async fn apply_effects(registry: &mut Registry, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Broadcast(opcode, text) => registry.broadcast_opcode(opcode, &[&text]).await,
            Effect::Unicast(to, opcode, text) => registry.send_opcode(to, opcode, &[&text]).await,
        }
    }
}

/// Participants lost to send failures are fed back into the engine until
/// the registry reports no further casualties.
async fn process_lost(registry: &mut Registry, engine: &mut Engine) {
    loop {
        let lost = registry.take_lost();
        if lost.is_empty() {
            break;
        }
        for id in lost {
            let fx = engine.remove_player(id);
            apply_effects(registry, fx).await;
        }
    }
}
