//! Display-name collection under a deadline.

use crate::connection::{ConnId, Connection, NetEvent};
use crate::session::SessionError;
use log::{debug, info, warn};
use shared::{ClientOpcode, ServerOpcode};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// A connection that completed naming. Insertion order in the result is
/// the later seat order for leader rotation.
#[derive(Debug)]
pub struct Participant {
    pub id: ConnId,
    pub name: String,
    pub conn: Connection,
}

/// Prompts every connection for a display name and multiplexes on the
/// event channel until everyone has answered or the window closes.
///
/// Duplicate names (case-sensitive exact match) and names that are empty
/// or contain whitespace are refused with an error and a fresh prompt;
/// the connection stays pending. Connections still unnamed at the
/// deadline are told so and closed.
pub async fn resolve_names(
    connections: Vec<Connection>,
    window: Duration,
    events: &mut mpsc::UnboundedReceiver<NetEvent>,
) -> Result<Vec<Participant>, SessionError> {
    let deadline = Instant::now() + window;
    let mut pending: HashMap<ConnId, Connection> = HashMap::new();
    let mut named: Vec<Participant> = Vec::new();

    for mut conn in connections {
        let _ = conn.send(ServerOpcode::GetName, &["Choose your name"]).await;
        pending.insert(conn.id, conn);
    }

    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let event = match timeout(remaining, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => break,
        };

        match event {
            NetEvent::Frame {
                conn,
                opcode,
                payload,
            } => {
                if !pending.contains_key(&conn) {
                    debug!("Ignoring frame from non-pending connection {}", conn);
                    continue;
                }
                match ClientOpcode::try_from(opcode) {
                    Ok(ClientOpcode::Name) => {
                        handle_candidate(conn, payload, &mut pending, &mut named).await;
                    }
                    _ => debug!("Ignoring pre-name frame (opcode {}) from {}", opcode, conn),
                }
            }
            NetEvent::Dropped { conn } => {
                if let Some(gone) = pending.remove(&conn) {
                    info!("{} left before choosing a name", gone.addr);
                } else if let Some(pos) = named.iter().position(|p| p.id == conn) {
                    let gone = named.remove(pos);
                    info!("{} ({}) left during naming", gone.name, gone.conn.addr);
                }
            }
        }
    }

    for (_, mut conn) in pending {
        warn!("{} never sent a name, closing", conn.addr);
        let _ = conn
            .send(ServerOpcode::Error, &["You didn't send a name in time!"])
            .await;
        conn.close().await;
    }

    if named.is_empty() {
        return Err(SessionError::NoNames);
    }
    info!(
        "Naming finished with {} players: {}",
        named.len(),
        named
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(named)
}

async fn handle_candidate(
    conn: ConnId,
    candidate: String,
    pending: &mut HashMap<ConnId, Connection>,
    named: &mut Vec<Participant>,
) {
    // Names become single payload tokens later (pm targets, team picks),
    // so whitespace inside one would be unparseable.
    if candidate.is_empty() || candidate.contains(char::is_whitespace) {
        if let Some(c) = pending.get_mut(&conn) {
            let _ = c
                .send(ServerOpcode::Error, &["Names must be a single word!"])
                .await;
            let _ = c.send(ServerOpcode::GetName, &["Pick a new name!"]).await;
        }
        return;
    }
    if named.iter().any(|p| p.name == candidate) {
        if let Some(c) = pending.get_mut(&conn) {
            let _ = c
                .send(ServerOpcode::Error, &["That name is already taken!"])
                .await;
            let _ = c.send(ServerOpcode::GetName, &["Pick a new name!"]).await;
        }
        return;
    }

    let Some(accepted) = pending.remove(&conn) else {
        return;
    };
    info!("{} is now known as {}", accepted.addr, candidate);
    let announcement = format!("{} has chosen name {}!", accepted.addr, candidate);
    named.push(Participant {
        id: conn,
        name: candidate,
        conn: accepted,
    });
    for p in named.iter_mut() {
        let _ = p.conn.send(ServerOpcode::Message, &[&announcement]).await;
    }
    for c in pending.values_mut() {
        let _ = c.send(ServerOpcode::Message, &[&announcement]).await;
    }
}
