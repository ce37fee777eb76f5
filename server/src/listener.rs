//! Time-bounded connection acceptance.

use crate::connection::{ConnId, Connection, NetEvent};
use crate::session::SessionError;
use log::{info, warn};
use shared::ServerOpcode;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Accepts up to `max_count` connections before the deadline, telling
/// everyone already in about each newcomer. Partial success is valid;
/// zero connections is not.
pub async fn accept_participants(
    listener: &TcpListener,
    max_count: usize,
    window: Duration,
    events: &mpsc::UnboundedSender<NetEvent>,
) -> Result<Vec<Connection>, SessionError> {
    let deadline = Instant::now() + window;
    let mut accepted: Vec<Connection> = Vec::new();
    let mut next_id: ConnId = 1;

    while accepted.len() < max_count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, listener.accept()).await {
            Ok(Ok((stream, addr))) => {
                info!(
                    "{} connected ({} of {})",
                    addr,
                    accepted.len() + 1,
                    max_count
                );
                accepted.push(Connection::spawn(next_id, stream, addr, events.clone()));
                next_id += 1;

                let notice = format!("{} connected!", addr);
                for conn in accepted.iter_mut() {
                    let _ = conn.send(ServerOpcode::Message, &[&notice]).await;
                }
            }
            Ok(Err(e)) => warn!("Accept failed: {}", e),
            Err(_) => break,
        }
    }

    if accepted.is_empty() {
        return Err(SessionError::NoParticipants);
    }
    info!("Accept window closed with {} connected", accepted.len());
    Ok(accepted)
}
