//! Named-participant roster and messaging for an active session
//!
//! This module owns the write side of every participant socket once naming
//! has finished. It provides the broadcast / unicast / private-message
//! discipline the round coordinator speaks through, and it is the single
//! place where send failures are detected: a participant whose socket has
//! gone away is removed from the roster and surfaced through the lost
//! list rather than bubbling up as a fatal error.

use crate::connection::ConnId;
use crate::naming::Participant;
use log::{info, warn};
use shared::ServerOpcode;

/// The set of named, ready participants.
///
/// Roster order is naming order and doubles as the leader-rotation order,
/// so it is kept stable across removals.
pub struct Registry {
    participants: Vec<Participant>,
    lost: Vec<ConnId>,
}

impl Registry {
    pub fn new(participants: Vec<Participant>) -> Self {
        info!(
            "Session roster: {}",
            participants
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self {
            participants,
            lost: Vec::new(),
        }
    }

    /// Returns the number of participants still in the session.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.participants.iter().any(|p| p.id == id)
    }

    pub fn name_of(&self, id: ConnId) -> Option<&str> {
        self.participants
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.name.as_str())
    }

    /// Seat order as `(id, name)` pairs, for seeding the game engine.
    pub fn roster(&self) -> Vec<(ConnId, String)> {
        self.participants
            .iter()
            .map(|p| (p.id, p.name.clone()))
            .collect()
    }

    /// Sends an opcode frame to one participant. A write failure removes
    /// them from the roster and records the loss for the coordinator to
    /// collect via [`take_lost`](Self::take_lost).
    pub async fn send_opcode(&mut self, id: ConnId, opcode: ServerOpcode, parts: &[&str]) {
        let Some(pos) = self.participants.iter().position(|p| p.id == id) else {
            return;
        };
        if let Err(e) = self.participants[pos].conn.send(opcode, parts).await {
            let gone = self.participants.remove(pos);
            warn!("Send to {} failed ({}), dropping them", gone.name, e);
            self.lost.push(gone.id);
        }
    }

    /// Sends an opcode frame to every participant, in roster order.
    pub async fn broadcast_opcode(&mut self, opcode: ServerOpcode, parts: &[&str]) {
        let ids: Vec<ConnId> = self.participants.iter().map(|p| p.id).collect();
        for id in ids {
            self.send_opcode(id, opcode, parts).await;
        }
    }

    /// Plain informational text to one participant.
    pub async fn unicast(&mut self, id: ConnId, text: &str) {
        self.send_opcode(id, ServerOpcode::Message, &[text]).await;
    }

    /// Plain informational text to everyone.
    pub async fn broadcast(&mut self, text: &str) {
        self.broadcast_opcode(ServerOpcode::Message, &[text]).await;
    }

    /// Drains the ids of participants lost to send failures since the
    /// last call.
    pub fn take_lost(&mut self) -> Vec<ConnId> {
        std::mem::take(&mut self.lost)
    }

    /// Removes a participant (already-disconnected peers and cancelled
    /// sessions). Returns the removed entry, if any.
    pub fn remove(&mut self, id: ConnId) -> Option<Participant> {
        let pos = self.participants.iter().position(|p| p.id == id)?;
        let gone = self.participants.remove(pos);
        info!("{} removed from the session", gone.name);
        Some(gone)
    }

    /// Shuts every remaining connection down.
    pub async fn close_all(&mut self) {
        for p in self.participants.iter_mut() {
            p.conn.close().await;
        }
        self.participants.clear();
    }
}
