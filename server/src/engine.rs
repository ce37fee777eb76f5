//! Round-coordination state machine.
//!
//! Pure game logic: the engine consumes participant actions and emits
//! messaging effects, never touching a socket. Every point where the game
//! waits on players (team proposal, the public vote, the covert mission
//! cards) is a phase with an explicit pending set, so a scripted sequence
//! of events drives an entire game deterministically.

use crate::connection::ConnId;
use log::{debug, info};
use rand::Rng;
use shared::{ClientOpcode, Role, ServerOpcode, MAX_FAILED_VOTES, WINS_NEEDED};
use std::collections::{HashMap, HashSet};

/// Outbound messaging produced by the engine, applied by the session
/// driver through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Broadcast(ServerOpcode, String),
    Unicast(ConnId, ServerOpcode, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ProposingTeam,
    Voting,
    CollectingMissionVotes,
    Concluded(Role),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionOutcome {
    Success,
    Failure,
}

/// One resolved round, immutable once appended.
#[derive(Debug, Clone)]
pub struct MissionRecord {
    pub round: usize,
    pub team: Vec<String>,
    pub votes_for_team: HashMap<String, bool>,
    pub sabotage_votes: HashMap<String, bool>,
    pub outcome: MissionOutcome,
}

#[derive(Debug, Clone)]
struct Seat {
    id: ConnId,
    name: String,
    role: Role,
}

pub struct Engine {
    seats: Vec<Seat>,
    owner: ConnId,
    schedule: [usize; 5],
    phase: Phase,
    leader: usize,
    round: usize,
    records: Vec<MissionRecord>,
    failed_votes: u32,
    team: Vec<ConnId>,
    /// true = approve
    ballots: HashMap<ConnId, bool>,
    /// true = fail
    cards: HashMap<ConnId, bool>,
    /// Who still owes a response in the current phase.
    pending: HashSet<ConnId>,
}

impl Engine {
    /// Deals roles and picks the first leader. Returns `None` when the
    /// roster size has no mission schedule (outside 5..=10).
    ///
    /// The schedule is fixed from the starting count and does not shrink
    /// if players drop out later.
    pub fn new(roster: &[(ConnId, String)], rng: &mut impl Rng) -> Option<Self> {
        let n = roster.len();
        let schedule = shared::team_sizes(n)?;
        let infiltrators = shared::infiltrator_count(n);
        let chosen: HashSet<usize> = rand::seq::index::sample(rng, n, infiltrators)
            .into_iter()
            .collect();
        let seats: Vec<Seat> = roster
            .iter()
            .enumerate()
            .map(|(i, (id, name))| Seat {
                id: *id,
                name: name.clone(),
                role: if chosen.contains(&i) {
                    Role::Infiltrator
                } else {
                    Role::Loyal
                },
            })
            .collect();
        let owner = seats[0].id;
        let leader = rng.gen_range(0..n);

        Some(Self {
            seats,
            owner,
            schedule,
            phase: Phase::ProposingTeam,
            leader,
            round: 0,
            records: Vec::new(),
            failed_votes: 0,
            team: Vec::new(),
            ballots: HashMap::new(),
            cards: HashMap::new(),
            pending: HashSet::new(),
        })
    }

    /// Opens the game: announces the roster, privately deals every card,
    /// and hands the first leader the proposal prompt. Loyal players
    /// learn only their own side; infiltrators additionally learn each
    /// other.
    pub fn start(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        fx.push(Effect::Broadcast(
            ServerOpcode::GameStart,
            self.seat_names().join(" "),
        ));
        for seat in &self.seats {
            let card = match seat.role {
                Role::Loyal => "loyal".to_string(),
                Role::Infiltrator => {
                    let fellows: Vec<&str> = self
                        .seats
                        .iter()
                        .filter(|s| s.role == Role::Infiltrator && s.id != seat.id)
                        .map(|s| s.name.as_str())
                        .collect();
                    if fellows.is_empty() {
                        "infiltrator".to_string()
                    } else {
                        format!("infiltrator {}", fellows.join(" "))
                    }
                }
            };
            fx.push(Effect::Unicast(seat.id, ServerOpcode::Card, card));
        }
        info!(
            "Roles dealt: {} infiltrators among {} players",
            self.infiltrator_ids().len(),
            self.seats.len()
        );
        fx.extend(self.open_proposal());
        fx
    }

    /// Feeds one participant action through the state machine.
    pub fn handle(&mut self, actor: ConnId, opcode: ClientOpcode, payload: &str) -> Vec<Effect> {
        if matches!(self.phase, Phase::Concluded(_) | Phase::Cancelled) {
            return Vec::new();
        }
        if self.seat_index(actor).is_none() {
            return Vec::new();
        }
        match opcode {
            ClientOpcode::Name => vec![self.error_to(actor, "You already have a name!")],
            ClientOpcode::Message => self.on_chat(actor, payload),
            ClientOpcode::SendPm => self.on_pm(actor, payload),
            ClientOpcode::Approve => self.on_ballot(actor, true),
            ClientOpcode::Reject => self.on_ballot(actor, false),
            ClientOpcode::TeamAdd => self.on_team_change(actor, payload, true),
            ClientOpcode::TeamRemove => self.on_team_change(actor, payload, false),
            ClientOpcode::Success => self.on_card(actor, false),
            ClientOpcode::Fail => self.on_card(actor, true),
        }
    }

    /// Drops a participant from the game: out of the seat order, the
    /// pending set, the ballots and the team. Quorums shrink accordingly
    /// and a wait that just became complete resolves immediately.
    pub fn remove_player(&mut self, id: ConnId) -> Vec<Effect> {
        let Some(idx) = self.seat_index(id) else {
            return Vec::new();
        };
        let seat = self.seats.remove(idx);
        info!("{} has left the game", seat.name);
        let mut fx = vec![Effect::Broadcast(
            ServerOpcode::Message,
            format!("{} has left the game!", seat.name),
        )];

        if matches!(self.phase, Phase::Concluded(_) | Phase::Cancelled) {
            return fx;
        }
        if self.seats.is_empty() {
            self.phase = Phase::Cancelled;
            return fx;
        }

        let was_leader = idx == self.leader;
        if idx < self.leader {
            self.leader -= 1;
        }
        if self.leader >= self.seats.len() {
            self.leader = 0;
        }
        self.ballots.remove(&id);
        self.cards.remove(&id);
        self.pending.remove(&id);
        let was_on_team = self.team.contains(&id);
        self.team.retain(|&m| m != id);

        if self.seats.len() < self.required_size() {
            fx.extend(self.conclude(
                Role::Infiltrator,
                "Too few players remain to field a mission team!",
            ));
            return fx;
        }

        match self.phase {
            Phase::ProposingTeam => {
                if was_leader {
                    fx.extend(self.open_proposal());
                } else if was_on_team {
                    fx.push(Effect::Broadcast(ServerOpcode::TeamRemove, seat.name));
                }
            }
            Phase::Voting => {
                if was_on_team {
                    fx.push(Effect::Broadcast(
                        ServerOpcode::Message,
                        "The proposed team fell apart; picking again.".to_string(),
                    ));
                    fx.extend(self.open_proposal());
                } else if self.ballots.len() == self.seats.len() {
                    fx.extend(self.close_vote());
                }
            }
            Phase::CollectingMissionVotes => {
                if self.team.is_empty() {
                    fx.push(Effect::Broadcast(
                        ServerOpcode::Message,
                        "The whole team is gone; picking again.".to_string(),
                    ));
                    fx.extend(self.open_proposal());
                } else if self.cards.len() == self.team.len() {
                    fx.extend(self.close_mission());
                }
            }
            Phase::Concluded(_) | Phase::Cancelled => {}
        }
        fx
    }

    // ---- phase transitions ----

    fn open_proposal(&mut self) -> Vec<Effect> {
        self.phase = Phase::ProposingTeam;
        self.team.clear();
        self.ballots.clear();
        self.cards.clear();
        self.pending.clear();
        let leader = self.seats[self.leader].clone();
        self.pending.insert(leader.id);
        let size = self.required_size();
        debug!("{} is picking a team of {}", leader.name, size);
        vec![
            Effect::Broadcast(ServerOpcode::SetLeader, leader.name),
            Effect::Unicast(
                leader.id,
                ServerOpcode::Message,
                format!(
                    "Pick {} players for mission {} with teamadd",
                    size,
                    self.round + 1
                ),
            ),
        ]
    }

    fn open_vote(&mut self) -> Vec<Effect> {
        self.phase = Phase::Voting;
        self.ballots.clear();
        self.pending = self.seats.iter().map(|s| s.id).collect();
        let team = self.team_names().join(" ");
        info!("Team proposed: {}", team);
        vec![Effect::Broadcast(ServerOpcode::Vote, team)]
    }

    fn close_vote(&mut self) -> Vec<Effect> {
        let approvals = self.ballots.values().filter(|&&a| a).count();
        let rejections = self.ballots.len() - approvals;
        info!("Team vote closed: {} for, {} against", approvals, rejections);
        let mut fx = Vec::new();
        if approvals > rejections {
            fx.push(Effect::Broadcast(
                ServerOpcode::EndVote,
                format!("passed {} {}", approvals, rejections),
            ));
            fx.extend(self.open_mission());
        } else {
            self.failed_votes += 1;
            fx.push(Effect::Broadcast(
                ServerOpcode::EndVote,
                format!("failed {} {}", approvals, rejections),
            ));
            fx.push(Effect::Broadcast(
                ServerOpcode::Message,
                format!(
                    "The team has been voted down {} of {} allowed times!",
                    self.failed_votes, MAX_FAILED_VOTES
                ),
            ));
            if self.failed_votes >= MAX_FAILED_VOTES {
                fx.extend(self.conclude(Role::Infiltrator, "Five team votes have failed!"));
            } else {
                self.rotate_leader();
                fx.extend(self.open_proposal());
            }
        }
        fx
    }

    fn open_mission(&mut self) -> Vec<Effect> {
        self.phase = Phase::CollectingMissionVotes;
        self.cards.clear();
        self.pending = self.team.iter().copied().collect();
        self.team
            .iter()
            .map(|&id| Effect::Unicast(id, ServerOpcode::GetCard, "Play success or fail".to_string()))
            .collect()
    }

    fn close_mission(&mut self) -> Vec<Effect> {
        let fails = self.cards.values().filter(|&&f| f).count();
        let outcome = if fails >= 1 {
            MissionOutcome::Failure
        } else {
            MissionOutcome::Success
        };
        info!(
            "Mission {} resolved: {:?} with {} fail cards",
            self.round + 1,
            outcome,
            fails
        );
        let votes_for_team = self
            .ballots
            .iter()
            .filter_map(|(&id, &a)| self.name_lookup(id).map(|n| (n.to_string(), a)))
            .collect();
        let sabotage_votes = self
            .cards
            .iter()
            .filter_map(|(&id, &f)| self.name_lookup(id).map(|n| (n.to_string(), f)))
            .collect();
        let team = self.team_names();
        self.records.push(MissionRecord {
            round: self.round,
            team,
            votes_for_team,
            sabotage_votes,
            outcome,
        });

        let word = match outcome {
            MissionOutcome::Success => "success",
            MissionOutcome::Failure => "failure",
        };
        let mut fx = vec![Effect::Broadcast(
            ServerOpcode::MissionDone,
            format!("{} {}", word, fails),
        )];

        let failures = self
            .records
            .iter()
            .filter(|r| r.outcome == MissionOutcome::Failure)
            .count();
        let successes = self.records.len() - failures;
        if failures >= WINS_NEEDED {
            fx.extend(self.conclude(
                Role::Infiltrator,
                "The infiltrators have sabotaged three missions!",
            ));
        } else if successes >= WINS_NEEDED {
            fx.extend(self.conclude(Role::Loyal, "Three missions have succeeded!"));
        } else {
            self.round += 1;
            self.rotate_leader();
            fx.extend(self.open_proposal());
        }
        fx
    }

    fn conclude(&mut self, winner: Role, reason: &str) -> Vec<Effect> {
        self.phase = Phase::Concluded(winner);
        self.pending.clear();
        let side = match winner {
            Role::Loyal => "The loyal players win!",
            Role::Infiltrator => "The infiltrators win!",
        };
        info!("Game over: {} {}", reason, side);
        vec![Effect::Broadcast(
            ServerOpcode::Message,
            format!("{} {}", reason, side),
        )]
    }

    // ---- action handlers ----

    fn on_chat(&mut self, actor: ConnId, text: &str) -> Vec<Effect> {
        if text == "!cancel" {
            if actor == self.owner {
                info!("Session cancelled by its owner");
                self.phase = Phase::Cancelled;
                self.pending.clear();
                return vec![Effect::Broadcast(
                    ServerOpcode::Message,
                    "The game has been cancelled!".to_string(),
                )];
            }
            return vec![self.error_to(actor, "Only the session owner may cancel the game!")];
        }
        match self.name_lookup(actor) {
            Some(name) => vec![Effect::Broadcast(
                ServerOpcode::Message,
                format!("{}: {}", name, text),
            )],
            None => Vec::new(),
        }
    }

    fn on_pm(&self, actor: ConnId, payload: &str) -> Vec<Effect> {
        let Some((target, text)) = payload.split_once(' ') else {
            return vec![self.error_to(actor, "Private messages look like: <player> <text>")];
        };
        let Some(to) = self.id_of(target) else {
            return vec![self.error_to(actor, &format!("{} isn't playing!", target))];
        };
        match self.name_lookup(actor) {
            Some(from) => vec![Effect::Unicast(
                to,
                ServerOpcode::Pm,
                format!("{} {}", from, text),
            )],
            None => Vec::new(),
        }
    }

    fn on_team_change(&mut self, actor: ConnId, name: &str, add: bool) -> Vec<Effect> {
        if self.phase != Phase::ProposingTeam {
            return vec![self.error_to(actor, "No team is being picked right now!")];
        }
        if actor != self.leader_id() {
            return vec![self.error_to(actor, "Only the leader picks the team!")];
        }
        let Some(member) = self.id_of(name) else {
            return vec![self.error_to(actor, &format!("{} isn't playing!", name))];
        };
        if add {
            if self.team.contains(&member) {
                return vec![self.error_to(actor, &format!("{} is already on the team!", name))];
            }
            self.team.push(member);
            let mut fx = vec![Effect::Broadcast(ServerOpcode::TeamAdd, name.to_string())];
            if self.team.len() == self.required_size() {
                fx.extend(self.open_vote());
            }
            fx
        } else {
            let Some(pos) = self.team.iter().position(|&m| m == member) else {
                return vec![self.error_to(actor, &format!("{} is not on the team!", name))];
            };
            self.team.remove(pos);
            vec![Effect::Broadcast(ServerOpcode::TeamRemove, name.to_string())]
        }
    }

    fn on_ballot(&mut self, actor: ConnId, approve: bool) -> Vec<Effect> {
        if self.phase != Phase::Voting {
            return vec![self.error_to(actor, "There is no team vote in progress!")];
        }
        // Last vote counts until the tally closes.
        self.ballots.insert(actor, approve);
        self.pending.remove(&actor);
        let verdict = if approve { "approved" } else { "rejected" };
        let line = match self.name_lookup(actor) {
            Some(name) => format!("{} has {} the team!", name, verdict),
            None => return Vec::new(),
        };
        let mut fx = vec![Effect::Broadcast(ServerOpcode::Message, line)];
        if self.ballots.len() == self.seats.len() {
            fx.extend(self.close_vote());
        }
        fx
    }

    fn on_card(&mut self, actor: ConnId, fail: bool) -> Vec<Effect> {
        if self.phase != Phase::CollectingMissionVotes {
            return vec![self.error_to(actor, "There is no mission underway!")];
        }
        if !self.team.contains(&actor) {
            return vec![self.error_to(actor, "You are not on this mission!")];
        }
        if fail && self.role_of(actor) == Some(Role::Loyal) {
            return vec![
                self.error_to(
                    actor,
                    "Loyal players cannot throw the mission! Are you trying to lose?",
                ),
                Effect::Unicast(actor, ServerOpcode::GetCard, "Play success or fail".to_string()),
            ];
        }
        self.cards.insert(actor, fail);
        self.pending.remove(&actor);
        let ack = if fail {
            "You have voted to fail this mission!"
        } else {
            "You have voted for this mission to succeed"
        };
        let mut fx = vec![Effect::Unicast(actor, ServerOpcode::Message, ack.to_string())];
        if self.cards.len() == self.team.len() {
            fx.extend(self.close_mission());
        }
        fx
    }

    // ---- helpers and accessors ----

    fn error_to(&self, to: ConnId, text: &str) -> Effect {
        Effect::Unicast(to, ServerOpcode::Error, text.to_string())
    }

    fn rotate_leader(&mut self) {
        self.leader = (self.leader + 1) % self.seats.len();
    }

    fn seat_index(&self, id: ConnId) -> Option<usize> {
        self.seats.iter().position(|s| s.id == id)
    }

    fn name_lookup(&self, id: ConnId) -> Option<&str> {
        self.seats.iter().find(|s| s.id == id).map(|s| s.name.as_str())
    }

    fn required_size(&self) -> usize {
        self.schedule[self.round]
    }

    pub fn id_of(&self, name: &str) -> Option<ConnId> {
        self.seats.iter().find(|s| s.name == name).map(|s| s.id)
    }

    pub fn name_of(&self, id: ConnId) -> Option<&str> {
        self.name_lookup(id)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn winner(&self) -> Option<Role> {
        match self.phase {
            Phase::Concluded(winner) => Some(winner),
            _ => None,
        }
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn required_team_size(&self) -> usize {
        self.required_size()
    }

    pub fn failed_votes(&self) -> u32 {
        self.failed_votes
    }

    pub fn leader_id(&self) -> ConnId {
        self.seats[self.leader].id
    }

    pub fn leader_name(&self) -> &str {
        &self.seats[self.leader].name
    }

    pub fn seat_ids(&self) -> Vec<ConnId> {
        self.seats.iter().map(|s| s.id).collect()
    }

    pub fn seat_names(&self) -> Vec<String> {
        self.seats.iter().map(|s| s.name.clone()).collect()
    }

    pub fn role_of(&self, id: ConnId) -> Option<Role> {
        self.seats.iter().find(|s| s.id == id).map(|s| s.role)
    }

    pub fn infiltrator_ids(&self) -> Vec<ConnId> {
        self.seats
            .iter()
            .filter(|s| s.role == Role::Infiltrator)
            .map(|s| s.id)
            .collect()
    }

    pub fn team_names(&self) -> Vec<String> {
        self.team
            .iter()
            .filter_map(|&id| self.name_lookup(id))
            .map(String::from)
            .collect()
    }

    pub fn records(&self) -> &[MissionRecord] {
        &self.records
    }

    pub fn pending_ids(&self) -> &HashSet<ConnId> {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::infiltrator_count;

    fn make_engine(n: usize) -> Engine {
        let roster: Vec<(ConnId, String)> = (0..n)
            .map(|i| (i as ConnId + 1, format!("p{}", i + 1)))
            .collect();
        let mut rng = StdRng::seed_from_u64(42);
        Engine::new(&roster, &mut rng).unwrap()
    }

    fn started(n: usize) -> (Engine, Vec<Effect>) {
        let mut engine = make_engine(n);
        let fx = engine.start();
        (engine, fx)
    }

    /// Leader proposes the given names, returning all emitted effects.
    fn propose(engine: &mut Engine, names: &[&str]) -> Vec<Effect> {
        let leader = engine.leader_id();
        let mut fx = Vec::new();
        for name in names {
            fx.extend(engine.handle(leader, ClientOpcode::TeamAdd, name));
        }
        fx
    }

    /// Leader proposes the first `required_team_size` seats.
    fn propose_first(engine: &mut Engine) -> Vec<Effect> {
        let names: Vec<String> = engine
            .seat_names()
            .into_iter()
            .take(engine.required_team_size())
            .collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        propose(engine, &refs)
    }

    fn vote_all(engine: &mut Engine, approve: bool) -> Vec<Effect> {
        let mut fx = Vec::new();
        for id in engine.seat_ids() {
            let op = if approve {
                ClientOpcode::Approve
            } else {
                ClientOpcode::Reject
            };
            fx.extend(engine.handle(id, op, ""));
        }
        fx
    }

    /// Every team member plays success.
    fn all_succeed(engine: &mut Engine) -> Vec<Effect> {
        let team: Vec<ConnId> = engine
            .team_names()
            .iter()
            .filter_map(|n| engine.id_of(n))
            .collect();
        let mut fx = Vec::new();
        for id in team {
            fx.extend(engine.handle(id, ClientOpcode::Success, ""));
        }
        fx
    }

    fn broadcasts_of(fx: &[Effect], opcode: ServerOpcode) -> Vec<String> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Broadcast(op, text) if *op == opcode => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn unicasts_of(fx: &[Effect], opcode: ServerOpcode) -> Vec<(ConnId, String)> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Unicast(to, op, text) if *op == opcode => Some((*to, text.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_role_counts_for_all_table_sizes() {
        for n in 5..=10 {
            let engine = make_engine(n);
            let infiltrators = engine.infiltrator_ids();
            assert_eq!(infiltrators.len(), infiltrator_count(n), "n = {}", n);
            let seats = engine.seat_ids();
            assert!(infiltrators.iter().all(|id| seats.contains(id)));
        }
    }

    #[test]
    fn test_cards_keep_loyal_players_blind() {
        for n in 5..=10 {
            let (engine, fx) = started(n);
            let infiltrator_names: Vec<String> = engine
                .infiltrator_ids()
                .iter()
                .map(|&id| engine.name_of(id).unwrap().to_string())
                .collect();

            for (to, card) in unicasts_of(&fx, ServerOpcode::Card) {
                match engine.role_of(to).unwrap() {
                    Role::Loyal => {
                        assert_eq!(card, "loyal");
                    }
                    Role::Infiltrator => {
                        let mut tokens = card.split(' ');
                        assert_eq!(tokens.next(), Some("infiltrator"));
                        let listed: Vec<&str> = tokens.collect();
                        // exactly the *other* infiltrators
                        assert_eq!(listed.len(), infiltrator_names.len() - 1);
                        for &name in &listed {
                            assert!(infiltrator_names.iter().any(|n| n == name));
                            assert_ne!(engine.id_of(name), Some(to));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_start_announces_roster_and_leader() {
        let (engine, fx) = started(5);
        let roster = broadcasts_of(&fx, ServerOpcode::GameStart);
        assert_eq!(roster, vec!["p1 p2 p3 p4 p5".to_string()]);
        let leaders = broadcasts_of(&fx, ServerOpcode::SetLeader);
        assert_eq!(leaders, vec![engine.leader_name().to_string()]);
        assert_eq!(engine.phase(), Phase::ProposingTeam);
        assert!(engine.pending_ids().contains(&engine.leader_id()));
    }

    #[test]
    fn test_vote_opens_exactly_at_required_size() {
        let (mut engine, _) = started(5);
        assert_eq!(engine.required_team_size(), 2);
        let leader = engine.leader_id();

        let fx = engine.handle(leader, ClientOpcode::TeamAdd, "p1");
        assert!(broadcasts_of(&fx, ServerOpcode::Vote).is_empty());
        assert_eq!(engine.phase(), Phase::ProposingTeam);

        let fx = engine.handle(leader, ClientOpcode::TeamAdd, "p2");
        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::Vote),
            vec!["p1 p2".to_string()]
        );
        assert_eq!(engine.phase(), Phase::Voting);
        assert_eq!(engine.pending_ids().len(), 5);

        // Further picks are out of phase now.
        let fx = engine.handle(leader, ClientOpcode::TeamAdd, "p3");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error).len(), 1);
    }

    #[test]
    fn test_team_pick_validation() {
        let (mut engine, _) = started(5);
        let leader = engine.leader_id();
        let not_leader = engine
            .seat_ids()
            .into_iter()
            .find(|&id| id != leader)
            .unwrap();

        let fx = engine.handle(not_leader, ClientOpcode::TeamAdd, "p1");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error), vec![(
            not_leader,
            "Only the leader picks the team!".to_string()
        )]);

        let fx = engine.handle(leader, ClientOpcode::TeamAdd, "nobody");
        assert_eq!(
            unicasts_of(&fx, ServerOpcode::Error),
            vec![(leader, "nobody isn't playing!".to_string())]
        );

        engine.handle(leader, ClientOpcode::TeamAdd, "p1");
        let fx = engine.handle(leader, ClientOpcode::TeamAdd, "p1");
        assert_eq!(
            unicasts_of(&fx, ServerOpcode::Error),
            vec![(leader, "p1 is already on the team!".to_string())]
        );

        let fx = engine.handle(leader, ClientOpcode::TeamRemove, "p3");
        assert_eq!(
            unicasts_of(&fx, ServerOpcode::Error),
            vec![(leader, "p3 is not on the team!".to_string())]
        );

        // Swap p1 out for p3, then complete the team.
        let fx = engine.handle(leader, ClientOpcode::TeamRemove, "p1");
        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::TeamRemove),
            vec!["p1".to_string()]
        );
        engine.handle(leader, ClientOpcode::TeamAdd, "p3");
        let fx = engine.handle(leader, ClientOpcode::TeamAdd, "p4");
        assert_eq!(engine.phase(), Phase::Voting);
        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::Vote),
            vec!["p3 p4".to_string()]
        );
    }

    #[test]
    fn test_vote_passes_on_strict_majority() {
        let (mut engine, _) = started(5);
        propose_first(&mut engine);

        let ids = engine.seat_ids();
        for &id in &ids[..3] {
            engine.handle(id, ClientOpcode::Approve, "");
        }
        assert_eq!(engine.phase(), Phase::Voting);
        engine.handle(ids[3], ClientOpcode::Reject, "");
        let fx = engine.handle(ids[4], ClientOpcode::Reject, "");

        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::EndVote),
            vec!["passed 3 2".to_string()]
        );
        assert_eq!(engine.phase(), Phase::CollectingMissionVotes);
        // Only the two team members owe a card.
        assert_eq!(unicasts_of(&fx, ServerOpcode::GetCard).len(), 2);
        assert_eq!(engine.pending_ids().len(), 2);
    }

    #[test]
    fn test_vote_tie_fails() {
        let (mut engine, _) = started(6);
        let before = engine.leader_id();
        propose_first(&mut engine);

        let ids = engine.seat_ids();
        for &id in &ids[..3] {
            engine.handle(id, ClientOpcode::Approve, "");
        }
        engine.handle(ids[3], ClientOpcode::Reject, "");
        engine.handle(ids[4], ClientOpcode::Reject, "");
        let fx = engine.handle(ids[5], ClientOpcode::Reject, "");

        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::EndVote),
            vec!["failed 3 3".to_string()]
        );
        assert_eq!(engine.failed_votes(), 1);
        assert_eq!(engine.phase(), Phase::ProposingTeam);
        assert_ne!(engine.leader_id(), before);
    }

    #[test]
    fn test_revote_overwrites_until_quorum() {
        let (mut engine, _) = started(5);
        propose_first(&mut engine);

        let ids = engine.seat_ids();
        engine.handle(ids[0], ClientOpcode::Approve, "");
        engine.handle(ids[0], ClientOpcode::Reject, "");
        for &id in &ids[1..4] {
            engine.handle(id, ClientOpcode::Approve, "");
        }
        let fx = engine.handle(ids[4], ClientOpcode::Approve, "");

        // p1's reject replaced their approve: 4 for, 1 against.
        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::EndVote),
            vec!["passed 4 1".to_string()]
        );
    }

    #[test]
    fn test_five_failed_votes_hand_infiltrators_the_win() {
        let (mut engine, _) = started(5);
        for expected in 1..=5u32 {
            propose_first(&mut engine);
            let fx = vote_all(&mut engine, false);
            assert_eq!(engine.failed_votes(), expected);
            if expected == 5 {
                assert_eq!(engine.phase(), Phase::Concluded(Role::Infiltrator));
                assert!(!broadcasts_of(&fx, ServerOpcode::Message).is_empty());
            } else {
                assert_eq!(engine.phase(), Phase::ProposingTeam);
            }
        }
        assert!(engine.records().is_empty());
    }

    #[test]
    fn test_failed_vote_counter_is_cumulative_across_rounds() {
        let (mut engine, _) = started(5);

        // Four rejected proposals...
        for _ in 0..4 {
            propose_first(&mut engine);
            vote_all(&mut engine, false);
        }
        assert_eq!(engine.failed_votes(), 4);

        // ...then a full successful round does not reset the counter...
        propose_first(&mut engine);
        vote_all(&mut engine, true);
        all_succeed(&mut engine);
        assert_eq!(engine.round(), 1);
        assert_eq!(engine.failed_votes(), 4);

        // ...so a single further rejection ends the game.
        propose_first(&mut engine);
        vote_all(&mut engine, false);
        assert_eq!(engine.phase(), Phase::Concluded(Role::Infiltrator));
    }

    #[test]
    fn test_loyal_fail_card_is_rejected_and_not_recorded() {
        let (mut engine, _) = started(5);
        // Put two loyal players on the team.
        let loyal: Vec<String> = engine
            .seat_ids()
            .into_iter()
            .filter(|&id| engine.role_of(id) == Some(Role::Loyal))
            .map(|id| engine.name_of(id).unwrap().to_string())
            .take(2)
            .collect();
        let refs: Vec<&str> = loyal.iter().map(String::as_str).collect();
        propose(&mut engine, &refs);
        vote_all(&mut engine, true);

        let saboteur = engine.id_of(&loyal[0]).unwrap();
        let fx = engine.handle(saboteur, ClientOpcode::Fail, "");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error).len(), 1);
        // Re-prompted, still owing a card.
        assert_eq!(unicasts_of(&fx, ServerOpcode::GetCard), vec![(
            saboteur,
            "Play success or fail".to_string()
        )]);
        assert!(engine.pending_ids().contains(&saboteur));
        assert_eq!(engine.phase(), Phase::CollectingMissionVotes);

        // A compliant resubmission is accepted and the mission succeeds.
        engine.handle(saboteur, ClientOpcode::Success, "");
        let other = engine.id_of(&loyal[1]).unwrap();
        engine.handle(other, ClientOpcode::Success, "");
        assert_eq!(engine.records().len(), 1);
        assert_eq!(engine.records()[0].outcome, MissionOutcome::Success);
        assert_eq!(engine.records()[0].sabotage_votes.values().filter(|&&f| f).count(), 0);
    }

    #[test]
    fn test_single_fail_card_sinks_the_mission() {
        let (mut engine, _) = started(5);
        // One infiltrator plus one loyal player.
        let infiltrator = engine.infiltrator_ids()[0];
        let loyal = engine
            .seat_ids()
            .into_iter()
            .find(|&id| engine.role_of(id) == Some(Role::Loyal))
            .unwrap();
        let names: Vec<String> = [infiltrator, loyal]
            .iter()
            .map(|&id| engine.name_of(id).unwrap().to_string())
            .collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        propose(&mut engine, &refs);
        vote_all(&mut engine, true);

        engine.handle(loyal, ClientOpcode::Success, "");
        let fx = engine.handle(infiltrator, ClientOpcode::Fail, "");

        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::MissionDone),
            vec!["failure 1".to_string()]
        );
        let record = &engine.records()[0];
        assert_eq!(record.outcome, MissionOutcome::Failure);
        assert_eq!(record.sabotage_votes.values().filter(|&&f| f).count(), 1);
        // The public tally names nobody.
        for text in broadcasts_of(&fx, ServerOpcode::MissionDone) {
            for name in engine.seat_names() {
                assert!(!text.contains(&name));
            }
        }
    }

    #[test]
    fn test_mission_card_overwrite_before_completion() {
        let (mut engine, _) = started(5);
        let infiltrator = engine.infiltrator_ids()[0];
        let loyal = engine
            .seat_ids()
            .into_iter()
            .find(|&id| engine.role_of(id) == Some(Role::Loyal))
            .unwrap();
        let names: Vec<String> = [infiltrator, loyal]
            .iter()
            .map(|&id| engine.name_of(id).unwrap().to_string())
            .collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        propose(&mut engine, &refs);
        vote_all(&mut engine, true);

        // The infiltrator hesitates, then commits to sabotage.
        engine.handle(infiltrator, ClientOpcode::Success, "");
        engine.handle(infiltrator, ClientOpcode::Fail, "");
        assert_eq!(engine.phase(), Phase::CollectingMissionVotes);

        engine.handle(loyal, ClientOpcode::Success, "");
        assert_eq!(engine.records()[0].outcome, MissionOutcome::Failure);
    }

    #[test]
    fn test_loyal_side_wins_after_three_successes() {
        let (mut engine, _) = started(5);
        for round in 0..3 {
            assert_eq!(engine.round(), round);
            propose_first(&mut engine);
            vote_all(&mut engine, true);
            all_succeed(&mut engine);
        }
        assert_eq!(engine.phase(), Phase::Concluded(Role::Loyal));
        assert_eq!(engine.winner(), Some(Role::Loyal));
        assert_eq!(engine.records().len(), 3);
    }

    #[test]
    fn test_infiltrators_win_after_three_sabotaged_missions() {
        let (mut engine, _) = started(5);
        let infiltrator = engine.infiltrator_ids()[0];
        let infiltrator_name = engine.name_of(infiltrator).unwrap().to_string();

        for _ in 0..3 {
            // Always staff the saboteur, fill up with whoever comes first.
            let mut names = vec![infiltrator_name.clone()];
            for n in engine.seat_names() {
                if names.len() == engine.required_team_size() {
                    break;
                }
                if n != infiltrator_name {
                    names.push(n);
                }
            }
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            propose(&mut engine, &refs);
            vote_all(&mut engine, true);

            for name in &names[1..] {
                let id = engine.id_of(name).unwrap();
                engine.handle(id, ClientOpcode::Success, "");
            }
            engine.handle(infiltrator, ClientOpcode::Fail, "");
        }
        assert_eq!(engine.phase(), Phase::Concluded(Role::Infiltrator));
        assert_eq!(engine.records().len(), 3);
    }

    #[test]
    fn test_first_round_walkthrough_for_five_players() {
        let (mut engine, _) = started(5);
        assert_eq!(engine.required_team_size(), 2);

        propose(&mut engine, &["p1", "p2"]);
        assert_eq!(engine.phase(), Phase::Voting);

        let ids = engine.seat_ids();
        for &id in &ids[..3] {
            engine.handle(id, ClientOpcode::Approve, "");
        }
        engine.handle(ids[3], ClientOpcode::Reject, "");
        engine.handle(ids[4], ClientOpcode::Reject, "");
        assert_eq!(engine.phase(), Phase::CollectingMissionVotes);

        engine.handle(engine.id_of("p1").unwrap(), ClientOpcode::Success, "");
        engine.handle(engine.id_of("p2").unwrap(), ClientOpcode::Success, "");

        assert_eq!(engine.records().len(), 1);
        assert_eq!(engine.records()[0].outcome, MissionOutcome::Success);
        assert_eq!(engine.records()[0].round, 0);
        assert_eq!(engine.round(), 1);
        assert_eq!(engine.required_team_size(), 3);
    }

    #[test]
    fn test_owner_cancel() {
        let (mut engine, _) = started(5);
        let ids = engine.seat_ids();
        let not_owner = ids[1];

        let fx = engine.handle(not_owner, ClientOpcode::Message, "!cancel");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error).len(), 1);
        assert_eq!(engine.phase(), Phase::ProposingTeam);

        let fx = engine.handle(ids[0], ClientOpcode::Message, "!cancel");
        assert!(!broadcasts_of(&fx, ServerOpcode::Message).is_empty());
        assert_eq!(engine.phase(), Phase::Cancelled);
    }

    #[test]
    fn test_chat_relay_and_private_messages() {
        let (mut engine, _) = started(5);
        let ids = engine.seat_ids();

        let fx = engine.handle(ids[0], ClientOpcode::Message, "good evening");
        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::Message),
            vec!["p1: good evening".to_string()]
        );

        let fx = engine.handle(ids[0], ClientOpcode::SendPm, "p3 trust me");
        assert_eq!(
            unicasts_of(&fx, ServerOpcode::Pm),
            vec![(ids[2], "p1 trust me".to_string())]
        );

        let fx = engine.handle(ids[0], ClientOpcode::SendPm, "ghost hello");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error).len(), 1);
    }

    #[test]
    fn test_out_of_phase_inputs_are_errors() {
        let (mut engine, _) = started(5);
        let ids = engine.seat_ids();

        let fx = engine.handle(ids[0], ClientOpcode::Approve, "");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error).len(), 1);
        let fx = engine.handle(ids[0], ClientOpcode::Success, "");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error).len(), 1);

        propose_first(&mut engine);
        let leader = engine.leader_id();
        let fx = engine.handle(leader, ClientOpcode::TeamAdd, "p5");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error).len(), 1);

        // Off-team card during a mission.
        vote_all(&mut engine, true);
        let outsider = engine
            .seat_ids()
            .into_iter()
            .find(|&id| !engine.team_names().contains(&format!("p{}", id)))
            .unwrap();
        let fx = engine.handle(outsider, ClientOpcode::Success, "");
        assert_eq!(unicasts_of(&fx, ServerOpcode::Error).len(), 1);
    }

    #[test]
    fn test_disconnect_mid_vote_shrinks_quorum() {
        let (mut engine, _) = started(5);
        propose(&mut engine, &["p1", "p2"]);

        let ids = engine.seat_ids();
        for &id in &ids[..4] {
            engine.handle(id, ClientOpcode::Approve, "");
        }
        assert_eq!(engine.phase(), Phase::Voting);

        // The last holdout (not on the team) disconnects; the tally
        // closes on the remaining four.
        let fx = engine.remove_player(ids[4]);
        assert_eq!(
            broadcasts_of(&fx, ServerOpcode::EndVote),
            vec!["passed 4 0".to_string()]
        );
        assert_eq!(engine.phase(), Phase::CollectingMissionVotes);
    }

    #[test]
    fn test_leader_disconnect_passes_leadership() {
        let (mut engine, _) = started(6);
        let leader = engine.leader_id();

        let fx = engine.remove_player(leader);
        assert_eq!(engine.phase(), Phase::ProposingTeam);
        assert_ne!(engine.leader_id(), leader);
        // A fresh proposal prompt went out.
        assert_eq!(broadcasts_of(&fx, ServerOpcode::SetLeader).len(), 1);
        assert_eq!(engine.seat_ids().len(), 5);
    }

    #[test]
    fn test_team_member_disconnect_during_vote_reopens_proposal() {
        let (mut engine, _) = started(6);
        propose(&mut engine, &["p1", "p2"]);
        assert_eq!(engine.phase(), Phase::Voting);

        let gone = engine.id_of("p2").unwrap();
        let fx = engine.remove_player(gone);
        assert_eq!(engine.phase(), Phase::ProposingTeam);
        assert_eq!(broadcasts_of(&fx, ServerOpcode::SetLeader).len(), 1);
        assert_eq!(engine.failed_votes(), 0);
        assert!(engine.team_names().is_empty());
    }

    #[test]
    fn test_mission_resolves_when_last_card_holder_remains() {
        let (mut engine, _) = started(5);
        let infiltrator = engine.infiltrator_ids()[0];
        let loyal = engine
            .seat_ids()
            .into_iter()
            .find(|&id| engine.role_of(id) == Some(Role::Loyal))
            .unwrap();
        let names: Vec<String> = [loyal, infiltrator]
            .iter()
            .map(|&id| engine.name_of(id).unwrap().to_string())
            .collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        propose(&mut engine, &refs);
        vote_all(&mut engine, true);

        engine.handle(loyal, ClientOpcode::Success, "");
        // The infiltrator rage-quits instead of playing a card; the
        // mission resolves on the remaining member's card alone.
        engine.remove_player(infiltrator);
        assert_eq!(engine.records().len(), 1);
        assert_eq!(engine.records()[0].outcome, MissionOutcome::Success);
    }

    #[test]
    fn test_forfeit_when_too_few_players_remain() {
        let (mut engine, _) = started(5);
        let ids = engine.seat_ids();

        engine.remove_player(ids[4]);
        engine.remove_player(ids[3]);
        engine.remove_player(ids[2]);
        // Three gone, two seats left: a team of two is still possible.
        assert!(engine.winner().is_none());

        engine.remove_player(ids[1]);
        assert_eq!(engine.phase(), Phase::Concluded(Role::Infiltrator));
    }

    #[test]
    fn test_concluded_engine_ignores_input() {
        let (mut engine, _) = started(5);
        let ids = engine.seat_ids();
        engine.handle(ids[0], ClientOpcode::Message, "!cancel");
        assert_eq!(engine.phase(), Phase::Cancelled);

        assert!(engine.handle(ids[1], ClientOpcode::Approve, "").is_empty());
        assert!(engine
            .handle(ids[1], ClientOpcode::Message, "anyone there?")
            .is_empty());
    }
}
