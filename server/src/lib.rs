//! # Session Server Library
//!
//! Authoritative server for a social-deduction game: a fixed group of
//! players connects over TCP, picks display names, and is then steered
//! through repeated rounds of team proposal, public voting and covert
//! mission resolution until one faction has three wins.
//!
//! ## Architecture
//!
//! All network events funnel into a single coordinating task. Each accepted
//! socket gets a reader task that decodes line-oriented frames and forwards
//! them over an unbounded channel; writes happen only from the coordinator
//! through the owned write halves held by the session registry. The game
//! rules themselves live in a pure state machine (`engine`) that consumes
//! participant actions and emits messaging effects, which keeps every
//! suspension point (team proposal, voting, mission cards) deterministic
//! and unit-testable without sockets.
//!
//! ## Module Organization
//!
//! - [`connection`]: framed writes plus the per-socket reader task
//! - [`listener`]: time-bounded connection acceptance
//! - [`naming`]: display-name collection under a deadline
//! - [`registry`]: the named roster and best-effort messaging
//! - [`engine`]: the round-coordination state machine
//! - [`session`]: lifecycle orchestration from lobby to conclusion

pub mod connection;
pub mod engine;
pub mod listener;
pub mod naming;
pub mod registry;
pub mod session;
