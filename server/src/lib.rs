//! # Quiz Duel Server Library
//!
//! This library provides the authoritative server for head-to-head quiz
//! duels. Participants queue on a topic, are paired first-come first-served,
//! and then play a fixed number of multi-step rounds against each other with
//! the server owning every clock, every score and every decision.
//!
//! ## Core Responsibilities
//!
//! ### Matchmaking
//! Waiting participants are kept per topic in arrival order. Pairing is a
//! two-step observe-then-commit pass, so two passes racing for the same
//! entry can never both win it: the loser simply retries or stays queued.
//!
//! ### Match Sessions
//! Each paired match runs as its own task that exclusively owns the match
//! state. Round phases, answer validation, scoring and the end of the match
//! are all decided there, and clients only ever see the results.
//!
//! ### Presence
//! Participants heartbeat while queued and while playing. A participant that
//! goes silent is evicted from the queue, or, during a match, either given a
//! short grace period to come back or forfeits to the opponent.
//!
//! ## Module Organization
//!
//! ### Queue Module (`queue`)
//! - Insertion-ordered queue store with per-topic positions
//! - Race-safe pairing passes and heartbeat eviction
//!
//! ### Session Module (`session`)
//! - The per-match actor: phases, deadlines, answers and scoring
//! - Reconnect grace, forfeits and state replay for resyncing clients
//!
//! ### Lobby and Registry Modules (`lobby`, `registry`)
//! - Route authenticated connections to the queue or to their match task
//! - Discover running matches by participant
//!
//! ### Network Module (`network`)
//! - TCP accept loop with a connection limit
//! - Authentication handshake and frame routing per connection
//!
//! ### Supporting Modules
//! - `auth`: identity verification seam
//! - `sequencer`: question supply and step budgets
//! - `presence`: heartbeat bookkeeping
//! - `ledger`: hand-off of finished match outcomes
//! - `config`, `error`: tuning knobs and the error taxonomy
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::auth::TokenIdentityProvider;
//! use server::config::ServerConfig;
//! use server::ledger::LogLedger;
//! use server::network::Server;
//! use server::sequencer::QuestionBank;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(
//!         ServerConfig::default(),
//!         Arc::new(QuestionBank::sample()?),
//!         Arc::new(LogLedger),
//!         Arc::new(TokenIdentityProvider),
//!     )
//!     .await?;
//!
//!     // Accepts connections until the process is stopped
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lobby;
pub mod network;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod sequencer;
pub mod session;

pub use error::{DuelError, Result, ValidationError};
