//! # Quiz Duel Client Library
//!
//! This library provides the participant side of a quiz duel: a pure state
//! reducer that turns server events into displayable state, a text renderer
//! for that state, and a headless terminal client that plays one match.
//!
//! ## Architecture Overview
//!
//! The server is authoritative for everything: phases, deadlines, answers
//! and scores. The client never predicts; it only folds what the server says
//! through [`state::reduce`], so the same sequence of events always yields
//! the same state no matter how often it is replayed.
//!
//! ### Push and Poll
//! Events are normally pushed. If nothing arrives for a while during a
//! match the client sends a `SyncRequest`, and the server answers with a
//! replay of the current state. Both paths go through the same reducer and
//! converge, because stale or duplicated events are ignored.
//!
//! ### Pending Submissions
//! An answer in flight is tracked by its request id. The matching
//! acknowledgement sets the selection; the matching validation error clears
//! the pending submission and leaves everything else alone.
//!
//! ## Module Organization
//!
//! ### State Module (`state`)
//! - `ClientBattleState` and the events it is built from
//! - The pure `reduce` function
//!
//! ### Rendering Module (`rendering`)
//! - Text description of the state with countdowns from absolute deadlines
//!
//! ### Network Module (`network`)
//! - TCP connection, handshake and queueing
//! - Heartbeats, sync polling, and stdin or automatic answers
//!
//! ## Usage Example
//!
//! ```rust
//! use client::state::{reduce, ClientBattleState, ClientEvent, ClientPhase};
//! use shared::{Identity, ServerMessage};
//!
//! let state = reduce(
//!     ClientBattleState::new(),
//!     &ClientEvent::Server(ServerMessage::Authenticated {
//!         identity: Identity::new("ada"),
//!     }),
//! );
//! assert_eq!(state.phase, ClientPhase::Authenticated);
//! ```

pub mod network;
pub mod rendering;
pub mod state;
