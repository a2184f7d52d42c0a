//! Library crate for chess-duel: a two-player chess session engine coordinated through
//! a change-feed document store.

/// Engine configuration loaded from JSON.
pub mod config;
/// Storage port, backends and persisted record shapes.
pub mod dao;
/// Caller-facing inputs, views and statistics.
pub mod dto;
/// Errors surfaced to callers.
pub mod error;
/// Session clients, matchmaking, ratings and the storage supervisor.
pub mod services;
/// Session model, state machine, clock and rules oracle.
pub mod state;
