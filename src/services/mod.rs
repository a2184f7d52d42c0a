/// Local countdown driver for the side to move.
pub(crate) mod clock_service;
/// Finished-game records and player statistics.
pub mod history;
/// Random-opponent pairing over shared tickets.
pub mod matchmaking;
/// Elo updates applied once per finished game.
pub mod rating;
/// Session clients: intents, reconciliation and views.
pub mod session_service;
/// Change-feed store connection supervisor.
pub mod storage_supervisor;
