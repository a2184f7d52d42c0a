use serde::Deserialize;
use validator::Validate;

use crate::{
    dto::validation::{validate_square, validate_uid},
    state::session::{TimeControl, UserRef},
};

/// A move as entered on the board: source and destination squares.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MoveIntent {
    /// Origin square, e.g. `e2`.
    #[validate(custom(function = "validate_square"))]
    pub from: String,
    /// Destination square.
    #[validate(custom(function = "validate_square"))]
    pub to: String,
}

impl MoveIntent {
    /// Intent for `from → to`.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Identity of the player issuing intents.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PlayerInput {
    /// Stable user id.
    #[validate(custom(function = "validate_uid"))]
    pub uid: String,
    /// Optional display email.
    #[validate(email)]
    pub email: Option<String>,
}

impl From<PlayerInput> for UserRef {
    fn from(input: PlayerInput) -> Self {
        UserRef {
            uid: input.uid,
            email: input.email,
        }
    }
}

impl From<&UserRef> for PlayerInput {
    fn from(user: &UserRef) -> Self {
        Self {
            uid: user.uid.clone(),
            email: user.email.clone(),
        }
    }
}

/// Request to open a new room.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CreateSessionRequest {
    /// Falls back to the configured default when absent.
    #[validate(nested)]
    pub time_control: Option<TimeControl>,
}
