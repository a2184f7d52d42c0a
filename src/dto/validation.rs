//! Validation helpers for intents coming from the UI.

use validator::ValidationError;

/// Validates an algebraic square name: a file `a`–`h` followed by a rank `1`–`8`.
///
/// # Examples
///
/// ```ignore
/// validate_square("e4") // Ok
/// validate_square("E4") // Err - uppercase file
/// validate_square("e9") // Err - no such rank
/// ```
pub fn validate_square(square: &str) -> Result<(), ValidationError> {
    let bytes = square.as_bytes();
    if bytes.len() != 2 {
        let mut err = ValidationError::new("square_length");
        err.message = Some(format!("Square must be 2 characters (got {})", square.len()).into());
        return Err(err);
    }

    if !(b'a'..=b'h').contains(&bytes[0]) || !(b'1'..=b'8').contains(&bytes[1]) {
        let mut err = ValidationError::new("square_format");
        err.message = Some("Square must be a file a-h followed by a rank 1-8".into());
        return Err(err);
    }

    Ok(())
}

/// Validates a user id: non-empty, no whitespace, no path separators.
pub fn validate_uid(uid: &str) -> Result<(), ValidationError> {
    if uid.is_empty() || uid.len() > 128 {
        let mut err = ValidationError::new("uid_length");
        err.message = Some("User id must be between 1 and 128 characters".into());
        return Err(err);
    }

    if uid
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == ':')
    {
        let mut err = ValidationError::new("uid_format");
        err.message = Some("User id must not contain whitespace, '/' or ':'".into());
        return Err(err);
    }

    Ok(())
}
