//! Validation helpers for DTOs.

use validator::ValidationError;

/// Longest identifier accepted from clients.
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Validates an externally issued identifier (user, game, room).
///
/// # Examples
///
/// ```ignore
/// validate_identifier("user-42")    // Ok
/// validate_identifier("")           // Err - empty
/// validate_identifier("user 42")    // Err - whitespace
/// ```
pub fn validate_identifier(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.len() > MAX_IDENTIFIER_LENGTH {
        let mut err = ValidationError::new("identifier_length");
        err.message = Some(
            format!(
                "Identifier must be between 1 and {MAX_IDENTIFIER_LENGTH} characters (got {})",
                id.len()
            )
            .into(),
        );
        return Err(err);
    }

    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        let mut err = ValidationError::new("identifier_format");
        err.message = Some("Identifier must not contain whitespace or control characters".into());
        return Err(err);
    }

    Ok(())
}
