//! Shared threshold validation helpers.
//!
//! Provides reusable range-checking functions used by configuration and
//! device selection.

use crate::error::CoreError;

/// Validate that a value falls within `(0.0, 1.0]`.
///
/// Returns a `CoreError::Configuration` naming the field if out of range.
pub fn validate_unit_interval(value: f64, name: &str) -> Result<(), CoreError> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(CoreError::Configuration(format!(
            "{name} must be greater than 0.0 and at most 1.0, got {value}"
        )));
    }
    Ok(())
}

/// Validate that an integer setting is strictly positive.
pub fn validate_positive(value: u64, name: &str) -> Result<(), CoreError> {
    if value == 0 {
        return Err(CoreError::Configuration(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_upper_boundary() {
        assert!(validate_unit_interval(1.0, "test").is_ok());
        assert!(validate_unit_interval(0.5, "test").is_ok());
    }

    #[test]
    fn rejects_zero_and_above_one() {
        assert!(validate_unit_interval(0.0, "test").is_err());
        assert!(validate_unit_interval(1.01, "test").is_err());
        assert!(validate_unit_interval(f64::NAN, "test").is_err());
    }

    #[test]
    fn positive_rejects_zero() {
        assert!(validate_positive(0, "poll_interval_ms").is_err());
        assert!(validate_positive(1, "poll_interval_ms").is_ok());
    }
}
