//! Envelope validation rules

use super::BatchEnvelope;
use crate::errors::{AppError, Result};
use validator::{Validate, ValidationError};

/// Reject empty and whitespace-only strings
pub fn not_blank(value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

pub(crate) fn validate_total_articles(
    envelope: &BatchEnvelope,
) -> std::result::Result<(), ValidationError> {
    if envelope.total_articles != envelope.articles.len() {
        let mut err = ValidationError::new("total_mismatch");
        err.message = Some("Total articles count mismatch".into());
        err.add_param("declared".into(), &envelope.total_articles);
        err.add_param("actual".into(), &envelope.articles.len());
        return Err(err);
    }
    Ok(())
}

/// Check every envelope invariant. A single bad article invalidates the
/// whole envelope.
pub fn validate_envelope(envelope: &BatchEnvelope) -> Result<()> {
    envelope.validate().map_err(|errors| AppError::Validation {
        message: format!("invalid envelope from '{}': {}", envelope.portal_name, errors),
        field: errors.field_errors().keys().next().map(|f| f.to_string()),
    })
}
