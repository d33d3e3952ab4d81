//! Validation of work items before they reach the fetcher.
//!
//! Items end up inside request lines and headers downstream, so anything that
//! could corrupt a request (line breaks, control characters) is rejected here
//! rather than sent.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons an item is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemValidationError {
    #[error("Item is empty")]
    Empty,

    #[error("Item contains line breaks: {0:?}")]
    LineBreak(String),

    #[error("Item contains control characters: {0:?}")]
    ControlCharacter(String),

    #[error("Invalid email format: {0}")]
    InvalidEmail(String),
}

/// Shape rule applied on top of the basic checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemFormat {
    /// Any non-empty single-line text.
    #[default]
    Any,
    /// Text with exactly one `@`.
    Email,
}

/// Trims an item and checks it is safe to send.
///
/// # Errors
///
/// Returns the first rule the item breaks.
pub fn validate_item(item: &str, format: ItemFormat) -> Result<String, ItemValidationError> {
    let clean = item.trim();

    if clean.is_empty() {
        return Err(ItemValidationError::Empty);
    }
    if clean.contains('\n') || clean.contains('\r') {
        return Err(ItemValidationError::LineBreak(clean.to_string()));
    }
    if clean.chars().any(|c| c.is_control() && c != '\t') {
        return Err(ItemValidationError::ControlCharacter(clean.to_string()));
    }
    if format == ItemFormat::Email && clean.matches('@').count() != 1 {
        return Err(ItemValidationError::InvalidEmail(clean.to_string()));
    }

    Ok(clean.to_string())
}

/// Outcome of validating a batch of items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Cleaned items, in input order.
    pub clean: Vec<String>,
    /// One reason per rejected item.
    pub invalid: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Validates every item, keeping the clean ones.
pub fn validate_and_clean<S: AsRef<str>>(items: &[S], format: ItemFormat) -> ValidationReport {
    let mut report = ValidationReport::default();

    for item in items {
        match validate_item(item.as_ref(), format) {
            Ok(clean) => report.clean.push(clean),
            Err(e) => report.invalid.push(e.to_string()),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_trims() {
        assert_eq!(
            validate_item("  user@example.com \t", ItemFormat::Any).unwrap(),
            "user@example.com"
        );
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert_eq!(validate_item("", ItemFormat::Any), Err(ItemValidationError::Empty));
        assert_eq!(
            validate_item("   ", ItemFormat::Any),
            Err(ItemValidationError::Empty)
        );
    }

    #[test]
    fn test_validate_rejects_line_breaks() {
        assert!(matches!(
            validate_item("a\nb", ItemFormat::Any),
            Err(ItemValidationError::LineBreak(_))
        ));
        assert!(matches!(
            validate_item("a\rb", ItemFormat::Any),
            Err(ItemValidationError::LineBreak(_))
        ));
    }

    #[test]
    fn test_validate_control_characters() {
        assert!(matches!(
            validate_item("a\u{0007}b", ItemFormat::Any),
            Err(ItemValidationError::ControlCharacter(_))
        ));
        // tabs inside an item are tolerated
        assert!(validate_item("a\tb", ItemFormat::Any).is_ok());
    }

    #[test]
    fn test_validate_email_format() {
        assert!(validate_item("user@example.com", ItemFormat::Email).is_ok());
        assert!(matches!(
            validate_item("user.example.com", ItemFormat::Email),
            Err(ItemValidationError::InvalidEmail(_))
        ));
        assert!(matches!(
            validate_item("a@b@c", ItemFormat::Email),
            Err(ItemValidationError::InvalidEmail(_))
        ));
        assert!(validate_item("plain-id", ItemFormat::Any).is_ok());
    }

    #[test]
    fn test_validate_and_clean() {
        let items = vec![" a@x.com", "", "b@x.com\n c", "c@x.com"];
        let report = validate_and_clean(&items, ItemFormat::Email);

        assert_eq!(report.clean, vec!["a@x.com", "c@x.com"]);
        assert_eq!(report.invalid.len(), 2);
        assert!(!report.is_clean());
    }
}
