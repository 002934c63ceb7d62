//! Small helpers shared across backends.

use thiserror::Error;

/// Maximum length of a backend-safe label value.
const MAX_LABEL_LEN: usize = 63;

/// Errors produced when a value cannot be turned into a backend-safe label.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label keys must contain at least one valid character")]
    EmptyKey,
    #[error("label keys must start with a lowercase letter, got {0:?}")]
    InvalidKeyStart(String),
}

/// Transforms an arbitrary display string into a backend-safe label value:
/// lowercase, restricted to `[a-z0-9_-]`, runs of other characters collapsed
/// to a single `-`, bounded length.
pub fn safe_label(value: &str) -> String {
    let mut label = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-' {
            if pending_dash && !label.is_empty() {
                label.push('-');
            }
            pending_dash = false;
            label.push(ch);
        } else {
            pending_dash = true;
        }
    }
    let label = label.trim_matches('-');
    let mut label = label.to_string();
    label.truncate(MAX_LABEL_LEN);
    label
}

/// Like [`safe_label`], but for label keys, which the backends additionally
/// require to be non-empty and to start with a letter.
pub fn safe_label_key(value: &str) -> Result<String, LabelError> {
    let key = safe_label(value);
    if key.is_empty() {
        return Err(LabelError::EmptyKey);
    }
    if !key.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err(LabelError::InvalidKeyStart(key));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_punctuation() {
        assert_eq!(safe_label("WORLD"), "world");
        assert_eq!(safe_label("Train Model (v2)"), "train-model-v2");
        assert_eq!(safe_label("already-safe_label"), "already-safe_label");
    }

    #[test]
    fn bounds_label_length() {
        let long = "x".repeat(200);
        assert_eq!(safe_label(&long).len(), 63);
    }

    #[test]
    fn rejects_invalid_keys() {
        assert_eq!(safe_label_key(""), Err(LabelError::EmptyKey));
        assert_eq!(safe_label_key("!!!"), Err(LabelError::EmptyKey));
        assert!(matches!(
            safe_label_key("1key"),
            Err(LabelError::InvalidKeyStart(_))
        ));
        assert_eq!(safe_label_key("Hello World"), Ok("hello-world".to_string()));
    }
}
