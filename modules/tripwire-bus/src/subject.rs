//! Hierarchical subject names and wildcard patterns.
//!
//! Tokens are separated by `.`. In patterns, `*` matches exactly one token and
//! `>` (only as the final token) matches one or more trailing tokens.

use crate::error::BusError;

/// Prefix for quarantine subjects.
pub const DLQ_PREFIX: &str = "dlq";

/// Dead-letter subject for a live subject.
pub fn dlq_subject(subject: &str) -> String {
    format!("{DLQ_PREFIX}.{subject}")
}

/// Whether `subject` is matched by `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(p) = pattern_tokens.next() {
        if p == ">" {
            // Must be last and must consume at least one token.
            return pattern_tokens.peek().is_none() && subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == "*" || p == s => continue,
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}

/// Reject empty tokens and misplaced `>`.
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        if *token == ">" && i != tokens.len() - 1 {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_subject_matches_itself() {
        assert!(subject_matches("tripwire.object.created", "tripwire.object.created"));
        assert!(!subject_matches("tripwire.object.created", "tripwire.object.updated"));
    }

    #[test]
    fn star_matches_single_token() {
        assert!(subject_matches("tripwire.object.*", "tripwire.object.created"));
        assert!(!subject_matches("tripwire.object.*", "tripwire.object.created.extra"));
        assert!(!subject_matches("tripwire.object.*", "tripwire.object"));
        assert!(!subject_matches("tripwire.object.*", "tripwire.link.created"));
    }

    #[test]
    fn tail_wildcard_matches_one_or_more_tokens() {
        assert!(subject_matches("tripwire.>", "tripwire.object.created"));
        assert!(subject_matches("tripwire.object.>", "tripwire.object.created"));
        assert!(!subject_matches("tripwire.object.>", "tripwire.object"));
        assert!(!subject_matches("tripwire.>", "dlq.tripwire.object.created"));
    }

    #[test]
    fn dlq_subject_is_prefixed() {
        assert_eq!(dlq_subject("tripwire.object.created"), "dlq.tripwire.object.created");
        assert!(subject_matches("dlq.>", &dlq_subject("tripwire.object.created")));
    }

    #[test]
    fn pattern_validation() {
        assert!(validate_pattern("tripwire.object.*").is_ok());
        assert!(validate_pattern("tripwire.>").is_ok());
        assert!(validate_pattern("tripwire.>.created").is_err());
        assert!(validate_pattern("tripwire..created").is_err());
    }
}
