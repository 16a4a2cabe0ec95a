//! Event-name patterns.
//!
//! Two forms are admitted: `*` (every event) and `prefix:*` (the event
//! `prefix` itself or anything under `prefix:`). Every other literal is
//! rejected at subscription time.

use std::fmt;

use smol_str::SmolStr;

use super::BusError;

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Matches every event.
    Any,
    /// Matches `prefix` and `prefix:…`.
    Prefix(SmolStr),
}

impl Pattern {
    /// Parses a pattern literal.
    pub fn parse(literal: &str) -> Result<Pattern, BusError> {
        if literal == "*" {
            return Ok(Pattern::Any);
        }
        if let Some(prefix) = literal.strip_suffix(":*") {
            if prefix.is_empty() {
                return Err(BusError::InvalidPattern(literal.to_owned()));
            }
            return Ok(Pattern::Prefix(SmolStr::new(prefix)));
        }
        Err(BusError::InvalidPattern(literal.to_owned()))
    }

    /// Whether `event` falls under this pattern.
    pub fn matches(&self, event: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Prefix(prefix) => {
                event == prefix.as_str()
                    || (event.len() > prefix.len()
                        && event.starts_with(prefix.as_str())
                        && event.as_bytes()[prefix.len()] == b':')
            }
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Prefix(prefix) => write!(f, "{prefix}:*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        let p = Pattern::parse("*").unwrap();
        assert!(p.matches("request:start"));
        assert!(p.matches("x"));
    }

    #[test]
    fn prefix_matches_itself_and_descendants() {
        let p = Pattern::parse("user:*").unwrap();
        assert!(p.matches("user"));
        assert!(p.matches("user:create"));
        assert!(p.matches("user:create:audit"));
        assert!(!p.matches("users"));
        assert!(!p.matches("order:create"));
    }

    #[test]
    fn other_literals_are_rejected() {
        assert!(matches!(Pattern::parse(":*"), Err(BusError::InvalidPattern(_))));
        assert!(matches!(Pattern::parse("user:create"), Err(BusError::InvalidPattern(_))));
        assert!(matches!(Pattern::parse("user:*:x"), Err(BusError::InvalidPattern(_))));
        assert!(matches!(Pattern::parse(""), Err(BusError::InvalidPattern(_))));
    }
}
