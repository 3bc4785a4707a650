//! Validity tokens attached to cached fragments.
//!
//! A token is a frozen freshness claim made when an entry was cached. Checking
//! it never mutates it; a token that has gone stale stays stale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of a freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Validity {
    /// The cached content may be served as-is.
    Valid,
    /// The cached content is out of date.
    Invalid,
    /// Freshness cannot be decided from the token alone.
    Unknown,
}

impl Validity {
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Freshness marker stored alongside a cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidityToken {
    /// Valid while `now < created_at + duration`.
    Expires {
        created_at: DateTime<Utc>,
        /// Lifetime in milliseconds.
        duration_ms: i64,
    },
    /// Never expires on its own.
    Always,
}

impl ValidityToken {
    /// Create an expiry token starting now.
    pub fn expires(duration: Duration) -> Self {
        Self::expires_at(Utc::now(), duration)
    }

    /// Create an expiry token starting at `created_at`.
    pub fn expires_at(created_at: DateTime<Utc>, duration: Duration) -> Self {
        Self::Expires {
            created_at,
            duration_ms: i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Check freshness against the current clock.
    pub fn check(&self) -> Validity {
        self.check_at(Utc::now())
    }

    /// Check freshness against an explicit instant.
    pub fn check_at(&self, now: DateTime<Utc>) -> Validity {
        match self {
            Self::Expires {
                created_at,
                duration_ms,
            } => match deadline(*created_at, *duration_ms) {
                Some(deadline) if now < deadline => Validity::Valid,
                Some(_) => Validity::Invalid,
                // Deadline beyond the representable range
                None => Validity::Valid,
            },
            Self::Always => Validity::Valid,
        }
    }

    /// When this token stops being valid, if ever.
    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Expires {
                created_at,
                duration_ms,
            } => deadline(*created_at, *duration_ms),
            Self::Always => None,
        }
    }
}

fn deadline(created_at: DateTime<Utc>, duration_ms: i64) -> Option<DateTime<Utc>> {
    chrono::Duration::try_milliseconds(duration_ms).and_then(|d| created_at.checked_add_signed(d))
}

/// Combine several token checks into one verdict.
///
/// Any `Invalid` wins, then any `Unknown`. An empty set is `Unknown`.
pub fn aggregate<I>(checks: I) -> Validity
where
    I: IntoIterator<Item = Validity>,
{
    let mut seen_any = false;
    let mut unknown = false;
    for check in checks {
        seen_any = true;
        match check {
            Validity::Invalid => return Validity::Invalid,
            Validity::Unknown => unknown = true,
            Validity::Valid => {}
        }
    }
    if !seen_any || unknown {
        Validity::Unknown
    } else {
        Validity::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_valid_before_deadline() {
        let t0 = Utc::now();
        let token = ValidityToken::expires_at(t0, Duration::from_secs(60));

        assert_eq!(token.check_at(t0), Validity::Valid);
        assert_eq!(
            token.check_at(t0 + chrono::Duration::seconds(59)),
            Validity::Valid
        );
    }

    #[test]
    fn test_expires_invalid_at_and_after_deadline() {
        let t0 = Utc::now();
        let token = ValidityToken::expires_at(t0, Duration::from_secs(60));

        assert_eq!(
            token.check_at(t0 + chrono::Duration::seconds(60)),
            Validity::Invalid
        );
        assert_eq!(
            token.check_at(t0 + chrono::Duration::hours(1)),
            Validity::Invalid
        );
    }

    #[test]
    fn test_zero_duration_is_immediately_invalid() {
        let t0 = Utc::now();
        let token = ValidityToken::expires_at(t0, Duration::ZERO);
        assert_eq!(token.check_at(t0), Validity::Invalid);
    }

    #[test]
    fn test_always_is_valid() {
        assert_eq!(ValidityToken::Always.check(), Validity::Valid);
        assert!(ValidityToken::Always.expires_on().is_none());
    }

    #[test]
    fn test_expires_on() {
        let t0 = Utc::now();
        let token = ValidityToken::expires_at(t0, Duration::from_secs(5));
        assert_eq!(token.expires_on(), Some(t0 + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_aggregate() {
        use Validity::*;
        assert_eq!(aggregate(std::iter::empty()), Unknown);
        assert_eq!(aggregate([Valid, Valid]), Valid);
        assert_eq!(aggregate([Valid, Unknown]), Unknown);
        assert_eq!(aggregate([Unknown, Invalid]), Invalid);
    }

    #[test]
    fn test_token_serde_roundtrip() {
        let token = ValidityToken::expires(Duration::from_secs(60));
        let json = serde_json::to_string(&token).expect("serialize should succeed");
        let back: ValidityToken = serde_json::from_str(&json).expect("deserialize should succeed");
        assert_eq!(token, back);
    }
}
