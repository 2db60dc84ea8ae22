//! Collision policies for block requests hitting an already active block

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// How a new block request interacts with an active one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Replace the active block only if the new one ends later
    #[default]
    OverrideIfGreater,
    /// Always replace the active block, even with an earlier deadline
    Override,
    /// Keep the active block and drop the request
    DontOverride,
    /// Push the active deadline out by the requested duration
    Extend,
}

/// Outcome of resolving a request against an active block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the active block untouched
    Keep,
    /// Replace the active block with the candidate deadline
    Replace(Instant),
    /// Move the active deadline to the given instant, keeping the block
    Extend(Instant),
}

impl CollisionPolicy {
    /// Resolve a request against an active block ending at `current`.
    ///
    /// `candidate` is the deadline the request asks for and `requested` the
    /// duration it asks for, measured from now.
    #[must_use] pub fn resolve(self, current: Instant, candidate: Instant, requested: Duration) -> Resolution {
        match self {
            Self::OverrideIfGreater if candidate > current => Resolution::Replace(candidate),
            Self::OverrideIfGreater | Self::DontOverride => Resolution::Keep,
            Self::Override => Resolution::Replace(candidate),
            Self::Extend if requested.is_zero() => Resolution::Keep,
            Self::Extend => Resolution::Extend(current + requested),
        }
    }
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OverrideIfGreater => "override_if_greater",
            Self::Override => "override",
            Self::DontOverride => "dont_override",
            Self::Extend => "extend",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instants() -> (Instant, Instant, Instant) {
        let now = Instant::now();
        (now, now + Duration::from_millis(50), now + Duration::from_millis(100))
    }

    #[test]
    fn test_override_if_greater() {
        let (_, short, long) = instants();
        let policy = CollisionPolicy::OverrideIfGreater;
        assert_eq!(policy.resolve(short, long, Duration::from_millis(100)), Resolution::Replace(long));
        assert_eq!(policy.resolve(long, short, Duration::from_millis(50)), Resolution::Keep);
    }

    #[test]
    fn test_override_if_greater_tie_keeps_current() {
        let (_, short, _) = instants();
        assert_eq!(
            CollisionPolicy::OverrideIfGreater.resolve(short, short, Duration::from_millis(50)),
            Resolution::Keep
        );
    }

    #[test]
    fn test_override_accepts_shorter() {
        let (_, short, long) = instants();
        assert_eq!(
            CollisionPolicy::Override.resolve(long, short, Duration::from_millis(50)),
            Resolution::Replace(short)
        );
    }

    #[test]
    fn test_dont_override() {
        let (_, short, long) = instants();
        assert_eq!(
            CollisionPolicy::DontOverride.resolve(short, long, Duration::from_millis(100)),
            Resolution::Keep
        );
    }

    #[test]
    fn test_extend_adds_to_current_deadline() {
        let (now, short, long) = instants();
        assert_eq!(
            CollisionPolicy::Extend.resolve(long, short, Duration::from_millis(50)),
            Resolution::Extend(now + Duration::from_millis(150))
        );
        assert_eq!(CollisionPolicy::Extend.resolve(long, now, Duration::ZERO), Resolution::Keep);
    }

    #[test]
    fn test_serde_names() {
        let policy: CollisionPolicy = serde_json::from_str("\"dont_override\"").unwrap();
        assert_eq!(policy, CollisionPolicy::DontOverride);
        assert_eq!(CollisionPolicy::default().to_string(), "override_if_greater");
    }
}
