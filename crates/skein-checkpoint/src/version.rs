use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque, totally-ordered version token for a channel.
///
/// Versions are assigned by the write applier, never by channels
/// themselves. `Int` is the default single-process scheme; `Hybrid`
/// carries a random tiebreak for uniqueness across writers that share a
/// sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelVersion {
    Int(u64),
    Hybrid { seq: u64, tie: String },
}

impl ChannelVersion {
    /// Sentinel version that sorts below every generated version. Used as
    /// the comparison base for channels a node has never seen.
    pub fn null() -> Self {
        ChannelVersion::Int(0)
    }

    fn seq(&self) -> u64 {
        match self {
            ChannelVersion::Int(n) => *n,
            ChannelVersion::Hybrid { seq, .. } => *seq,
        }
    }

    fn tie(&self) -> Option<&str> {
        match self {
            ChannelVersion::Int(_) => None,
            ChannelVersion::Hybrid { tie, .. } => Some(tie),
        }
    }
}

impl Ord for ChannelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq()
            .cmp(&other.seq())
            .then_with(|| self.tie().cmp(&other.tie()))
    }
}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pure function from the current maximum version to the next version.
/// Injected into the write applier so the version scheme is pluggable.
pub type VersionGenerator = Arc<dyn Fn(Option<&ChannelVersion>) -> ChannelVersion + Send + Sync>;

/// Default integer version scheme.
pub fn increment(current: Option<&ChannelVersion>) -> ChannelVersion {
    ChannelVersion::Int(current.map(|v| v.seq()).unwrap_or(0) + 1)
}

/// Hybrid version scheme: integer sequence plus a random tiebreak.
pub fn hybrid_increment(current: Option<&ChannelVersion>) -> ChannelVersion {
    let tie = Uuid::new_v4().simple().to_string();
    ChannelVersion::Hybrid {
        seq: current.map(|v| v.seq()).unwrap_or(0) + 1,
        tie: tie[..8].to_string(),
    }
}

/// Maximum version across a channel-version map, if any.
pub fn max_version(versions: &HashMap<String, ChannelVersion>) -> Option<&ChannelVersion> {
    versions.values().max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_versions_order_by_sequence() {
        assert!(ChannelVersion::Int(1) < ChannelVersion::Int(2));
        assert!(ChannelVersion::null() < ChannelVersion::Int(1));
    }

    #[test]
    fn hybrid_versions_order_by_sequence_then_tie() {
        let a = ChannelVersion::Hybrid {
            seq: 3,
            tie: "aa".into(),
        };
        let b = ChannelVersion::Hybrid {
            seq: 3,
            tie: "bb".into(),
        };
        let c = ChannelVersion::Hybrid {
            seq: 4,
            tie: "aa".into(),
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn int_sorts_below_hybrid_at_same_sequence() {
        let int = ChannelVersion::Int(2);
        let hybrid = ChannelVersion::Hybrid {
            seq: 2,
            tie: String::new(),
        };
        assert!(int < hybrid);
    }

    #[test]
    fn increment_from_nothing_starts_at_one() {
        assert_eq!(increment(None), ChannelVersion::Int(1));
    }

    #[test]
    fn increment_advances_past_current() {
        let current = ChannelVersion::Int(7);
        assert_eq!(increment(Some(&current)), ChannelVersion::Int(8));
    }

    #[test]
    fn increment_advances_past_hybrid() {
        let current = ChannelVersion::Hybrid {
            seq: 7,
            tie: "zz".into(),
        };
        assert!(increment(Some(&current)) > ChannelVersion::Int(7));
    }

    #[test]
    fn hybrid_increment_is_strictly_greater() {
        let current = ChannelVersion::Int(5);
        let next = hybrid_increment(Some(&current));
        assert!(next > current);
    }

    #[test]
    fn max_version_over_map() {
        let mut versions = HashMap::new();
        versions.insert("a".to_string(), ChannelVersion::Int(1));
        versions.insert("b".to_string(), ChannelVersion::Int(5));
        versions.insert("c".to_string(), ChannelVersion::Int(3));
        assert_eq!(max_version(&versions), Some(&ChannelVersion::Int(5)));
    }

    #[test]
    fn max_version_of_empty_map() {
        let versions = HashMap::new();
        assert_eq!(max_version(&versions), None);
    }

    #[test]
    fn serde_roundtrip_preserves_ordering() {
        let a = ChannelVersion::Int(2);
        let b = ChannelVersion::Hybrid {
            seq: 2,
            tie: "ab".into(),
        };
        let a2: ChannelVersion =
            serde_json::from_str(&serde_json::to_string(&a).unwrap()).unwrap();
        let b2: ChannelVersion =
            serde_json::from_str(&serde_json::to_string(&b).unwrap()).unwrap();
        assert_eq!(a, a2);
        assert_eq!(b, b2);
        assert!(a2 < b2);
    }
}
