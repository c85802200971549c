//! `DataVersion = (timestamp, counter)` used to detect metadata freshness
//! between master and slave (section 3 / section 4.11 / GLOSSARY).

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataVersion {
    pub timestamp: i64,
    pub counter: i64,
}

impl DataVersion {
    pub fn new(timestamp: i64) -> DataVersion {
        DataVersion { timestamp, counter: 0 }
    }

    /// Is `self` newer than `other`? Mirrors the original's comparison:
    /// timestamp dominates, counter breaks ties at the same timestamp.
    pub fn is_newer_than(&self, other: &DataVersion) -> bool {
        (self.timestamp, self.counter) > (other.timestamp, other.counter)
    }

    pub fn next(&self, now_ms: i64) -> DataVersion {
        if now_ms > self.timestamp {
            DataVersion { timestamp: now_ms, counter: 0 }
        } else {
            DataVersion { timestamp: self.timestamp, counter: self.counter + 1 }
        }
    }
}

impl Default for DataVersion {
    fn default() -> DataVersion {
        DataVersion { timestamp: 0, counter: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_timestamp_wins() {
        let a = DataVersion::new(100);
        let b = DataVersion::new(200);
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
    }

    #[test]
    fn same_timestamp_breaks_tie_on_counter() {
        let a = DataVersion { timestamp: 100, counter: 0 };
        let b = a.next(100);
        assert_eq!(b, DataVersion { timestamp: 100, counter: 1 });
        assert!(b.is_newer_than(&a));
    }

    #[test]
    fn later_timestamp_resets_counter() {
        let a = DataVersion { timestamp: 100, counter: 5 };
        let b = a.next(200);
        assert_eq!(b, DataVersion { timestamp: 200, counter: 0 });
    }
}
