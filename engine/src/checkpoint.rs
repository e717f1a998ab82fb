//! Watermarks and the persisted sync checkpoint.

use crate::{error::Result, CollectionName, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Highest value already processed, per collection.
///
/// A watermark only moves forward: [`Watermark::advance`] keeps the maximum
/// of the current and offered values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(BTreeMap<CollectionName, u64>);

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for a collection, zero if never advanced.
    pub fn get(&self, collection: &str) -> u64 {
        self.0.get(collection).copied().unwrap_or(0)
    }

    /// Raise the value for `collection` to at least `value`.
    /// Returns true if the watermark moved.
    pub fn advance(&mut self, collection: &str, value: u64) -> bool {
        match self.0.get_mut(collection) {
            Some(current) if *current >= value => false,
            Some(current) => {
                *current = value;
                true
            }
            None => {
                self.0.insert(collection.to_string(), value);
                true
            }
        }
    }

    /// Per-collection max with another watermark.
    pub fn merge(&mut self, other: &Watermark) -> bool {
        let mut moved = false;
        for (collection, value) in other.iter() {
            moved |= self.advance(collection, value);
        }
        moved
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(c, v)| (c.as_str(), *v))
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<C: Into<CollectionName>> FromIterator<(C, u64)> for Watermark {
    fn from_iter<I: IntoIterator<Item = (C, u64)>>(iter: I) -> Self {
        let mut watermark = Watermark::new();
        for (collection, value) in iter {
            let collection = collection.into();
            watermark.advance(&collection, value);
        }
        watermark
    }
}

/// Renders the query-string form `tickets:12,users:4`.
impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (collection, value) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{collection}:{value}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Watermark {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut watermark = Watermark::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (collection, value) = part
                .rsplit_once(':')
                .ok_or_else(|| Error::InvalidEntry(format!("malformed watermark part: {part}")))?;
            if collection.is_empty() {
                return Err(Error::InvalidEntry(format!(
                    "watermark part without collection: {part}"
                )));
            }
            let value = value
                .parse::<u64>()
                .map_err(|e| Error::InvalidEntry(format!("bad watermark value in {part}: {e}")))?;
            watermark.advance(collection, value);
        }
        Ok(watermark)
    }
}

/// Where sync left off, persisted after every successful cycle.
///
/// `last_acked_clock` is in this replica's own clock domain (what the
/// authority confirmed it holds). `last_pulled_clock` is in the authority's
/// sequence domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub last_acked_clock: Watermark,
    pub last_pulled_clock: Watermark,
}

impl SyncCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Persistence(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_only_moves_forward() {
        let mut wm = Watermark::new();
        assert_eq!(wm.get("tickets"), 0);
        assert!(wm.advance("tickets", 5));
        assert!(!wm.advance("tickets", 3));
        assert!(!wm.advance("tickets", 5));
        assert_eq!(wm.get("tickets"), 5);
    }

    #[test]
    fn merge_takes_per_collection_max() {
        let mut a: Watermark = [("tickets", 5), ("users", 1)].into_iter().collect();
        let b: Watermark = [("tickets", 2), ("users", 4), ("messageLogs", 7)]
            .into_iter()
            .collect();
        assert!(a.merge(&b));
        assert_eq!(a.get("tickets"), 5);
        assert_eq!(a.get("users"), 4);
        assert_eq!(a.get("messageLogs"), 7);
        assert!(!a.merge(&b));
    }

    #[test]
    fn query_form() {
        let wm: Watermark = [("users", 4), ("tickets", 12)].into_iter().collect();
        assert_eq!(wm.to_string(), "tickets:12,users:4");

        let parsed: Watermark = "tickets:12, users:4".parse().unwrap();
        assert_eq!(parsed, wm);

        let colon: Watermark = [("message:logs", 2)].into_iter().collect();
        assert_eq!(colon.to_string().parse::<Watermark>().unwrap(), colon);

        let empty: Watermark = "".parse().unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn query_form_errors() {
        assert!("tickets".parse::<Watermark>().is_err());
        assert!("tickets:abc".parse::<Watermark>().is_err());
        assert!(":3".parse::<Watermark>().is_err());
    }

    #[test]
    fn json_is_plain_map() {
        let wm: Watermark = [("tickets", 3)].into_iter().collect();
        assert_eq!(serde_json::to_string(&wm).unwrap(), r#"{"tickets":3}"#);
    }

    #[test]
    fn checkpoint_bytes() {
        let mut checkpoint = SyncCheckpoint::new();
        checkpoint.last_acked_clock.advance("tickets", 9);
        checkpoint.last_pulled_clock.advance("users", 2);

        let bytes = checkpoint.to_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("lastAckedClock"));
        assert_eq!(SyncCheckpoint::from_bytes(&bytes).unwrap(), checkpoint);
        assert!(SyncCheckpoint::from_bytes(b"not json").is_err());
    }
}
