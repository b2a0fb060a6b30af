//! Rank identifiers and ranged rank sets
//!
//! Rank sets are written the way operators type them: `"0-3,7,9-10"`.
//! An empty set means "every known rank" to the fanout coordinator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Identifier of one storage-engine process on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(pub u32);

impl Rank {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Rank {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Ordered, duplicate-free set of ranks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RankSet(BTreeSet<Rank>);

impl RankSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.0.contains(&rank)
    }

    pub fn insert(&mut self, rank: Rank) -> bool {
        self.0.insert(rank)
    }

    pub fn iter(&self) -> impl Iterator<Item = Rank> + '_ {
        self.0.iter().copied()
    }

    pub fn as_set(&self) -> &BTreeSet<Rank> {
        &self.0
    }

    pub fn into_set(self) -> BTreeSet<Rank> {
        self.0
    }
}

impl FromIterator<Rank> for RankSet {
    fn from_iter<I: IntoIterator<Item = Rank>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<u32> for RankSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().map(Rank).collect())
    }
}

impl From<BTreeSet<Rank>> for RankSet {
    fn from(set: BTreeSet<Rank>) -> Self {
        Self(set)
    }
}

impl FromStr for RankSet {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidRankSet {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim().trim_start_matches('[').trim_end_matches(']');
        let mut set = BTreeSet::new();
        if trimmed.trim().is_empty() {
            return Ok(Self(set));
        }

        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(invalid("empty element".into()));
            }

            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo
                        .trim()
                        .parse()
                        .map_err(|_| invalid(format!("bad range start '{}'", lo)))?;
                    let hi: u32 = hi
                        .trim()
                        .parse()
                        .map_err(|_| invalid(format!("bad range end '{}'", hi)))?;
                    if lo > hi {
                        return Err(invalid(format!("descending range {}-{}", lo, hi)));
                    }
                    set.extend((lo..=hi).map(Rank));
                }
                None => {
                    let id: u32 = part
                        .parse()
                        .map_err(|_| invalid(format!("bad rank '{}'", part)))?;
                    set.insert(Rank(id));
                }
            }
        }

        Ok(Self(set))
    }
}

impl TryFrom<String> for RankSet {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RankSet> for String {
    fn from(set: RankSet) -> Self {
        set.to_string()
    }
}

impl std::fmt::Display for RankSet {
    /// Compresses consecutive ranks into ranges
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        let mut iter = self.0.iter().map(|r| r.0).peekable();

        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next == end + 1 {
                    end = next;
                    iter.next();
                } else {
                    break;
                }
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
        }

        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges() {
        let set: RankSet = "0-3,7,9-10".parse().unwrap();
        let ranks: Vec<u32> = set.iter().map(Rank::get).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 7, 9, 10]);
    }

    #[test]
    fn test_parse_duplicates_collapse() {
        let set: RankSet = "1,1,0-2".parse().unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_parse_empty_means_all() {
        let set: RankSet = "".parse().unwrap();
        assert!(set.is_empty());
        let set: RankSet = "[]".parse().unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("1,,2".parse::<RankSet>().is_err());
        assert!("a-b".parse::<RankSet>().is_err());
        assert!("5-2".parse::<RankSet>().is_err());
        assert!("-1".parse::<RankSet>().is_err());
    }

    #[test]
    fn test_display_compresses() {
        let set: RankSet = [0u32, 1, 2, 5, 7, 8].into_iter().collect();
        assert_eq!(set.to_string(), "0-2,5,7-8");
    }

    #[test]
    fn test_serde_as_string() {
        let set: RankSet = "[0-1,4]".parse().unwrap();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"0-1,4\"");
        let back: RankSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
