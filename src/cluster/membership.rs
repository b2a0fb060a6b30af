//! Cluster membership
//!
//! Which host runs which ranks, plus the last engine state seen for each
//! rank through system queries and cluster events.

use crate::domain::{EngineState, Rank, RankSet};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// A host and the ranks it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMember {
    /// Transport address, e.g. `10.0.0.2:8090`
    pub host: String,
    pub ranks: RankSet,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub host: String,
    #[serde(default)]
    pub ranks: RankSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub host: String,
    pub ranks: RankSet,
    /// False when the host was already a member and got updated
    pub created: bool,
}

/// Requested ranks split by owning host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankGroups {
    pub by_host: BTreeMap<String, RankSet>,
    /// Requested ranks no member owns
    pub unknown: BTreeSet<Rank>,
}

#[derive(Debug, Default)]
pub struct Membership {
    members: RwLock<BTreeMap<String, HostMember>>,
    states: RwLock<BTreeMap<Rank, EngineState>>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host or replace its rank list.
    ///
    /// A rank can belong to only one host.
    pub fn join(&self, request: JoinRequest) -> Result<JoinResponse> {
        if request.host.trim().is_empty() {
            return Err(Error::MissingParameter("host".into()));
        }

        let mut members = self.members.write();
        for (host, member) in members.iter() {
            if host == &request.host {
                continue;
            }
            if let Some(rank) = request.ranks.iter().find(|r| member.ranks.contains(*r)) {
                return Err(Error::InvalidRequest(format!(
                    "rank {} already belongs to host {}",
                    rank, host
                )));
            }
        }

        let created = !members.contains_key(&request.host);
        members.insert(
            request.host.clone(),
            HostMember {
                host: request.host.clone(),
                ranks: request.ranks.clone(),
                joined_at: Utc::now(),
            },
        );
        drop(members);

        info!(host = %request.host, ranks = %request.ranks, created, "Host joined");
        Ok(JoinResponse {
            host: request.host,
            ranks: request.ranks,
            created,
        })
    }

    pub fn hosts(&self) -> Vec<HostMember> {
        self.members.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn host_of(&self, rank: Rank) -> Option<String> {
        self.members
            .read()
            .values()
            .find(|m| m.ranks.contains(rank))
            .map(|m| m.host.clone())
    }

    pub fn all_ranks(&self) -> BTreeSet<Rank> {
        self.members
            .read()
            .values()
            .flat_map(|m| m.ranks.iter())
            .collect()
    }

    /// Split `ranks` by owning host; an empty set selects every member's ranks
    pub fn group(&self, ranks: &RankSet) -> RankGroups {
        let members = self.members.read();
        let mut groups = RankGroups::default();

        if ranks.is_empty() {
            for member in members.values().filter(|m| !m.ranks.is_empty()) {
                groups.by_host.insert(member.host.clone(), member.ranks.clone());
            }
            return groups;
        }

        for rank in ranks.iter() {
            match members.values().find(|m| m.ranks.contains(rank)) {
                Some(member) => {
                    groups
                        .by_host
                        .entry(member.host.clone())
                        .or_default()
                        .insert(rank);
                }
                None => {
                    groups.unknown.insert(rank);
                }
            }
        }
        groups
    }

    /// Record the state last reported for a rank
    pub fn record_state(&self, rank: Rank, state: EngineState) {
        self.states.write().insert(rank, state);
    }

    pub fn last_state(&self, rank: Rank) -> Option<EngineState> {
        self.states.read().get(&rank).copied()
    }

    pub fn states(&self) -> BTreeMap<Rank, EngineState> {
        self.states.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn join(membership: &Membership, host: &str, ranks: &str) -> Result<JoinResponse> {
        membership.join(JoinRequest {
            host: host.to_string(),
            ranks: ranks.parse().unwrap(),
        })
    }

    #[test]
    fn test_join_and_lookup() {
        let membership = Membership::new();
        assert!(join(&membership, "a", "0-1").unwrap().created);
        assert!(join(&membership, "b", "2-3").unwrap().created);

        assert_eq!(membership.host_of(Rank(3)).as_deref(), Some("b"));
        assert_eq!(membership.all_ranks().len(), 4);

        // rejoin replaces the rank list
        assert!(!join(&membership, "a", "0").unwrap().created);
        assert_eq!(membership.host_of(Rank(1)), None);
    }

    #[test]
    fn test_rank_owned_by_one_host() {
        let membership = Membership::new();
        join(&membership, "a", "0-1").unwrap();
        assert_matches!(join(&membership, "b", "1-2"), Err(Error::InvalidRequest(_)));
        assert_matches!(join(&membership, " ", "5"), Err(Error::MissingParameter(_)));
    }

    #[test]
    fn test_group_by_host() {
        let membership = Membership::new();
        join(&membership, "a", "0-1").unwrap();
        join(&membership, "b", "2-3").unwrap();

        let groups = membership.group(&"1-2,9".parse().unwrap());
        assert_eq!(groups.by_host["a"], "1".parse().unwrap());
        assert_eq!(groups.by_host["b"], "2".parse().unwrap());
        assert_eq!(groups.unknown, BTreeSet::from([Rank(9)]));

        let all = membership.group(&RankSet::new());
        assert_eq!(all.by_host.len(), 2);
        assert!(all.unknown.is_empty());
    }
}
