//! Leadership
//!
//! Cluster-wide operations run only on the leader. Followers reject them
//! with `NotLeader` naming the current leader so the caller can redirect.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Answer to a leader query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub leader: String,
    /// Hosts eligible for leadership
    pub replicas: Vec<String>,
    pub is_leader: bool,
}

pub trait LeaderResolver: Send + Sync {
    /// Current leader address
    fn leader(&self) -> Option<String>;

    /// This host's address
    fn local(&self) -> &str;

    fn replicas(&self) -> Vec<String>;

    fn is_leader(&self) -> bool {
        self.leader().as_deref() == Some(self.local())
    }

    fn info(&self) -> LeaderInfo {
        LeaderInfo {
            leader: self.leader().unwrap_or_default(),
            replicas: self.replicas(),
            is_leader: self.is_leader(),
        }
    }

    /// Fail unless this host is the leader
    fn require_leader(&self) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }
        Err(Error::NotLeader {
            leader: self.leader().unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

/// Leader fixed by configuration: the first access point
#[derive(Debug, Clone)]
pub struct StaticLeader {
    local: String,
    access_points: Vec<String>,
}

impl StaticLeader {
    pub fn new(local: impl Into<String>, access_points: Vec<String>) -> Self {
        Self {
            local: local.into(),
            access_points,
        }
    }

    /// Single-host cluster led by itself
    pub fn solo(local: impl Into<String>) -> Self {
        let local = local.into();
        Self::new(local.clone(), vec![local])
    }
}

impl LeaderResolver for StaticLeader {
    fn leader(&self) -> Option<String> {
        self.access_points.first().cloned()
    }

    fn local(&self) -> &str {
        &self.local
    }

    fn replicas(&self) -> Vec<String> {
        self.access_points.clone()
    }
}
