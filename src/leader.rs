//! Leadership oracle
//!
//! State-changing operations only run on the cluster leader. The manager
//! asks once at the start of each operation; losing leadership later shows
//! up as a rejected store write.

use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(test)]
use mockall::automock;

/// Answers whether this node currently leads the cluster
#[cfg_attr(test, automock)]
pub trait LeadershipOracle: Send + Sync {
    /// Whether this node is the leader right now
    fn is_leader(&self) -> bool;
}

/// Leadership flag flipped by whatever runs the election
#[derive(Debug)]
pub struct StaticLeadership {
    leader: AtomicBool,
}

impl StaticLeadership {
    /// Create with the given initial leadership
    pub fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
        }
    }

    /// Record a leadership change
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

impl Default for StaticLeadership {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LeadershipOracle for StaticLeadership {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}
