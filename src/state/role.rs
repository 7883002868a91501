//! Replica Role Tracking
//!
//! Holds whether this replica is currently the leader. The value is written
//! by whoever decides leadership (the cluster coordinator, an operator via
//! the admin API) and read by every request worker.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Role of this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Authoritative for writes
    Leader,
    /// Serves reads only
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
        }
    }
}

#[derive(Debug)]
struct RoleState {
    role: Role,
    /// Number of role transitions since start
    transitions: u64,
}

/// Tracks the current role. Starts as follower; nothing is persisted.
#[derive(Debug)]
pub struct RoleTracker {
    state: RwLock<RoleState>,
}

impl Default for RoleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RoleTracker {
    /// Create a tracker in the follower role
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RoleState {
                role: Role::Follower,
                transitions: 0,
            }),
        }
    }

    /// Check if this replica is the leader
    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Current role snapshot
    pub fn role(&self) -> Role {
        // A poisoned lock still holds a fully written Copy value.
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.role
    }

    /// Number of role changes observed since start
    pub fn transitions(&self) -> u64 {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.transitions
    }

    /// Take over write authority
    pub fn become_leader(&self) {
        self.set(Role::Leader);
    }

    /// Give up write authority and serve reads only
    pub fn become_available(&self) {
        self.set(Role::Follower);
    }

    fn set(&self, role: Role) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.role != role {
            state.role = role;
            state.transitions += 1;
            tracing::info!("Replica role changed to {}", role);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_starts_as_follower() {
        let tracker = RoleTracker::new();
        assert!(!tracker.is_leader());
        assert_eq!(tracker.role(), Role::Follower);
        assert_eq!(tracker.transitions(), 0);
    }

    #[test]
    fn test_transitions() {
        let tracker = RoleTracker::new();
        tracker.become_leader();
        assert!(tracker.is_leader());

        // Repeated promotion is not a transition
        tracker.become_leader();
        assert_eq!(tracker.transitions(), 1);

        tracker.become_available();
        assert!(!tracker.is_leader());
        assert_eq!(tracker.transitions(), 2);
    }

    #[test]
    fn test_concurrent_readers_see_whole_values() {
        let tracker = Arc::new(RoleTracker::new());

        let writer = {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    if i % 2 == 0 {
                        tracker.become_leader();
                    } else {
                        tracker.become_available();
                    }
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let role = tracker.role();
                        assert!(role == Role::Leader || role == Role::Follower);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(tracker.transitions(), 1000);
    }
}
