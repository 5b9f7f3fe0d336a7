//! Remembered group membership

use pulse_shared::GroupName;
use std::collections::BTreeSet;

/// Groups the current identity should belong to.
///
/// Survives reconnects and session recreation; every successful connection
/// rejoins the whole set.
#[derive(Debug, Default, Clone)]
pub struct GroupMembership {
    groups: BTreeSet<GroupName>,
}

impl GroupMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the group was not remembered yet
    pub fn insert(&mut self, group: GroupName) -> bool {
        self.groups.insert(group)
    }

    pub fn remove(&mut self, group: &GroupName) -> bool {
        self.groups.remove(group)
    }

    pub fn contains(&self, group: &GroupName) -> bool {
        self.groups.contains(group)
    }

    /// Copy of the set, safe to iterate while the original keeps changing
    pub fn snapshot(&self) -> Vec<GroupName> {
        self.groups.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}
