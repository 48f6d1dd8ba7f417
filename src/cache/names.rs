//! Owner and group display names.
//!
//! Successful lookups are cached for the life of the process. A miss falls
//! back to the decimal id and is not cached, so accounts added to the system
//! later are picked up on the next call.

use std::collections::HashMap;

use nix::unistd::{Gid, Group, Uid, User};
use tracing::debug;

/// Source of uid/gid to name translations.
pub trait IdentityLookup {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// Looks names up in the system user and group databases.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentities;

impl IdentityLookup for SystemIdentities {
    fn user_name(&self, uid: u32) -> Option<String> {
        match User::from_uid(Uid::from_raw(uid)) {
            Ok(user) => user.map(|u| u.name),
            Err(e) => {
                debug!(uid, "user lookup failed: {}", e);
                None
            }
        }
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        match Group::from_gid(Gid::from_raw(gid)) {
            Ok(group) => group.map(|g| g.name),
            Err(e) => {
                debug!(gid, "group lookup failed: {}", e);
                None
            }
        }
    }
}

/// Append-only uid/gid name caches.
pub struct NameCache<L: IdentityLookup = SystemIdentities> {
    lookup: L,
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl NameCache<SystemIdentities> {
    pub fn new() -> Self {
        Self::with_lookup(SystemIdentities)
    }
}

impl Default for NameCache<SystemIdentities> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: IdentityLookup> NameCache<L> {
    pub fn with_lookup(lookup: L) -> Self {
        NameCache {
            lookup,
            users: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    pub fn user_name(&mut self, uid: u32) -> String {
        if let Some(name) = self.users.get(&uid) {
            return name.clone();
        }
        match self.lookup.user_name(uid) {
            Some(name) => {
                self.users.insert(uid, name.clone());
                name
            }
            None => uid.to_string(),
        }
    }

    pub fn group_name(&mut self, gid: u32) -> String {
        if let Some(name) = self.groups.get(&gid) {
            return name.clone();
        }
        match self.lookup.group_name(gid) {
            Some(name) => {
                self.groups.insert(gid, name.clone());
                name
            }
            None => gid.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingLookup {
        calls: Cell<usize>,
    }

    impl IdentityLookup for CountingLookup {
        fn user_name(&self, uid: u32) -> Option<String> {
            self.calls.set(self.calls.get() + 1);
            (uid == 1000).then(|| "alice".to_string())
        }

        fn group_name(&self, gid: u32) -> Option<String> {
            self.calls.set(self.calls.get() + 1);
            (gid == 100).then(|| "users".to_string())
        }
    }

    #[test]
    fn test_hits_are_cached() {
        let mut names = NameCache::with_lookup(CountingLookup::default());
        assert_eq!(names.user_name(1000), "alice");
        assert_eq!(names.user_name(1000), "alice");
        assert_eq!(names.group_name(100), "users");
        assert_eq!(names.group_name(100), "users");
        assert_eq!(names.lookup.calls.get(), 2);
    }

    #[test]
    fn test_misses_fall_back_and_retry() {
        let mut names = NameCache::with_lookup(CountingLookup::default());
        assert_eq!(names.user_name(4242), "4242");
        assert_eq!(names.user_name(4242), "4242");
        assert_eq!(names.group_name(77), "77");
        assert_eq!(names.lookup.calls.get(), 3);
    }

    #[test]
    fn test_system_lookup_root() {
        // uid 0 exists on every unix system we run on.
        let mut names = NameCache::new();
        assert!(!names.user_name(0).is_empty());
    }
}
