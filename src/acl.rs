//! Per-command access control.
//!
//! Policy is a map from command name to the set of usernames allowed
//! to run it, populated from the `[acl]` config section. Evaluation is
//! set membership: deterministic and independent of entry order. A
//! command with no entry denies everyone; authorization fails closed.

use std::collections::{HashMap, HashSet};

/// Per-command username allowlists.
#[derive(Debug, Default, Clone)]
pub struct Acl {
    allow: HashMap<String, HashSet<String>>,
}

impl Acl {
    /// An ACL that denies everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an ACL from `(command, comma-separated users)` entries.
    #[must_use]
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut allow: HashMap<String, HashSet<String>> = HashMap::new();
        for (command, users) in entries {
            let set = allow.entry(command.trim().to_string()).or_default();
            set.extend(
                users
                    .split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string),
            );
        }
        allow.retain(|_, users| !users.is_empty());
        Self { allow }
    }

    /// True if `user` may run `command`.
    #[must_use]
    pub fn allows(&self, user: &str, command: &str) -> bool {
        self.allow
            .get(command)
            .is_some_and(|users| users.contains(user))
    }

    /// Number of commands with at least one allowed user.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allow.len()
    }

    /// True if no command is allowed for anyone.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_listed_user() {
        let acl = Acl::from_entries([("echo", "alice,bob")]);
        assert!(acl.allows("alice", "echo"));
        assert!(acl.allows("bob", "echo"));
        assert!(!acl.allows("carol", "echo"));
    }

    #[test]
    fn test_unlisted_command_denies_everyone() {
        let acl = Acl::from_entries([("echo", "alice")]);
        assert!(!acl.allows("alice", "reboot"));
    }

    #[test]
    fn test_empty_acl_denies_everything() {
        let acl = Acl::new();
        assert!(!acl.allows("alice", "echo"));
        assert!(acl.is_empty());
    }

    #[test]
    fn test_whitespace_and_empty_entries_trimmed() {
        let acl = Acl::from_entries([("echo", " alice , ,bob ")]);
        assert!(acl.allows("alice", "echo"));
        assert!(acl.allows("bob", "echo"));
        assert!(!acl.allows("", "echo"));
    }

    #[test]
    fn test_entry_order_is_irrelevant() {
        let forward = Acl::from_entries([("a", "x,y"), ("b", "z")]);
        let backward = Acl::from_entries([("b", "z"), ("a", "y,x")]);
        for (user, command) in [("x", "a"), ("y", "a"), ("z", "b"), ("z", "a")] {
            assert_eq!(
                forward.allows(user, command),
                backward.allows(user, command)
            );
        }
    }

    #[test]
    fn test_blank_user_list_denies() {
        let acl = Acl::from_entries([("echo", " , ,")]);
        assert!(!acl.allows("alice", "echo"));
        assert!(acl.is_empty());
    }
}
