//! Reconciliation planning
//!
//! The set of groups on disk, the set of tracked groups and the set of
//! configured classes are diffed into a list of actions before anything is
//! touched.

use std::collections::{BTreeMap, BTreeSet};

use crate::resolver::{is_root_class, ROOT_CLASS_NAME};

/// One step of a reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// Remove a stale group from disk and stop tracking it
    Remove(String),
    /// Stop tracking a group without touching the filesystem
    Untrack(String),
    /// Start tracking the root group again
    TrackRoot,
    /// Create the directory of a configured class and track it
    Create(String),
    /// Write the schemata of a configured class
    Configure(String),
}

/// Diff the current state against the configured classes
///
/// `on_disk` holds the classes found with the active prefix, `tracked` maps
/// the tracked classes to their directory prefix. Actions are ordered:
/// removals first, then tracking changes, creations and finally updates.
pub fn plan_reconcile(
    on_disk: &BTreeSet<String>,
    tracked: &BTreeMap<String, String>,
    desired: &BTreeSet<String>,
    prefix: &str,
) -> Vec<GroupAction> {
    let mut actions = Vec::new();
    let mut remaining: BTreeSet<&str> = tracked.keys().map(String::as_str).collect();

    for name in on_disk {
        if !is_root_class(name) && !desired.contains(name) {
            actions.push(GroupAction::Remove(name.clone()));
            remaining.remove(name.as_str());
        }
    }

    for (name, group_prefix) in tracked {
        if is_root_class(name) || !remaining.contains(name.as_str()) {
            continue;
        }
        if !desired.contains(name) || group_prefix != prefix {
            actions.push(GroupAction::Untrack(name.clone()));
            remaining.remove(name.as_str());
        }
    }

    if !remaining.contains(ROOT_CLASS_NAME) {
        actions.push(GroupAction::TrackRoot);
        remaining.insert(ROOT_CLASS_NAME);
    }

    for name in desired {
        if !remaining.contains(name.as_str()) {
            actions.push(GroupAction::Create(name.clone()));
        }
    }

    actions.extend(desired.iter().cloned().map(GroupAction::Configure));
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use GroupAction::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn tracked(groups: &[(&str, &str)]) -> BTreeMap<String, String> {
        groups
            .iter()
            .map(|(n, p)| (n.to_string(), p.to_string()))
            .collect()
    }

    #[test]
    fn test_plan_initial() {
        let actions = plan_reconcile(
            &set(&[ROOT_CLASS_NAME]),
            &tracked(&[(ROOT_CLASS_NAME, "rdt-")]),
            &set(&["a", "b"]),
            "rdt-",
        );
        assert_eq!(
            actions,
            [
                Create("a".to_string()),
                Create("b".to_string()),
                Configure("a".to_string()),
                Configure("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_plan_removes_stale() {
        let actions = plan_reconcile(
            &set(&[ROOT_CLASS_NAME, "a", "old"]),
            &tracked(&[(ROOT_CLASS_NAME, "rdt-"), ("a", "rdt-"), ("old", "rdt-")]),
            &set(&["a", ROOT_CLASS_NAME]),
            "rdt-",
        );
        assert_eq!(
            actions,
            [
                Remove("old".to_string()),
                Configure("a".to_string()),
                Configure(ROOT_CLASS_NAME.to_string()),
            ]
        );
    }

    #[test]
    fn test_plan_untracks_other_prefix() {
        // "b" was adopted from another prefix, "gone" vanished from disk
        let actions = plan_reconcile(
            &set(&[ROOT_CLASS_NAME]),
            &tracked(&[(ROOT_CLASS_NAME, ""), ("b", "other-"), ("gone", "rdt-")]),
            &set(&["b"]),
            "rdt-",
        );
        assert_eq!(
            actions,
            [
                Untrack("b".to_string()),
                Untrack("gone".to_string()),
                Create("b".to_string()),
                Configure("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_plan_tracks_root() {
        let actions = plan_reconcile(&set(&[]), &tracked(&[]), &set(&[]), "");
        assert_eq!(actions, [TrackRoot]);
    }

    #[test]
    fn test_plan_never_removes_root() {
        let actions = plan_reconcile(
            &set(&[ROOT_CLASS_NAME]),
            &tracked(&[(ROOT_CLASS_NAME, "")]),
            &set(&[]),
            "",
        );
        assert!(actions.is_empty());
    }
}
