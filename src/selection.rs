//! Selection resolver
//!
//! Turns an include/exclude request into an execution plan. This is a pure
//! function of the tree snapshot: it performs no I/O and never loads files.
//!
//! When a case is excluded, its file can no longer run as one unit, so the
//! file is "broken up" into its remaining cases.

use serde::Serialize;
use std::collections::HashSet;

use crate::id::NodeId;
use crate::tree::TreeStore;

/// What a run should execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "plan", content = "nodes", rename_all = "snake_case")]
pub enum Plan {
    /// The whole suite as one opaque operation
    RunAll,
    /// Individual nodes, no id twice
    Queue(Vec<NodeId>),
}

impl Plan {
    pub fn len(&self) -> Option<usize> {
        match self {
            Plan::RunAll => None,
            Plan::Queue(nodes) => Some(nodes.len()),
        }
    }

    pub fn is_run_all(&self) -> bool {
        matches!(self, Plan::RunAll)
    }
}

/// Resolve a run request against the tree
///
/// An empty `include` means "the whole tree". Exclusion always wins over
/// inclusion. Excluded ids that are not in the tree (e.g. cases of a file
/// that was never loaded) have no effect.
pub fn resolve(tree: &TreeStore, include: &[NodeId], exclude: &[NodeId]) -> Plan {
    if include.is_empty() && exclude.is_empty() {
        return Plan::RunAll;
    }

    let excluded: HashSet<&NodeId> = exclude.iter().collect();
    let broken_up: HashSet<&NodeId> = exclude
        .iter()
        .filter_map(|id| tree.get(id))
        .filter_map(|node| node.parent.as_ref())
        .collect();

    let candidates: Vec<&NodeId> = if include.is_empty() {
        tree.file_ids().iter().collect()
    } else {
        include.iter().collect()
    };

    let mut queue = Vec::new();
    let mut seen = HashSet::new();
    let mut enqueue = |id: &NodeId| {
        if !excluded.contains(id) && seen.insert(id.clone()) {
            queue.push(id.clone());
        }
    };

    for candidate in candidates {
        let Some(node) = tree.get(candidate) else {
            tracing::debug!(id = %candidate, "ignoring unknown node in selection");
            continue;
        };

        if broken_up.contains(candidate) {
            if excluded.contains(candidate) {
                continue;
            }
            for child in &node.children {
                enqueue(child);
            }
        } else {
            enqueue(candidate);
        }
    }

    tracing::info!("{} node(s) enqueued", queue.len());
    Plan::Queue(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::encode;
    use crate::test_model::CaseSpan;
    use std::path::Path;

    /// File A with cases A1, A2 and file B with case B1
    fn sample_tree() -> TreeStore {
        let mut tree = TreeStore::new();
        let a = tree.upsert_file(Path::new("A")).unwrap().id;
        let b = tree.upsert_file(Path::new("B")).unwrap().id;
        tree.set_children(&a, &[CaseSpan::new("A1", 1), CaseSpan::new("A2", 2)])
            .unwrap();
        tree.set_children(&b, &[CaseSpan::new("B1", 1)]).unwrap();
        tree
    }

    fn file(name: &str) -> NodeId {
        encode(name, None)
    }

    fn case(file: &str, name: &str) -> NodeId {
        encode(file, Some(name))
    }

    fn queue(plan: Plan) -> HashSet<NodeId> {
        match plan {
            Plan::Queue(nodes) => {
                let set: HashSet<NodeId> = nodes.iter().cloned().collect();
                assert_eq!(set.len(), nodes.len(), "queue contains duplicates");
                set
            }
            Plan::RunAll => panic!("expected a queue"),
        }
    }

    #[test]
    fn test_empty_selection_runs_all() {
        assert_eq!(resolve(&sample_tree(), &[], &[]), Plan::RunAll);
    }

    #[test]
    fn test_excluded_case_breaks_up_its_file() {
        let plan = resolve(&sample_tree(), &[file("A")], &[case("A", "A2")]);
        assert_eq!(queue(plan), HashSet::from([case("A", "A1")]));
    }

    #[test]
    fn test_exclude_only_uses_all_files() {
        let plan = resolve(&sample_tree(), &[], &[case("A", "A2")]);
        assert_eq!(queue(plan), HashSet::from([case("A", "A1"), file("B")]));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let tree = sample_tree();
        let plan = resolve(&tree, &[file("A"), file("B")], &[file("B")]);
        assert_eq!(queue(plan), HashSet::from([file("A")]));

        let plan = resolve(&tree, &[case("A", "A1"), case("B", "B1")], &[case("A", "A1")]);
        assert_eq!(queue(plan), HashSet::from([case("B", "B1")]));
    }

    #[test]
    fn test_excluding_whole_file_and_its_case() {
        let plan = resolve(&sample_tree(), &[file("A")], &[file("A"), case("A", "A1")]);
        assert!(queue(plan).is_empty());
    }

    #[test]
    fn test_duplicates_are_removed() {
        let plan = resolve(
            &sample_tree(),
            &[file("A"), case("A", "A1"), file("A")],
            &[case("A", "A2")],
        );
        assert_eq!(queue(plan), HashSet::from([case("A", "A1")]));

        let plan = resolve(&sample_tree(), &[file("B"), file("B")], &[]);
        assert_eq!(queue(plan), HashSet::from([file("B")]));
    }

    #[test]
    fn test_excluding_unloaded_case_is_noop() {
        let mut tree = sample_tree();
        tree.upsert_file(Path::new("C")).unwrap();

        let plan = resolve(&tree, &[file("C")], &[case("C", "never loaded")]);
        assert_eq!(queue(plan), HashSet::from([file("C")]));
    }

    #[test]
    fn test_unknown_include_is_skipped() {
        let plan = resolve(&sample_tree(), &[file("Z"), file("B")], &[]);
        assert_eq!(queue(plan), HashSet::from([file("B")]));
    }
}
