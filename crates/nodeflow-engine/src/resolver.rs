use std::collections::HashSet;

use nodeflow_core::graph::NodeMap;
use nodeflow_core::types::NodeId;

/// Close a selection of node ids under "depends on".
///
/// Every node that feeds an input of a selected node (directly or
/// transitively) is added. Selected ids that are not in `nodes` contribute
/// nothing. The result is unordered; run order comes from the latches.
pub fn resolve<I, S>(selected: I, nodes: &NodeMap) -> HashSet<NodeId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut closure: HashSet<NodeId> = HashSet::new();
    let mut worklist: Vec<NodeId> = selected
        .into_iter()
        .filter(|id| nodes.contains_key(id.as_ref()))
        .map(|id| id.as_ref().to_string())
        .collect();

    while let Some(id) = worklist.pop() {
        if closure.contains(&id) {
            continue;
        }
        if let Some(node) = nodes.get(&id) {
            worklist.extend(
                node.source_ids()
                    .filter(|src| !closure.contains(*src))
                    .cloned(),
            );
        }
        closure.insert(id);
    }
    closure
}

/// Keep only the nodes whose ids are in `ids`.
pub fn select(nodes: NodeMap, ids: &HashSet<NodeId>) -> NodeMap {
    nodes
        .into_iter()
        .filter(|(id, _)| ids.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_core::graph::NodeInstance;

    fn chain() -> NodeMap {
        // a -> b -> c, d independent
        let nodes = vec![
            NodeInstance::new("a", "t"),
            NodeInstance::new("b", "t").with_connection("x", "a", "result"),
            NodeInstance::new("c", "t").with_connection("x", "b", "result"),
            NodeInstance::new("d", "t"),
        ];
        nodes.into_iter().map(|n| (n.id.clone(), n)).collect()
    }

    fn set(ids: &[&str]) -> HashSet<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pulls_in_transitive_sources() {
        let nodes = chain();
        assert_eq!(resolve(["c"], &nodes), set(&["a", "b", "c"]));
        assert_eq!(resolve(["b", "d"], &nodes), set(&["a", "b", "d"]));
    }

    #[test]
    fn source_node_selects_only_itself() {
        assert_eq!(resolve(["a"], &chain()), set(&["a"]));
    }

    #[test]
    fn unknown_selection_contributes_nothing() {
        let nodes = chain();
        assert!(resolve(["missing"], &nodes).is_empty());
        assert_eq!(resolve(["missing", "b"], &nodes), set(&["a", "b"]));
    }

    #[test]
    fn resolve_is_idempotent() {
        let nodes = chain();
        let once = resolve(["c", "d"], &nodes);
        let twice = resolve(&once, &nodes);
        assert_eq!(once, twice);
    }

    #[test]
    fn dangling_source_is_kept_in_closure() {
        let mut nodes = chain();
        let orphan = NodeInstance::new("e", "t").with_connection("x", "gone", "result");
        nodes.insert("e".into(), orphan);

        let closure = resolve(["e"], &nodes);
        assert_eq!(closure, set(&["e", "gone"]));
        assert_eq!(select(nodes, &closure).len(), 1);
    }
}
