use std::sync::Arc;

use serde_json::json;

use nodeflow_core::error::NodeError;
use nodeflow_core::graph::{parse_node_map, NodeInstance, NodeMap};
use nodeflow_core::types::{NodeId, NodeStatus};
use nodeflow_engine::{JobRunner, RunOutput};
use nodeflow_test_utils::{
    add_registry, five_node_async_graph, five_node_graph, node_map, register_counted,
};

fn completed(output: RunOutput) -> NodeMap {
    match output {
        RunOutput::Completed(nodes) => nodes,
        other => panic!("expected a completed run, got {:?}", other),
    }
}

fn results(nodes: &NodeMap) -> Vec<(String, serde_json::Value)> {
    nodes
        .iter()
        .map(|(id, n)| (id.clone(), n.result.clone().unwrap_or_default()))
        .collect()
}

#[test]
fn test_empty_map_returns_nothing() {
    let runner = JobRunner::new(Arc::new(add_registry()));
    assert!(runner.run(NodeMap::new(), None).unwrap().is_empty());
}

#[test]
fn test_sync_run_of_editor_file() {
    let raw = std::fs::read_to_string("tests/fixtures/nodes_add.json").unwrap();
    let nodes = parse_node_map(&raw).unwrap();
    let runner = JobRunner::new(Arc::new(add_registry()));

    let out = completed(runner.run(nodes, None).unwrap());
    assert_eq!(out.len(), 5);
    assert_eq!(
        results(&out),
        vec![
            ("node_1".to_string(), json!(3)),
            ("node_2".to_string(), json!(6)),
            ("node_3".to_string(), json!(7)),
            ("node_4".to_string(), json!(16)),
            ("node_5".to_string(), json!(10)),
        ]
    );
    for node in out.values() {
        assert_eq!(node.status, NodeStatus::Finished);
        assert_eq!(node.result_mapped["result"], node.result.clone().unwrap());
        assert!(node.error.is_none());
    }
    // Layout passes through.
    assert_eq!(out["node_1"].x, Some(120.0));
}

#[tokio::test]
async fn test_async_run_with_async_callables() {
    let runner = JobRunner::builder(Arc::new(add_registry()))
        .mode("async")
        .build()
        .unwrap();

    let output = runner.run(five_node_async_graph(), None).unwrap();
    assert!(matches!(output, RunOutput::Pending(_)));
    let out = output.into_nodes().await.unwrap().unwrap();

    assert_eq!(out["node_4"].result, Some(json!(16)));
    assert!(out.values().all(|n| n.status == NodeStatus::Finished));
}

#[test]
fn test_selection_runs_only_the_closure() {
    let runner = JobRunner::new(Arc::new(add_registry()));
    let selected: Vec<NodeId> = vec!["node_5".into()];

    let out = completed(runner.run(five_node_graph(), Some(selected.as_slice())).unwrap());
    let ids: Vec<&str> = out.keys().map(|s| s.as_str()).collect();
    assert_eq!(ids, vec!["node_1", "node_3", "node_5"]);
    assert_eq!(out["node_5"].result, Some(json!(10)));
}

#[test]
fn test_empty_selection_runs_everything() {
    let runner = JobRunner::new(Arc::new(add_registry()));
    let out = completed(runner.run(five_node_graph(), Some(&[][..])).unwrap());
    assert_eq!(out.len(), 5);
}

#[test]
fn test_failure_propagates_without_calling_dependents() {
    let mut registry = add_registry();
    registry.register_sync("fail", &["result"], |_| Err(anyhow::anyhow!("broken input")));
    let downstream = register_counted(&mut registry, "count");
    let runner = JobRunner::new(Arc::new(registry));

    let nodes = node_map(vec![
        NodeInstance::new("a", "fail"),
        NodeInstance::new("b", "count").with_connection("value", "a", "result"),
        NodeInstance::new("c", "count").with_connection("value", "b", "result"),
        NodeInstance::new("side", "add")
            .with_input("a", json!(2))
            .with_input("b", json!(2)),
    ]);
    let out = completed(runner.run(nodes, None).unwrap());

    assert_eq!(out["a"].status, NodeStatus::Failed);
    assert_eq!(out["a"].error, Some(NodeError::Execution("broken input".into())));
    assert_eq!(out["b"].status, NodeStatus::Failed);
    assert_eq!(out["b"].error, Some(NodeError::DependentNode("a".into())));
    assert_eq!(out["c"].error, Some(NodeError::DependentNode("b".into())));
    assert_eq!(downstream.count(), 0);
    assert_eq!(out["side"].result, Some(json!(4)));
}

#[test]
fn test_linear_chain_passes_values_along() {
    let mut registry = add_registry();
    let calls = register_counted(&mut registry, "count");
    let runner = JobRunner::new(Arc::new(registry));

    let nodes = node_map(vec![
        NodeInstance::new("n1", "count").with_input("value", json!("payload")),
        NodeInstance::new("n2", "count").with_connection("value", "n1", "result"),
        NodeInstance::new("n3", "count").with_connection("value", "n2", "result"),
    ]);
    let out = completed(runner.run(nodes, None).unwrap());

    assert_eq!(out["n3"].result, Some(json!("payload")));
    assert_eq!(calls.count(), 3);
}

#[test]
fn test_multi_output_node_feeds_named_ports() {
    let mut registry = add_registry();
    registry.register_sync("split", &["low", "high"], |_| Ok(json!([1, 10])));
    let runner = JobRunner::new(Arc::new(registry));

    let nodes = node_map(vec![
        NodeInstance::new("s", "split"),
        NodeInstance::new("sum", "add")
            .with_connection("a", "s", "low")
            .with_connection("b", "s", "high"),
    ]);
    let out = completed(runner.run(nodes, None).unwrap());

    assert_eq!(out["s"].result_mapped["low"], json!(1));
    assert_eq!(out["s"].result_mapped["high"], json!(10));
    assert_eq!(out["sum"].result, Some(json!(11)));
}

#[test]
fn test_rerun_clears_previous_results() {
    let runner = JobRunner::new(Arc::new(add_registry()));
    let first = completed(runner.run(five_node_graph(), None).unwrap());

    let mut again = first.clone();
    if let Some(node) = again.get_mut("node_1") {
        node.input_data.clear();
    }
    let out = completed(runner.run(again, None).unwrap());

    assert_eq!(out["node_1"].status, NodeStatus::Failed);
    assert!(out["node_1"].result.is_none());
    assert!(out["node_1"].result_mapped.is_empty());
    assert_eq!(out["node_4"].error, Some(NodeError::DependentNode("node_2".into())));
}

#[test]
fn test_independent_nodes_all_run() {
    let runner = JobRunner::new(Arc::new(add_registry()));
    let nodes = node_map(
        (0..4)
            .map(|i| {
                NodeInstance::new(format!("n{}", i), "add")
                    .with_input("a", json!(i))
                    .with_input("b", json!(i))
            })
            .collect(),
    );
    let out = completed(runner.run(nodes, None).unwrap());

    for i in 0..4 {
        let node = &out[&format!("n{}", i)];
        assert_eq!(node.status, NodeStatus::Finished);
        assert_eq!(node.result, Some(json!(i * 2)));
        assert!(node.error.is_none());
    }
}
