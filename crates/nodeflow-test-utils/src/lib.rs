//! Registries and node maps shared by the nodeflow test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use nodeflow_core::graph::{Connection, NodeInstance, NodeMap};
use nodeflow_core::registry::{required_arg, NodeTypeRegistry};

/// Registry with `add` (blocking) and `add_async` (sleeps briefly first).
///
/// Both take integer inputs `a` and `b` and return their sum as `result`.
pub fn add_registry() -> NodeTypeRegistry {
    let mut registry = NodeTypeRegistry::new();
    registry.register_sync("add", &["result"], |kw| {
        let a: i64 = required_arg(&kw, "a")?;
        let b: i64 = required_arg(&kw, "b")?;
        Ok(json!(a + b))
    });
    registry.register_async("add_async", &["result"], |kw| async move {
        let a: i64 = required_arg(&kw, "a")?;
        let b: i64 = required_arg(&kw, "b")?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, anyhow::Error>(json!(a + b))
    });
    registry
}

/// Counts how many times its callable ran.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Register `node_type` as a pass-through of input `value` that bumps the
/// returned counter each time it runs.
pub fn register_counted(registry: &mut NodeTypeRegistry, node_type: &str) -> CallCounter {
    let counter = CallCounter::default();
    let calls = counter.0.clone();
    registry.register_sync(node_type, &["result"], move |kw| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(kw.get("value").cloned().unwrap_or(Value::Null))
    });
    counter
}

/// Key nodes by their ids.
pub fn node_map(nodes: Vec<NodeInstance>) -> NodeMap {
    nodes.into_iter().map(|n| (n.id.clone(), n)).collect()
}

/// The five-node `add` graph:
///
/// ```text
/// node_1 = 1 + 2
/// node_2 = 3 + node_1
/// node_3 = 4 + node_1
/// node_5 = node_1 + node_3
/// node_4 = node_2 + node_5
/// ```
///
/// Results: 3, 6, 7, 10, 16.
pub fn five_node_graph() -> NodeMap {
    five_node_graph_of("add")
}

/// [`five_node_graph`] with every node of type `add_async`.
pub fn five_node_async_graph() -> NodeMap {
    five_node_graph_of("add_async")
}

/// Mirror every input connection onto its source node's outputs, the way
/// the editor saves maps.
pub fn link_outputs(mut nodes: NodeMap) -> NodeMap {
    let mut links = Vec::new();
    for (id, node) in &nodes {
        for (port, conns) in &node.connections.inputs {
            for conn in conns {
                links.push((conn.node_id.clone(), conn.port_name.clone(), id.clone(), port.clone()));
            }
        }
    }
    for (source, source_port, target, target_port) in links {
        if let Some(node) = nodes.get_mut(&source) {
            node.connections
                .outputs
                .entry(source_port)
                .or_default()
                .push(Connection::new(target, target_port));
        }
    }
    nodes
}

fn five_node_graph_of(node_type: &str) -> NodeMap {
    link_outputs(node_map(vec![
        NodeInstance::new("node_1", node_type)
            .with_input("a", json!(1))
            .with_input("b", json!(2)),
        NodeInstance::new("node_2", node_type)
            .with_input("a", json!(3))
            .with_connection("b", "node_1", "result"),
        NodeInstance::new("node_3", node_type)
            .with_input("a", json!(4))
            .with_connection("b", "node_1", "result"),
        NodeInstance::new("node_5", node_type)
            .with_connection("a", "node_1", "result")
            .with_connection("b", "node_3", "result"),
        NodeInstance::new("node_4", node_type)
            .with_connection("a", "node_2", "result")
            .with_connection("b", "node_5", "result"),
    ]))
}
