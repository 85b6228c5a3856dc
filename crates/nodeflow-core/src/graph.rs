use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{NodeError, Result};
use crate::queue::JobHandle;
use crate::types::{JobId, Kwargs, NodeId, NodeStatus};

/// Node map as sent by the editor, keyed by node id.
pub type NodeMap = BTreeMap<NodeId, NodeInstance>;

/// One end of an edge: an output port on another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
    #[serde(rename = "portName")]
    pub port_name: String,
    /// External job id of the node on the other end, filled during
    /// distributed submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl Connection {
    pub fn new(node_id: impl Into<NodeId>, port_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port_name: port_name.into(),
            job_id: None,
        }
    }
}

/// Every edge touching a node, grouped by the local port name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connections {
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<Connection>>,
    /// Downstream consumers. Informational only.
    #[serde(default)]
    pub outputs: BTreeMap<String, Vec<Connection>>,
}

/// A node instance from the editor plus the fields a run writes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,

    // Editor layout, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,

    #[serde(default)]
    pub connections: Connections,
    /// Literal control values per input port: `port -> control -> value`.
    #[serde(default, rename = "inputData")]
    pub input_data: BTreeMap<String, Kwargs>,

    #[serde(default)]
    pub status: NodeStatus,
    /// Raw value returned by the callable.
    #[serde(default)]
    pub result: Option<Value>,
    /// `result` keyed by the node type's output port names.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub result_mapped: Kwargs,
    /// Read from either `{"kind", "message"}` or a bare message string.
    #[serde(default, deserialize_with = "tagged_or_plain_error")]
    pub error: Option<NodeError>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    /// Queue overrides for distributed runs (`queue`, `depends_on`, job options).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Kwargs>,

    /// Handle returned by the external queue. Never serialized.
    #[serde(skip)]
    pub job: Option<Arc<dyn JobHandle>>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Kwargs, D::Error> {
    Ok(Option::<Kwargs>::deserialize(d)?.unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireError {
    Tagged(NodeError),
    Plain(String),
}

fn tagged_or_plain_error<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<NodeError>, D::Error> {
    Ok(Option::<WireError>::deserialize(d)?.map(|e| match e {
        WireError::Tagged(err) => err,
        WireError::Plain(message) => NodeError::Execution(message),
    }))
}

impl NodeInstance {
    /// Create an idle node with no inputs.
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            x: None,
            y: None,
            width: None,
            connections: Connections::default(),
            input_data: BTreeMap::new(),
            status: NodeStatus::Idle,
            result: None,
            result_mapped: Kwargs::new(),
            error: None,
            job_id: None,
            settings: None,
            job: None,
        }
    }

    /// Set a literal value on an input port, stored under a control of the same name.
    pub fn with_input(mut self, port: impl Into<String>, value: Value) -> Self {
        let port = port.into();
        let mut controls = Kwargs::new();
        controls.insert(port.clone(), value);
        self.input_data.insert(port, controls);
        self
    }

    /// Feed an input port from `source_node.source_port`.
    pub fn with_connection(
        mut self,
        port: impl Into<String>,
        source_node: impl Into<NodeId>,
        source_port: impl Into<String>,
    ) -> Self {
        self.connections
            .inputs
            .entry(port.into())
            .or_default()
            .push(Connection::new(source_node, source_port));
        self
    }

    /// Set per-node queue settings.
    pub fn with_settings(mut self, settings: Kwargs) -> Self {
        self.settings = Some(settings);
        self
    }

    /// The connection consulted for each connected input port.
    ///
    /// Only the first connection of a port is used; ports with an empty
    /// list are skipped.
    pub fn upstream(&self) -> impl Iterator<Item = (&str, &Connection)> {
        self.connections
            .inputs
            .iter()
            .filter_map(|(port, conns)| conns.first().map(|c| (port.as_str(), c)))
    }

    /// Ids of every node feeding this one, across all connections.
    pub fn source_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.connections
            .inputs
            .values()
            .flat_map(|conns| conns.iter().map(|c| &c.node_id))
    }

    /// Keyword arguments derived from literal `inputData`.
    ///
    /// A port with no controls, or whose single control is null, is left
    /// unset. A port with several controls is passed as one object keyed by
    /// control name.
    pub fn literal_args(&self) -> Kwargs {
        let mut args = Kwargs::new();
        for (port, controls) in &self.input_data {
            let value = match controls.len() {
                0 => continue,
                1 => match controls.values().next() {
                    Some(Value::Null) | None => continue,
                    Some(v) => v.clone(),
                },
                _ => Value::Object(controls.clone()),
            };
            args.insert(port.clone(), value);
        }
        args
    }
}

/// Parse a node map from its JSON wire form.
pub fn parse_node_map(json: &str) -> Result<NodeMap> {
    Ok(serde_json::from_str(json)?)
}

/// Render a node map to its JSON wire form, without latch or job handle fields.
pub fn to_wire(nodes: &NodeMap) -> Result<Value> {
    Ok(serde_json::to_value(nodes)?)
}
