use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::SystemTime;
use uuid::Uuid;

pub mod graph;
pub mod normalize;

pub use graph::{GraphError, NodeChange, NodePatch, TemplateApplied};
pub use normalize::Snapshot;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fresh opaque identifier for documents, nodes and edges.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, zoom: 1.0 }
    }
}

/// Fixed set of node types a document may contain.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Agent,
    Tool,
    Trigger,
    Condition,
    Memory,
    Input,
    Output,
    Note,
}

impl NodeKind {
    pub const ALL: [NodeKind; 8] = [
        NodeKind::Agent,
        NodeKind::Tool,
        NodeKind::Trigger,
        NodeKind::Condition,
        NodeKind::Memory,
        NodeKind::Input,
        NodeKind::Output,
        NodeKind::Note,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Agent => "agent",
            NodeKind::Tool => "tool",
            NodeKind::Trigger => "trigger",
            NodeKind::Condition => "condition",
            NodeKind::Memory => "memory",
            NodeKind::Input => "input",
            NodeKind::Output => "output",
            NodeKind::Note => "note",
        }
    }

    pub fn default_label(&self) -> &'static str {
        match self {
            NodeKind::Agent => "Agent",
            NodeKind::Tool => "Tool",
            NodeKind::Trigger => "Trigger",
            NodeKind::Condition => "Condition",
            NodeKind::Memory => "Memory",
            NodeKind::Input => "Input",
            NodeKind::Output => "Output",
            NodeKind::Note => "Note",
        }
    }

    /// Default (width, height).
    pub fn default_size(&self) -> (f64, f64) {
        match self {
            NodeKind::Agent => (220.0, 96.0),
            NodeKind::Condition => (180.0, 80.0),
            NodeKind::Note => (240.0, 120.0),
            _ => (180.0, 64.0),
        }
    }

    /// Default (fill, border) colors.
    pub fn default_colors(&self) -> (&'static str, &'static str) {
        match self {
            NodeKind::Agent => ("#eef2ff", "#6366f1"),
            NodeKind::Tool => ("#ecfeff", "#0891b2"),
            NodeKind::Trigger => ("#fef3c7", "#d97706"),
            NodeKind::Condition => ("#fce7f3", "#db2777"),
            NodeKind::Memory => ("#f0fdf4", "#16a34a"),
            NodeKind::Input => ("#f8fafc", "#475569"),
            NodeKind::Output => ("#f8fafc", "#0f172a"),
            NodeKind::Note => ("#fefce8", "#a16207"),
        }
    }

    /// Kind-specific configuration a fresh node starts with.
    pub fn default_config(&self) -> Map<String, Value> {
        let value = match self {
            NodeKind::Agent => json!({ "model": "default", "temperature": 0.7, "system_prompt": "" }),
            NodeKind::Tool => json!({ "tool": "", "arguments": {} }),
            NodeKind::Trigger => json!({ "event": "manual" }),
            NodeKind::Condition => json!({ "expression": "" }),
            NodeKind::Memory => json!({ "store": "conversation", "window": 10 }),
            NodeKind::Input => json!({ "schema": {} }),
            NodeKind::Output => json!({ "format": "text" }),
            NodeKind::Note => json!({ "text": "" }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub position: Point,
    pub width: f64,
    pub height: f64,
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub fill_color: String,
    pub border_color: String,
    pub border_width: f64,
    #[serde(default)]
    pub config: Map<String, Value>,
    // Renderer state; never a document change on its own.
    #[serde(default, skip_serializing_if = "is_false")]
    pub selected: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dragging: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub animated: bool,
}

impl Node {
    pub fn new(kind: NodeKind, position: Point) -> Self {
        let (width, height) = kind.default_size();
        let (fill, border) = kind.default_colors();
        Self {
            id: new_id(),
            kind,
            position,
            width,
            height,
            label: kind.default_label().to_string(),
            description: String::new(),
            fill_color: fill.to_string(),
            border_color: border.to_string(),
            border_width: 1.0,
            config: kind.default_config(),
            selected: false,
            dragging: false,
            animated: false,
        }
    }

    pub fn clear_ui_state(&mut self) {
        self.selected = false;
        self.dragging = false;
        self.animated = false;
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    pub color: String,
    pub width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub selected: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub animated: bool,
}

impl Edge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        source_handle: Option<String>,
        target_handle: Option<String>,
    ) -> Self {
        Self {
            id: new_id(),
            source: source.into(),
            target: target.into(),
            source_handle,
            target_handle,
            color: "#94a3b8".to_string(),
            width: 2.0,
            label: None,
            selected: false,
            animated: false,
        }
    }

    /// Whether this edge joins exactly the given endpoints and handles.
    pub fn matches(
        &self,
        source: &str,
        target: &str,
        source_handle: Option<&str>,
        target_handle: Option<&str>,
    ) -> bool {
        self.source == source
            && self.target == target
            && self.source_handle.as_deref() == source_handle
            && self.target_handle.as_deref() == target_handle
    }

    pub fn clear_ui_state(&mut self) {
        self.selected = false;
        self.animated = false;
    }
}

/// The mutable graph of one document.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct DocumentPayload {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub viewport: Viewport,
}

impl DocumentPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// Drop edges whose source or target is not a node of this payload.
    ///
    /// Returns the number of edges removed.
    pub fn prune_dangling_edges(&mut self) -> usize {
        let before = self.edges.len();
        let nodes = &self.nodes;
        self.edges.retain(|e| {
            nodes.iter().any(|n| n.id == e.source) && nodes.iter().any(|n| n.id == e.target)
        });
        let pruned = before - self.edges.len();
        if pruned > 0 {
            log::warn!("Pruned {pruned} dangling edge(s)");
        }
        pruned
    }

    /// Copy with all renderer-only flags cleared; this is what gets stored and broadcast.
    pub fn without_ui_state(&self) -> Self {
        let mut clean = self.clone();
        clean.nodes.iter_mut().for_each(Node::clear_ui_state);
        clean.edges.iter_mut().for_each(Edge::clear_ui_state);
        clean
    }
}

/// Registry entry: everything about a document except its graph.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DocumentMeta {
    pub id: String,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub node_count: usize,
    #[serde(default)]
    pub edge_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl DocumentMeta {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            node_count: 0,
            edge_count: 0,
            thumbnail: None,
        }
    }

    /// Refresh derived counts and the modification time from a payload.
    pub fn touch(&mut self, payload: &DocumentPayload) {
        self.node_count = payload.nodes.len();
        self.edge_count = payload.edges.len();
        self.updated_at = now_millis().max(self.created_at);
    }
}

/// Document id → metadata.
pub type Registry = BTreeMap<String, DocumentMeta>;

/// Full document state held by the channel server and returned in acknowledgements.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SharedDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub payload: DocumentPayload,
    pub updated_at: u64,
}

impl SharedDocument {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            payload: DocumentPayload::default(),
            updated_at: now_millis(),
        }
    }
}

/// Predefined nodes and edges appended to a document in one step.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}
