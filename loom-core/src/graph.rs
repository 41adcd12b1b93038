//! Structural edits on a [`DocumentPayload`].
//!
//! These are the pure halves of the session mutation operations: they touch
//! only the graph, never timers or transport, so the sync engine can wrap
//! them with change detection and the store can reuse them for duplication.

use std::collections::HashMap;
use std::f64::consts::PI;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{new_id, DocumentPayload, Edge, Node, NodeKind, Point, Template};

/// Where the first node of an empty document lands.
pub const ORIGIN: Point = Point { x: 100.0, y: 100.0 };
/// Offset applied to a duplicated node.
pub const DUPLICATE_OFFSET: f64 = 40.0;

const SPIRAL_BASE_RADIUS: f64 = 150.0;
const SPIRAL_RADIUS_STEP: f64 = 30.0;
const SPIRAL_ANGLE_STEP_DEG: f64 = 137.5;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Edge endpoint missing: {0}")]
    MissingEndpoint(String),
    #[error("Edge already exists: {from} -> {to}")]
    DuplicateEdge { from: String, to: String },
}

/// Outcome of [`DocumentPayload::apply_template`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateApplied {
    pub nodes_added: usize,
    pub edges_added: usize,
    /// Template nodes and edges left out because their id was already taken
    pub skipped: usize,
}

impl TemplateApplied {
    /// Whether part of the template was left out.
    pub fn is_partial(&self) -> bool {
        self.skipped > 0
    }
}

/// Partial node update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub label: Option<String>,
    pub description: Option<String>,
    pub position: Option<Point>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub fill_color: Option<String>,
    pub border_color: Option<String>,
    pub border_width: Option<f64>,
    pub config: Option<Map<String, Value>>,
}

impl NodePatch {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn position(x: f64, y: f64) -> Self {
        Self {
            position: Some(Point::new(x, y)),
            ..Self::default()
        }
    }

    fn apply(self, node: &mut Node) {
        if let Some(label) = self.label {
            node.label = label;
        }
        if let Some(description) = self.description {
            node.description = description;
        }
        if let Some(position) = self.position {
            node.position = position;
        }
        if let Some(width) = self.width {
            node.width = width;
        }
        if let Some(height) = self.height {
            node.height = height;
        }
        if let Some(fill) = self.fill_color {
            node.fill_color = fill;
        }
        if let Some(border) = self.border_color {
            node.border_color = border;
        }
        if let Some(width) = self.border_width {
            node.border_width = width;
        }
        if let Some(config) = self.config {
            node.config = config;
        }
    }
}

/// Change events emitted by the rendering widget.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeChange {
    Position { id: String, position: Point, dragging: bool },
    Dimensions { id: String, width: f64, height: f64 },
    Select { id: String, selected: bool },
    Remove { id: String },
}

impl DocumentPayload {
    /// Placement for the next node: a fixed origin for an empty graph,
    /// otherwise an expanding spiral around the centroid of existing nodes.
    pub fn next_position(&self) -> Point {
        let count = self.nodes.len();
        if count == 0 {
            return ORIGIN;
        }

        let n = count as f64;
        let (sum_x, sum_y) = self
            .nodes
            .iter()
            .fold((0.0, 0.0), |(x, y), node| (x + node.position.x, y + node.position.y));
        let centroid = Point::new(sum_x / n, sum_y / n);

        let angle = n * SPIRAL_ANGLE_STEP_DEG * PI / 180.0;
        let radius = SPIRAL_BASE_RADIUS + SPIRAL_RADIUS_STEP * n;
        Point::new(
            centroid.x + angle.cos() * radius,
            centroid.y + angle.sin() * radius,
        )
    }

    /// Append a node of `kind` at the next free placement. Returns its id.
    pub fn add_node(
        &mut self,
        kind: NodeKind,
        label: Option<&str>,
        description: Option<&str>,
    ) -> String {
        let mut node = Node::new(kind, self.next_position());
        if let Some(label) = label {
            node.label = label.to_string();
        }
        if let Some(description) = description {
            node.description = description.to_string();
        }
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Shallow-merge `patch` into the node. Returns false if absent.
    pub fn update_node(&mut self, id: &str, patch: NodePatch) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                patch.apply(node);
                true
            }
            None => false,
        }
    }

    /// Remove the node and every edge touching it.
    pub fn delete_node(&mut self, id: &str) -> Option<Node> {
        let index = self.nodes.iter().position(|n| n.id == id)?;
        let node = self.nodes.remove(index);
        self.edges.retain(|e| e.source != id && e.target != id);
        Some(node)
    }

    /// Clone a node under a new id, offset slightly. Edges are not copied.
    pub fn duplicate_node(&mut self, id: &str) -> Option<String> {
        let mut copy = self.node(id)?.clone();
        copy.id = new_id();
        copy.position.x += DUPLICATE_OFFSET;
        copy.position.y += DUPLICATE_OFFSET;
        copy.clear_ui_state();
        let new_id = copy.id.clone();
        self.nodes.push(copy);
        Some(new_id)
    }

    /// Add an edge unless an endpoint is missing or an identical edge exists.
    pub fn connect(
        &mut self,
        source: &str,
        target: &str,
        source_handle: Option<&str>,
        target_handle: Option<&str>,
    ) -> Result<String, GraphError> {
        for endpoint in [source, target] {
            if !self.contains_node(endpoint) {
                return Err(GraphError::MissingEndpoint(endpoint.to_string()));
            }
        }
        if self
            .edges
            .iter()
            .any(|e| e.matches(source, target, source_handle, target_handle))
        {
            return Err(GraphError::DuplicateEdge {
                from: source.to_string(),
                to: target.to_string(),
            });
        }

        let edge = Edge::new(
            source,
            target,
            source_handle.map(str::to_string),
            target_handle.map(str::to_string),
        );
        let id = edge.id.clone();
        self.edges.push(edge);
        Ok(id)
    }

    /// Remove every edge from `source` to `target`, whatever the handles.
    pub fn unlink(&mut self, source: &str, target: &str) -> usize {
        let before = self.edges.len();
        self.edges.retain(|e| !(e.source == source && e.target == target));
        before - self.edges.len()
    }

    /// Append a template's nodes and edges with their ids unchanged.
    ///
    /// Ids are never remapped. A template node or edge whose id is already in
    /// the document is left out and counted in
    /// [`TemplateApplied::skipped`], so the document never holds two items
    /// with one id.
    pub fn apply_template(&mut self, template: &Template) -> TemplateApplied {
        let mut outcome = TemplateApplied::default();
        for node in &template.nodes {
            if self.contains_node(&node.id) {
                outcome.skipped += 1;
                continue;
            }
            self.nodes.push(node.clone());
            outcome.nodes_added += 1;
        }
        for edge in &template.edges {
            if self.edges.iter().any(|e| e.id == edge.id) {
                outcome.skipped += 1;
                continue;
            }
            self.edges.push(edge.clone());
            outcome.edges_added += 1;
        }
        if outcome.is_partial() {
            log::warn!(
                "Template {} applied partially: {} items already present",
                template.name,
                outcome.skipped
            );
        }
        outcome
    }

    /// Apply a batch of renderer events. Returns true if any touched the graph.
    pub fn apply_node_changes(&mut self, changes: Vec<NodeChange>) -> bool {
        let mut touched = false;
        for change in changes {
            touched |= match change {
                NodeChange::Position { id, position, dragging } => match self.node_mut(&id) {
                    Some(node) => {
                        node.position = position;
                        node.dragging = dragging;
                        true
                    }
                    None => false,
                },
                NodeChange::Dimensions { id, width, height } => match self.node_mut(&id) {
                    Some(node) => {
                        node.width = width;
                        node.height = height;
                        true
                    }
                    None => false,
                },
                NodeChange::Select { id, selected } => match self.node_mut(&id) {
                    Some(node) => {
                        node.selected = selected;
                        true
                    }
                    None => false,
                },
                NodeChange::Remove { id } => self.delete_node(&id).is_some(),
            };
        }
        touched
    }

    /// Deep copy with a fresh id for every node and edge. Edge endpoints are
    /// rewritten through the old→new node id map; edges whose endpoints have
    /// no mapping are dropped.
    pub fn with_fresh_ids(&self) -> DocumentPayload {
        let id_map: HashMap<&str, String> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), new_id()))
            .collect();

        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                let mut copy = n.clone();
                copy.id = id_map[n.id.as_str()].clone();
                copy
            })
            .collect();

        let edges = self
            .edges
            .iter()
            .filter_map(|e| {
                let source = id_map.get(e.source.as_str())?;
                let target = id_map.get(e.target.as_str())?;
                let mut copy = e.clone();
                copy.id = new_id();
                copy.source = source.clone();
                copy.target = target.clone();
                Some(copy)
            })
            .collect();

        DocumentPayload {
            nodes,
            edges,
            viewport: self.viewport,
        }
    }
}
