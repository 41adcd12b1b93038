//! Change detection for the sync engine.
//!
//! The renderer emits a steady stream of selection/drag churn. A [`Snapshot`]
//! strips those flags and orders nodes and edges by id, so two snapshots
//! compare equal exactly when the document itself is unchanged.

use crate::{DocumentPayload, Edge, Node, Viewport};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    viewport: Viewport,
}

impl Snapshot {
    pub fn of(payload: &DocumentPayload) -> Self {
        let clean = payload.without_ui_state();
        let mut nodes = clean.nodes;
        let mut edges = clean.edges;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            nodes,
            edges,
            viewport: clean.viewport,
        }
    }

    /// True when `payload` differs structurally from this snapshot.
    pub fn differs_from(&self, payload: &DocumentPayload) -> bool {
        *self != Snapshot::of(payload)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeKind, Point};

    fn sample() -> DocumentPayload {
        let mut payload = DocumentPayload::new();
        let a = payload.add_node(NodeKind::Agent, None, None);
        let b = payload.add_node(NodeKind::Tool, None, None);
        payload.connect(&a, &b, None, None).unwrap();
        payload
    }

    #[test]
    fn test_selection_is_not_a_change() {
        let mut payload = sample();
        let baseline = Snapshot::of(&payload);
        payload.nodes[0].selected = true;
        payload.nodes[1].dragging = true;
        payload.edges[0].animated = true;
        assert!(!baseline.differs_from(&payload));
    }

    #[test]
    fn test_order_is_irrelevant() {
        let mut payload = sample();
        let baseline = Snapshot::of(&payload);
        payload.nodes.reverse();
        assert!(!baseline.differs_from(&payload));
    }

    #[test]
    fn test_structural_edits_are_changes() {
        let payload = sample();
        let baseline = Snapshot::of(&payload);

        let mut moved = payload.clone();
        moved.nodes[0].position = Point::new(1.0, 2.0);
        assert!(baseline.differs_from(&moved));

        let mut relabeled = payload.clone();
        relabeled.nodes[1].label = "Other".into();
        assert!(baseline.differs_from(&relabeled));

        let mut panned = payload.clone();
        panned.viewport.x = 30.0;
        assert!(baseline.differs_from(&panned));

        let mut unlinked = payload;
        unlinked.edges.clear();
        assert!(baseline.differs_from(&unlinked));
    }

    #[test]
    fn test_counts() {
        let snapshot = Snapshot::of(&sample());
        assert_eq!(snapshot.node_count(), 2);
        assert_eq!(snapshot.edge_count(), 1);
        assert_eq!(Snapshot::default().node_count(), 0);
    }
}
