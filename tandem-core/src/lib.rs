//! # tandem-core: Diagram data model
//!
//! The shared vocabulary of every Tandem layer: nodes, edges, the viewport
//! and the live [`Diagram`] row they belong to.
//!
//! Node and edge payloads are free-form JSON documents (`data`), so the
//! synchronization layer never needs to understand what a node renders as.
//! Everything here is a plain value type: snapshots are cloned, compared and
//! replaced whole, never merged field by field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use uuid::Uuid;

/// Identifier of a user, as resolved by the (external) identity layer.
pub type UserId = Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 2D position in diagram (world) coordinates.
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

/// A diagram node. `kind` selects the renderer, `data` is renderer-specific.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: String,
    pub position: Point,
    #[serde(default)]
    pub data: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, position: Point) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            position,
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// A directed connection between two nodes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            label: None,
            data: Value::Null,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Camera position and zoom of the canvas.
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

/// The full editable content of a diagram.
///
/// This is the unit of every snapshot: checkpoints capture it, restores
/// overwrite it, change broadcasts carry it.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct DiagramState {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub viewport: Viewport,
}

impl DiagramState {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>, viewport: Viewport) -> Self {
        Self { nodes, edges, viewport }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// The live, canonical diagram row.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Diagram {
    pub id: Uuid,
    pub name: String,
    pub state: DiagramState,
    /// Milliseconds since epoch.
    pub created_at: u64,
    /// Milliseconds since epoch.
    pub updated_at: u64,
}

impl Diagram {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_state(name, DiagramState::default())
    }

    pub fn with_state(name: impl Into<String>, state: DiagramState) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the whole editable state. Nothing of the previous state survives.
    pub fn replace_state(&mut self, state: DiagramState) {
        self.state = state;
        self.updated_at = now_millis().max(self.updated_at);
    }
}
