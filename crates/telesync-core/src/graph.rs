//! Mutable property graph (MPG): nodes, edges and segments keyed by id.
//!
//! The graph is created empty and mutated only through deltas. A delta is
//! applied to a working copy and swapped in on success, so a failing
//! operation leaves the previous graph untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::payload::{MpgDeltaPayload, Validate, signed_unit, unit, unit_opt};
use crate::serde_helpers::flexible_timestamp;

// ─── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpgNodeMetrics {
    pub valence: f64,
    pub intensity: f64,
    pub recency: f64,
    pub stability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpgEvidencePreview {
    pub evidence_id: String,
    pub snippet: String,
    pub source_class: String,
    #[serde(with = "flexible_timestamp")]
    pub timestamp_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpgNode {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub layer_tags: Vec<String>,
    pub metrics: MpgNodeMetrics,
    pub confidence: f64,
    pub importance: f64,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub evidence_preview: Vec<MpgEvidencePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_provenance: Option<String>,

    // Derived from active overlays; recomputed after every mutation.
    #[serde(default)]
    pub is_rogue_hotspot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rogue_potency: Option<f64>,
    #[serde(default)]
    pub is_unaware_ghost: bool,
}

impl MpgNode {
    pub(crate) const DERIVED_FIELDS: [&'static str; 3] =
        ["is_rogue_hotspot", "rogue_potency", "is_unaware_ghost"];

    pub(crate) fn clear_derived(&mut self) {
        self.is_rogue_hotspot = false;
        self.rogue_potency = None;
        self.is_unaware_ghost = false;
    }
}

impl Validate for MpgNode {
    fn validate(&self) -> Result<(), ValidationError> {
        signed_unit("node.metrics.valence", self.metrics.valence)?;
        unit("node.metrics.intensity", self.metrics.intensity)?;
        unit("node.metrics.recency", self.metrics.recency)?;
        unit("node.metrics.stability", self.metrics.stability)?;
        unit("node.confidence", self.confidence)?;
        unit("node.importance", self.importance)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpgEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub strength: f64,
    pub confidence: f64,
}

impl Validate for MpgEdge {
    fn validate(&self) -> Result<(), ValidationError> {
        unit("edge.strength", self.strength)?;
        unit("edge.confidence", self.confidence)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpgSegment {
    pub id: String,
    pub label: String,
    pub level: i64,
    pub member_node_ids: Vec<String>,
    pub cohesion: f64,
    pub average_importance: f64,
    pub average_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affective_load: Option<f64>,
}

impl Validate for MpgSegment {
    fn validate(&self) -> Result<(), ValidationError> {
        unit("segment.cohesion", self.cohesion)?;
        unit("segment.average_importance", self.average_importance)?;
        unit("segment.average_confidence", self.average_confidence)?;
        unit_opt("segment.affective_load", self.affective_load)
    }
}

// ─── Operations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MpgOperationKind {
    AddNode,
    UpdateNode,
    AddEdge,
    UpdateEdge,
    AddSegment,
    UpdateSegment,
}

impl MpgOperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddNode => "add_node",
            Self::UpdateNode => "update_node",
            Self::AddEdge => "add_edge",
            Self::UpdateEdge => "update_edge",
            Self::AddSegment => "add_segment",
            Self::UpdateSegment => "update_segment",
        }
    }
}

pub type Patch = serde_json::Map<String, serde_json::Value>;

/// One step of a delta, in wire form.
///
/// `add_*` carries the full entity; `update_*` carries the target id and a
/// partial patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpgOperation {
    pub kind: MpgOperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<MpgNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<MpgEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<MpgSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
}

impl MpgOperation {
    fn empty(kind: MpgOperationKind) -> Self {
        Self {
            kind,
            node: None,
            node_id: None,
            edge: None,
            edge_id: None,
            segment: None,
            segment_id: None,
            patch: None,
        }
    }

    pub fn add_node(node: MpgNode) -> Self {
        Self {
            node: Some(node),
            ..Self::empty(MpgOperationKind::AddNode)
        }
    }

    pub fn update_node(node_id: impl Into<String>, patch: Patch) -> Self {
        Self {
            node_id: Some(node_id.into()),
            patch: Some(patch),
            ..Self::empty(MpgOperationKind::UpdateNode)
        }
    }

    pub fn add_edge(edge: MpgEdge) -> Self {
        Self {
            edge: Some(edge),
            ..Self::empty(MpgOperationKind::AddEdge)
        }
    }

    pub fn update_edge(edge_id: impl Into<String>, patch: Patch) -> Self {
        Self {
            edge_id: Some(edge_id.into()),
            patch: Some(patch),
            ..Self::empty(MpgOperationKind::UpdateEdge)
        }
    }

    pub fn add_segment(segment: MpgSegment) -> Self {
        Self {
            segment: Some(segment),
            ..Self::empty(MpgOperationKind::AddSegment)
        }
    }

    pub fn update_segment(segment_id: impl Into<String>, patch: Patch) -> Self {
        Self {
            segment_id: Some(segment_id.into()),
            patch: Some(patch),
            ..Self::empty(MpgOperationKind::UpdateSegment)
        }
    }

    fn invalid(&self, index: usize, detail: impl Into<String>) -> ValidationError {
        ValidationError::Operation {
            index,
            kind: self.kind.as_str().to_string(),
            detail: detail.into(),
        }
    }

    /// Check that the fields required by `kind` are present and in range.
    pub(crate) fn validate_shape(&self, index: usize) -> Result<(), ValidationError> {
        let missing = |field: &str| self.invalid(index, format!("missing {field}"));
        match self.kind {
            MpgOperationKind::AddNode => self.node.as_ref().ok_or_else(|| missing("node"))?.validate(),
            MpgOperationKind::AddEdge => self.edge.as_ref().ok_or_else(|| missing("edge"))?.validate(),
            MpgOperationKind::AddSegment => self
                .segment
                .as_ref()
                .ok_or_else(|| missing("segment"))?
                .validate(),
            MpgOperationKind::UpdateNode => self.require_update(index, &self.node_id, "node_id"),
            MpgOperationKind::UpdateEdge => self.require_update(index, &self.edge_id, "edge_id"),
            MpgOperationKind::UpdateSegment => {
                self.require_update(index, &self.segment_id, "segment_id")
            }
        }
    }

    fn require_update(
        &self,
        index: usize,
        id: &Option<String>,
        field: &str,
    ) -> Result<(), ValidationError> {
        if id.is_none() {
            return Err(self.invalid(index, format!("missing {field}")));
        }
        if self.patch.is_none() {
            return Err(self.invalid(index, "missing patch"));
        }
        Ok(())
    }
}

// ─── Graph state ──────────────────────────────────────────────────

/// What one delta changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaSummary {
    pub upserted: usize,
    pub patched: usize,
    /// `update_*` operations whose target id was not present.
    pub missing_targets: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MpgGraphState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpg_id: Option<String>,
    pub level: i64,
    pub nodes: BTreeMap<String, MpgNode>,
    pub edges: BTreeMap<String, MpgEdge>,
    pub segments: BTreeMap<String, MpgSegment>,
}

impl MpgGraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.segments.is_empty()
    }

    /// Apply every operation of `delta` as one unit.
    ///
    /// On error `self` is unchanged.
    pub fn apply_delta(&mut self, delta: &MpgDeltaPayload) -> Result<DeltaSummary, ValidationError> {
        let mut next = self.clone();
        let mut summary = DeltaSummary::default();
        for (index, op) in delta.operations.iter().enumerate() {
            next.apply_operation(index, op, &mut summary)?;
        }
        next.mpg_id = Some(delta.mpg_id.clone());
        next.level = delta.level;
        *self = next;
        Ok(summary)
    }

    fn apply_operation(
        &mut self,
        index: usize,
        op: &MpgOperation,
        summary: &mut DeltaSummary,
    ) -> Result<(), ValidationError> {
        op.validate_shape(index)?;
        let patch = op.patch.as_ref();
        let invalid = |e: String| op.invalid(index, e);

        match op.kind {
            MpgOperationKind::AddNode => {
                if let Some(node) = &op.node {
                    self.nodes.insert(node.id.clone(), node.clone());
                    summary.upserted += 1;
                }
            }
            MpgOperationKind::AddEdge => {
                if let Some(edge) = &op.edge {
                    self.edges.insert(edge.id.clone(), edge.clone());
                    summary.upserted += 1;
                }
            }
            MpgOperationKind::AddSegment => {
                if let Some(segment) = &op.segment {
                    self.segments.insert(segment.id.clone(), segment.clone());
                    summary.upserted += 1;
                }
            }
            MpgOperationKind::UpdateNode => {
                let (Some(id), Some(patch)) = (&op.node_id, patch) else {
                    return Ok(());
                };
                match self.nodes.get_mut(id) {
                    Some(node) => {
                        let mut protected = vec!["id"];
                        protected.extend(MpgNode::DERIVED_FIELDS);
                        *node = patch_entity(node, patch, &protected).map_err(invalid)?;
                        summary.patched += 1;
                    }
                    None => summary.missing_targets += 1,
                }
            }
            MpgOperationKind::UpdateEdge => {
                let (Some(id), Some(patch)) = (&op.edge_id, patch) else {
                    return Ok(());
                };
                match self.edges.get_mut(id) {
                    Some(edge) => {
                        *edge = patch_entity(edge, patch, &["id"]).map_err(invalid)?;
                        summary.patched += 1;
                    }
                    None => summary.missing_targets += 1,
                }
            }
            MpgOperationKind::UpdateSegment => {
                let (Some(id), Some(patch)) = (&op.segment_id, patch) else {
                    return Ok(());
                };
                match self.segments.get_mut(id) {
                    Some(segment) => {
                        *segment = patch_entity(segment, patch, &["id"]).map_err(invalid)?;
                        summary.patched += 1;
                    }
                    None => summary.missing_targets += 1,
                }
            }
        }
        Ok(())
    }
}

/// Merge `patch` onto `entity`: present fields overwrite, absent fields are
/// kept, nested objects merge recursively. Keys in `protected` are ignored.
fn patch_entity<T>(entity: &T, patch: &Patch, protected: &[&str]) -> Result<T, String>
where
    T: Serialize + DeserializeOwned + Validate,
{
    let mut value = serde_json::to_value(entity).map_err(|e| e.to_string())?;
    let serde_json::Value::Object(fields) = &mut value else {
        return Err("entity is not an object".into());
    };
    for (key, patch_value) in patch {
        if protected.contains(&key.as_str()) {
            continue;
        }
        merge_value(fields.entry(key.clone()).or_insert(serde_json::Value::Null), patch_value);
    }
    let patched: T = serde_json::from_value(value).map_err(|e| e.to_string())?;
    patched.validate().map_err(|e| e.to_string())?;
    Ok(patched)
}

fn merge_value(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge_value(target.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn node(id: &str, importance: f64) -> MpgNode {
        MpgNode {
            id: id.to_string(),
            label: format!("node {id}"),
            description: Some("seed".into()),
            layer_tags: vec!["symbolic".into()],
            metrics: MpgNodeMetrics {
                valence: 0.1,
                intensity: 0.5,
                recency: 0.9,
                stability: 0.4,
            },
            confidence: 0.8,
            importance,
            roles: vec!["anchor".into()],
            evidence_preview: Vec::new(),
            reasoning_provenance: None,
            is_rogue_hotspot: false,
            rogue_potency: None,
            is_unaware_ghost: false,
        }
    }

    pub(crate) fn segment(id: &str, members: &[&str]) -> MpgSegment {
        MpgSegment {
            id: id.to_string(),
            label: format!("segment {id}"),
            level: 1,
            member_node_ids: members.iter().map(|m| m.to_string()).collect(),
            cohesion: 0.7,
            average_importance: 0.5,
            average_confidence: 0.6,
            affective_load: None,
        }
    }

    pub(crate) fn delta(delta_id: &str, operations: Vec<MpgOperation>) -> MpgDeltaPayload {
        MpgDeltaPayload {
            mpg_id: "mpg-1".into(),
            level: 1,
            delta_id: delta_id.into(),
            operations,
        }
    }

    fn patch(value: serde_json::Value) -> Patch {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn update_merges_partial_patch() {
        let mut graph = MpgGraphState::new();
        graph
            .apply_delta(&delta(
                "d1",
                vec![
                    MpgOperation::add_node(node("n1", 0.9)),
                    MpgOperation::update_node("n1", patch(json!({ "importance": 0.95 }))),
                ],
            ))
            .unwrap();

        let n1 = &graph.nodes["n1"];
        assert_eq!(n1.importance, 0.95);
        assert_eq!(n1.label, "node n1");
        assert_eq!(n1.description.as_deref(), Some("seed"));
        assert_eq!(n1.roles, vec!["anchor".to_string()]);
        assert_eq!(graph.mpg_id.as_deref(), Some("mpg-1"));
    }

    #[test]
    fn nested_patch_keeps_sibling_metrics() {
        let mut graph = MpgGraphState::new();
        graph
            .apply_delta(&delta("d1", vec![MpgOperation::add_node(node("n1", 0.5))]))
            .unwrap();
        graph
            .apply_delta(&delta(
                "d2",
                vec![MpgOperation::update_node(
                    "n1",
                    patch(json!({ "metrics": { "intensity": 0.75 } })),
                )],
            ))
            .unwrap();
        let metrics = &graph.nodes["n1"].metrics;
        assert_eq!(metrics.intensity, 0.75);
        assert_eq!(metrics.recency, 0.9);
    }

    #[test]
    fn update_on_missing_id_is_noop() {
        let mut graph = MpgGraphState::new();
        let summary = graph
            .apply_delta(&delta(
                "d1",
                vec![MpgOperation::update_node("ghost", patch(json!({ "importance": 0.1 })))],
            ))
            .unwrap();
        assert_eq!(summary.missing_targets, 1);
        assert!(graph.nodes.is_empty());
    }

    #[test]
    fn add_is_create_or_replace() {
        let mut graph = MpgGraphState::new();
        graph
            .apply_delta(&delta(
                "d1",
                vec![
                    MpgOperation::add_segment(segment("s1", &["n1"])),
                    MpgOperation::add_segment(segment("s1", &["n1", "n2"])),
                ],
            ))
            .unwrap();
        assert_eq!(graph.segments.len(), 1);
        assert_eq!(graph.segments["s1"].member_node_ids.len(), 2);
    }

    #[test]
    fn failing_operation_rolls_back_whole_delta() {
        let mut graph = MpgGraphState::new();
        graph
            .apply_delta(&delta("d1", vec![MpgOperation::add_node(node("n1", 0.5))]))
            .unwrap();
        let before = graph.clone();

        let err = graph
            .apply_delta(&delta(
                "d2",
                vec![
                    MpgOperation::add_node(node("n2", 0.5)),
                    MpgOperation::update_node("n1", patch(json!({ "importance": "very" }))),
                ],
            ))
            .unwrap_err();
        assert!(matches!(err, ValidationError::Operation { index: 1, .. }));
        assert_eq!(graph, before);
    }

    #[test]
    fn patch_cannot_rename_or_set_derived_fields() {
        let mut graph = MpgGraphState::new();
        graph
            .apply_delta(&delta(
                "d1",
                vec![
                    MpgOperation::add_node(node("n1", 0.5)),
                    MpgOperation::update_node(
                        "n1",
                        patch(json!({ "id": "n9", "is_rogue_hotspot": true, "label": "renamed" })),
                    ),
                ],
            ))
            .unwrap();
        let n1 = &graph.nodes["n1"];
        assert_eq!(n1.id, "n1");
        assert!(!n1.is_rogue_hotspot);
        assert_eq!(n1.label, "renamed");
    }

    #[test]
    fn update_without_patch_is_rejected() {
        let mut op = MpgOperation::update_edge("e1", Patch::new());
        op.patch = None;
        let mut graph = MpgGraphState::new();
        assert!(graph.apply_delta(&delta("d1", vec![op])).is_err());
    }
}
