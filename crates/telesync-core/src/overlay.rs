//! Rogue-variable and MUFS overlays and the node flags derived from them.
//!
//! Each overlay is keyed by its id and carries the sequence of the event
//! that produced it. A later event with the same id supersedes it only when
//! its sequence is strictly greater, so derived flags change only in
//! response to newer events, never to read timing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::MpgGraphState;
use crate::payload::{CandidateType, MufsEventPayload, RogueVariableEventPayload, UnawarenessType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RogueOverlay {
    pub rogue_id: String,
    pub mpg_id: String,
    pub candidate_type: CandidateType,
    pub segment_ids: Vec<String>,
    pub pathway_nodes: Vec<String>,
    pub potency_index: f64,
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
}

impl RogueOverlay {
    pub fn from_event(payload: &RogueVariableEventPayload, sequence: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            rogue_id: payload.rogue_id.clone(),
            mpg_id: payload.mpg_id.clone(),
            candidate_type: payload.candidate_type,
            segment_ids: payload.segment_ids.clone().unwrap_or_default(),
            pathway_nodes: payload.pathway_nodes.clone().unwrap_or_default(),
            potency_index: payload.potency_index,
            sequence,
            observed_at,
        }
    }

    /// Node ids this overlay marks, resolved against the current graph.
    fn covered_nodes<'g>(&'g self, graph: &'g MpgGraphState) -> BTreeSet<&'g str> {
        let mut covered: BTreeSet<&str> = self
            .segment_ids
            .iter()
            .filter_map(|sid| graph.segments.get(sid))
            .flat_map(|segment| segment.member_node_ids.iter().map(String::as_str))
            .collect();
        covered.extend(self.pathway_nodes.iter().map(String::as_str));
        covered
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MufsOverlay {
    pub mufs_id: String,
    pub decision_id: String,
    pub mpg_id: String,
    pub unawareness_types: Vec<UnawarenessType>,
    pub input_unaware_refs: Vec<String>,
    pub process_unaware_node_ids: Vec<String>,
    pub minimal: bool,
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
}

impl MufsOverlay {
    pub fn from_event(payload: &MufsEventPayload, sequence: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            mufs_id: payload.mufs_id.clone(),
            decision_id: payload.decision_id.clone(),
            mpg_id: payload.mpg_id.clone(),
            unawareness_types: payload.unawareness_types.clone(),
            input_unaware_refs: payload.input_unaware_refs.clone().unwrap_or_default(),
            process_unaware_node_ids: payload.process_unaware_node_ids.clone().unwrap_or_default(),
            minimal: payload.minimal,
            sequence,
            observed_at,
        }
    }

    fn covered_nodes(&self) -> impl Iterator<Item = &str> {
        self.process_unaware_node_ids
            .iter()
            .chain(self.input_unaware_refs.iter())
            .map(String::as_str)
    }
}

/// Result of offering an overlay to its lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supersede {
    Inserted,
    Replaced,
    /// An overlay with the same id and an equal or higher sequence exists.
    Stale { applied: u64 },
}

/// Every active overlay, rogue and MUFS, with independent lifecycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlaySet {
    pub rogue: BTreeMap<String, RogueOverlay>,
    pub mufs: BTreeMap<String, MufsOverlay>,
}

impl OverlaySet {
    pub fn upsert_rogue(&mut self, overlay: RogueOverlay) -> Supersede {
        upsert(&mut self.rogue, overlay.rogue_id.clone(), overlay.sequence, overlay)
    }

    pub fn upsert_mufs(&mut self, overlay: MufsOverlay) -> Supersede {
        upsert(&mut self.mufs, overlay.mufs_id.clone(), overlay.sequence, overlay)
    }

    pub fn remove_rogue(&mut self, rogue_id: &str) -> bool {
        self.rogue.remove(rogue_id).is_some()
    }

    pub fn remove_mufs(&mut self, mufs_id: &str) -> bool {
        self.mufs.remove(mufs_id).is_some()
    }

    /// Recompute every derived node flag from scratch.
    pub fn derive(&self, graph: &mut MpgGraphState) {
        for node in graph.nodes.values_mut() {
            node.clear_derived();
        }

        let mut potency: BTreeMap<String, f64> = BTreeMap::new();
        for overlay in self.rogue.values() {
            for node_id in overlay.covered_nodes(graph) {
                potency
                    .entry(node_id.to_string())
                    .and_modify(|p| *p = p.max(overlay.potency_index))
                    .or_insert(overlay.potency_index);
            }
        }
        for (node_id, score) in potency {
            if let Some(node) = graph.nodes.get_mut(&node_id) {
                node.is_rogue_hotspot = true;
                node.rogue_potency = Some(score);
            }
        }

        for overlay in self.mufs.values() {
            for node_id in overlay.covered_nodes() {
                if let Some(node) = graph.nodes.get_mut(node_id) {
                    node.is_unaware_ghost = true;
                }
            }
        }
    }
}

fn upsert<T>(map: &mut BTreeMap<String, T>, id: String, sequence: u64, overlay: T) -> Supersede
where
    T: HasSequence,
{
    match map.get(&id).map(T::sequence) {
        Some(applied) if applied >= sequence => Supersede::Stale { applied },
        Some(_) => {
            map.insert(id, overlay);
            Supersede::Replaced
        }
        None => {
            map.insert(id, overlay);
            Supersede::Inserted
        }
    }
}

trait HasSequence {
    fn sequence(&self) -> u64;
}

impl HasSequence for RogueOverlay {
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl HasSequence for MufsOverlay {
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MpgOperation;
    use crate::graph::tests::{delta, node, segment};

    fn rogue(id: &str, segments: &[&str], potency: f64, sequence: u64) -> RogueOverlay {
        RogueOverlay {
            rogue_id: id.into(),
            mpg_id: "mpg-1".into(),
            candidate_type: CandidateType::Segment,
            segment_ids: segments.iter().map(|s| s.to_string()).collect(),
            pathway_nodes: Vec::new(),
            potency_index: potency,
            sequence,
            observed_at: Utc::now(),
        }
    }

    fn graph() -> MpgGraphState {
        let mut graph = MpgGraphState::new();
        graph
            .apply_delta(&delta(
                "seed",
                vec![
                    MpgOperation::add_node(node("n1", 0.5)),
                    MpgOperation::add_node(node("n2", 0.5)),
                    MpgOperation::add_node(node("n3", 0.5)),
                    MpgOperation::add_segment(segment("s1", &["n1", "n2"])),
                    MpgOperation::add_segment(segment("s2", &["n2", "n3"])),
                ],
            ))
            .unwrap();
        graph
    }

    #[test]
    fn overlapping_overlays_take_max_potency() {
        let mut graph = graph();
        let mut overlays = OverlaySet::default();
        overlays.upsert_rogue(rogue("r1", &["s1"], 0.4, 1));
        overlays.upsert_rogue(rogue("r2", &["s2"], 0.8, 2));
        overlays.derive(&mut graph);

        assert_eq!(graph.nodes["n1"].rogue_potency, Some(0.4));
        assert_eq!(graph.nodes["n2"].rogue_potency, Some(0.8));
        assert!(graph.nodes["n3"].is_rogue_hotspot);
    }

    #[test]
    fn lower_or_equal_sequence_does_not_supersede() {
        let mut overlays = OverlaySet::default();
        assert_eq!(overlays.upsert_rogue(rogue("r1", &["s1"], 0.4, 5)), Supersede::Inserted);
        assert_eq!(
            overlays.upsert_rogue(rogue("r1", &["s2"], 0.9, 5)),
            Supersede::Stale { applied: 5 }
        );
        assert_eq!(overlays.upsert_rogue(rogue("r1", &["s2"], 0.9, 6)), Supersede::Replaced);
        assert_eq!(overlays.rogue["r1"].segment_ids, vec!["s2".to_string()]);
    }

    #[test]
    fn pathway_nodes_are_covered_directly() {
        let mut graph = graph();
        let mut overlays = OverlaySet::default();
        let mut pathway = rogue("r1", &[], 0.3, 1);
        pathway.candidate_type = CandidateType::Pathway;
        pathway.pathway_nodes = vec!["n3".into(), "not-in-graph".into()];
        overlays.upsert_rogue(pathway);
        overlays.derive(&mut graph);

        assert!(graph.nodes["n3"].is_rogue_hotspot);
        assert!(!graph.nodes["n1"].is_rogue_hotspot);
    }

    #[test]
    fn mufs_marks_ghosts_independently_of_rogue() {
        let mut graph = graph();
        let mut overlays = OverlaySet::default();
        overlays.upsert_mufs(MufsOverlay {
            mufs_id: "m1".into(),
            decision_id: "d1".into(),
            mpg_id: "mpg-1".into(),
            unawareness_types: vec![UnawarenessType::Process],
            input_unaware_refs: Vec::new(),
            process_unaware_node_ids: vec!["n1".into()],
            minimal: true,
            sequence: 1,
            observed_at: Utc::now(),
        });
        overlays.derive(&mut graph);
        assert!(graph.nodes["n1"].is_unaware_ghost);
        assert!(!graph.nodes["n1"].is_rogue_hotspot);

        overlays.remove_mufs("m1");
        overlays.derive(&mut graph);
        assert!(!graph.nodes["n1"].is_unaware_ghost);
    }
}
