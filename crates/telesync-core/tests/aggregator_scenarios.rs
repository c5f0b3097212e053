use serde_json::{Value, json};
use telesync_core::{ApplyOutcome, MpgGraphState, VisualStateAggregator};

fn envelope(message_type: &str, sequence: u64, payload: Value) -> Value {
    json!({
        "v": "1",
        "message_type": message_type,
        "timestamp_utc": "2024-06-01T10:00:00Z",
        "experiment_id": "exp-7",
        "session_id": "sess-7",
        "subject_id": "subj-7",
        "source_layer": "MPG",
        "sequence": sequence,
        "payload": payload,
    })
}

fn node(id: &str, importance: f64) -> Value {
    json!({
        "id": id,
        "label": format!("label-{id}"),
        "description": "original",
        "layer_tags": ["somatic"],
        "metrics": { "valence": 0.2, "intensity": 0.6, "recency": 0.5, "stability": 0.3 },
        "confidence": 0.7,
        "importance": importance,
        "roles": ["driver"]
    })
}

fn segment(id: &str, members: &[&str]) -> Value {
    json!({
        "id": id,
        "label": format!("segment-{id}"),
        "level": 1,
        "member_node_ids": members,
        "cohesion": 0.6,
        "average_importance": 0.5,
        "average_confidence": 0.5
    })
}

fn delta(delta_id: &str, operations: Vec<Value>) -> Value {
    envelope(
        "mpg_delta",
        1,
        json!({ "mpg_id": "mpg-7", "level": 2, "delta_id": delta_id, "operations": operations }),
    )
}

fn rogue(rogue_id: &str, sequence: u64, segment_ids: &[&str]) -> Value {
    envelope(
        "rogue_variable_event",
        sequence,
        json!({
            "rogue_id": rogue_id,
            "mpg_id": "mpg-7",
            "candidate_type": "segment",
            "level_range": [1, 2],
            "segment_ids": segment_ids,
            "shapley_stats": {
                "mean_abs_contrib": 0.1, "std_abs_contrib": 0.05,
                "candidate_abs_contrib": 0.4, "z_score": 6.0
            },
            "potency_index": 0.72,
            "impact_factors": {
                "rate_of_change": 0.8, "breadth_of_impact": 0.6, "amplification": 0.7,
                "emotional_load": 0.9, "gate_leverage": 0.5, "robustness": 0.4
            }
        }),
    )
}

fn symbolic(sequence: u64, revision: &str) -> Value {
    envelope(
        "symbolic_state",
        sequence,
        json!({ "t_rel_ms": sequence * 100, "belief_revision_id": revision, "beliefs": [] }),
    )
}

fn seeded() -> VisualStateAggregator {
    let mut agg = VisualStateAggregator::new();
    let outcome = agg.apply_value(delta(
        "seed",
        vec![
            json!({ "kind": "add_node", "node": node("n1", 0.5) }),
            json!({ "kind": "add_node", "node": node("n2", 0.5) }),
            json!({ "kind": "add_node", "node": node("n3", 0.5) }),
            json!({ "kind": "add_segment", "segment": segment("s1", &["n1", "n2"]) }),
        ],
    ));
    assert!(outcome.is_applied());
    agg
}

#[test]
fn add_then_update_keeps_untouched_fields() {
    let mut agg = VisualStateAggregator::new();
    agg.apply_value(delta(
        "d1",
        vec![
            json!({ "kind": "add_node", "node": node("n1", 0.9) }),
            json!({ "kind": "update_node", "node_id": "n1", "patch": { "importance": 0.95 } }),
        ],
    ));

    let n1 = &agg.state().graph.nodes["n1"];
    assert_eq!(n1.importance, 0.95);
    assert_eq!(n1.label, "label-n1");
    assert_eq!(n1.description.as_deref(), Some("original"));
    assert_eq!(n1.confidence, 0.7);
    assert_eq!(n1.layer_tags, vec!["somatic".to_string()]);
    assert_eq!(agg.state().graph.level, 2);
}

#[test]
fn rogue_overlay_marks_segment_members_until_superseded() {
    let mut agg = seeded();

    assert!(agg.apply_value(rogue("rv-1", 10, &["s1"])).is_applied());
    let snapshot = agg.snapshot();
    assert_eq!(snapshot.hotspot_node_ids(), vec!["n1", "n2"]);
    assert_eq!(snapshot.graph.nodes["n1"].rogue_potency, Some(0.72));

    // An older event for the same lineage cannot clear the flag.
    assert_eq!(agg.apply_value(rogue("rv-1", 9, &[])), ApplyOutcome::Stale { applied: 10 });
    assert_eq!(agg.snapshot().hotspot_node_ids(), vec!["n1", "n2"]);

    // A strictly later event superseding the overlay clears it.
    assert!(agg.apply_value(rogue("rv-1", 11, &[])).is_applied());
    assert!(agg.snapshot().hotspot_node_ids().is_empty());
}

#[test]
fn hotspot_follows_segment_membership_changes() {
    let mut agg = seeded();
    agg.apply_value(rogue("rv-1", 1, &["s1"]));

    agg.apply_value(delta(
        "grow",
        vec![json!({
            "kind": "update_segment",
            "segment_id": "s1",
            "patch": { "member_node_ids": ["n2", "n3"] }
        })],
    ));
    assert_eq!(agg.snapshot().hotspot_node_ids(), vec!["n2", "n3"]);
}

#[test]
fn clearing_the_last_overlay_clears_the_flag() {
    let mut agg = seeded();
    agg.apply_value(rogue("rv-1", 1, &["s1"]));
    agg.apply_value(rogue("rv-2", 1, &["s1"]));

    agg.clear_rogue_overlay("rv-1");
    assert_eq!(agg.snapshot().hotspot_node_ids(), vec!["n1", "n2"]);

    agg.clear_rogue_overlay("rv-2");
    assert!(agg.snapshot().hotspot_node_ids().is_empty());
}

#[test]
fn lower_symbolic_sequence_is_dropped() {
    let mut agg = VisualStateAggregator::new();
    assert!(agg.apply_value(symbolic(5, "rev-5")).is_applied());
    assert_eq!(agg.apply_value(symbolic(3, "rev-3")), ApplyOutcome::Stale { applied: 5 });

    let symbolic = agg.state().symbolic.as_ref().unwrap();
    assert_eq!(symbolic.sequence, 5);
    assert_eq!(symbolic.payload.belief_revision_id, "rev-5");
}

#[test]
fn mufs_overlay_has_its_own_lifecycle() {
    let mut agg = seeded();
    agg.apply_value(rogue("rv-1", 1, &["s1"]));
    let mufs = envelope(
        "mufs_event",
        1,
        json!({
            "mufs_id": "mufs-1",
            "decision_id": "dec-1",
            "mpg_id": "mpg-7",
            "unawareness_types": ["PU"],
            "process_unaware_node_ids": ["n3"],
            "decision_full": { "choice": "stay", "utility": { "stay": 0.6 } },
            "decision_without_U": { "choice": "go", "utility": { "go": 0.7 } },
            "minimal": true
        }),
    );
    assert!(agg.apply_value(mufs).is_applied());
    assert_eq!(agg.snapshot().ghost_node_ids(), vec!["n3"]);

    agg.clear_mufs_overlay("mufs-1");
    let snapshot = agg.snapshot();
    assert!(snapshot.ghost_node_ids().is_empty());
    assert_eq!(snapshot.hotspot_node_ids(), vec!["n1", "n2"]);
}

#[test]
fn rejected_delta_leaves_graph_and_overlays_intact() {
    let mut agg = seeded();
    agg.apply_value(rogue("rv-1", 1, &["s1"]));
    let before = agg.snapshot();

    let outcome = agg.apply_value(delta(
        "bad",
        vec![
            json!({ "kind": "add_node", "node": node("n4", 0.5) }),
            json!({ "kind": "add_edge" }),
        ],
    ));
    assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
    assert_eq!(agg.snapshot(), before);
}

#[test]
fn graph_snapshot_load_recomputes_overlays() {
    let mut agg = VisualStateAggregator::new();
    agg.apply_value(rogue("rv-1", 1, &["s1"]));

    let loaded: MpgGraphState = serde_json::from_value(json!({
        "mpg_id": "mpg-7",
        "level": 3,
        "nodes": { "n9": node("n9", 0.4) },
        "edges": {},
        "segments": { "s1": segment("s1", &["n9"]) }
    }))
    .unwrap();
    agg.load_graph_snapshot(loaded);
    assert_eq!(agg.snapshot().hotspot_node_ids(), vec!["n9"]);
}
