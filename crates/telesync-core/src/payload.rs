//! Typed payloads for each known telemetry message type.
//!
//! Field names match the wire. Unit-interval fields are range-checked by
//! [`Validate`] when a payload crosses the ingestion boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::graph::MpgOperation;
use crate::serde_helpers::{flexible_timestamp, flexible_timestamp_opt};

/// Structural checks serde cannot express.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

pub(crate) fn unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

pub(crate) fn unit_opt(field: &'static str, value: Option<f64>) -> Result<(), ValidationError> {
    value.map_or(Ok(()), |v| unit(field, v))
}

pub(crate) fn signed_unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if (-1.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

// ─── Somatic ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerType {
    ReadinessLike,
    PhaseLocking,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SomaticAnticipatoryMarker {
    pub marker_type: MarkerType,
    pub lead_time_ms: i64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SomaticStatePayload {
    pub t_rel_ms: i64,
    pub window_ms: i64,
    pub features: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub innovation: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariance_diag: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_uncertainty_score: Option<f64>,
    #[serde(default)]
    pub change_point: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_score: Option<f64>,
    #[serde(default)]
    pub anticipatory_markers: Vec<SomaticAnticipatoryMarker>,
}

impl Validate for SomaticStatePayload {
    fn validate(&self) -> Result<(), ValidationError> {
        unit_opt("global_uncertainty_score", self.global_uncertainty_score)?;
        unit_opt("anomaly_score", self.anomaly_score)?;
        for marker in &self.anticipatory_markers {
            unit("anticipatory_markers.confidence", marker.confidence)?;
        }
        Ok(())
    }
}

// ─── Symbolic ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeliefKind {
    Entity,
    Event,
    Relation,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicBelief {
    pub id: String,
    pub kind: BeliefKind,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability: Option<f64>,
    pub confidence: f64,
    pub importance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicPredictionOption {
    pub value: String,
    pub probability: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionTarget {
    Word,
    Event,
    Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicPrediction {
    pub id: String,
    pub target_type: PredictionTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon_ms: Option<i64>,
    pub topk: Vec<SymbolicPredictionOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brier_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicUncertaintyRegion {
    pub label: String,
    pub belief_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolicStatePayload {
    pub t_rel_ms: i64,
    pub belief_revision_id: String,
    pub beliefs: Vec<SymbolicBelief>,
    #[serde(default)]
    pub predictions: Vec<SymbolicPrediction>,
    #[serde(default)]
    pub uncertainty_regions: Vec<SymbolicUncertaintyRegion>,
}

impl Validate for SymbolicStatePayload {
    fn validate(&self) -> Result<(), ValidationError> {
        for belief in &self.beliefs {
            if let Some(v) = belief.valence {
                signed_unit("beliefs.valence", v)?;
            }
            unit_opt("beliefs.intensity", belief.intensity)?;
            unit_opt("beliefs.recency", belief.recency)?;
            unit_opt("beliefs.stability", belief.stability)?;
            unit("beliefs.confidence", belief.confidence)?;
            unit("beliefs.importance", belief.importance)?;
        }
        for prediction in &self.predictions {
            for option in &prediction.topk {
                unit("predictions.topk.probability", option.probability)?;
            }
        }
        Ok(())
    }
}

// ─── Noetic ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Somatic,
    Symbolic,
    Behavioral,
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoeticStreamCorrelation {
    pub stream_x: StreamName,
    pub stream_y: StreamName,
    pub r: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoeticSpectrumBand {
    pub band_label: String,
    pub freq_range_hz: (f64, f64),
    pub coherence_strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoeticIntuitiveAccuracyEstimate {
    pub p_better_than_baseline: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoeticStatePayload {
    pub t_rel_ms: i64,
    pub window_ms: i64,
    pub global_coherence_score: f64,
    pub entropy_change: f64,
    pub stream_correlations: Vec<NoeticStreamCorrelation>,
    pub coherence_spectrum: Vec<NoeticSpectrumBand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intuitive_accuracy_estimate: Option<NoeticIntuitiveAccuracyEstimate>,
}

impl Validate for NoeticStatePayload {
    fn validate(&self) -> Result<(), ValidationError> {
        unit("global_coherence_score", self.global_coherence_score)?;
        for corr in &self.stream_correlations {
            signed_unit("stream_correlations.r", corr.r)?;
        }
        for band in &self.coherence_spectrum {
            unit("coherence_spectrum.coherence_strength", band.coherence_strength)?;
        }
        if let Some(estimate) = &self.intuitive_accuracy_estimate {
            unit(
                "intuitive_accuracy_estimate.p_better_than_baseline",
                estimate.p_better_than_baseline,
            )?;
        }
        Ok(())
    }
}

// ─── Decision cycle ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionPhase {
    S,
    O,
    R,
    K,
    N,
    #[serde(rename = "S_prime")]
    SPrime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionAction {
    pub action_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub label: String,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoeticAdjustment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention_gain: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_threshold_delta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate_delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCyclePayload {
    pub sork_cycle_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    pub phase: DecisionPhase,
    #[serde(with = "flexible_timestamp")]
    pub phase_started_utc: DateTime<Utc>,
    #[serde(default, with = "flexible_timestamp_opt", skip_serializing_if = "Option::is_none")]
    pub phase_ended_utc: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stimulus_refs: Option<Vec<BTreeMap<String, String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organism_belief_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_action: Option<DecisionAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consequence_outcome: Option<DecisionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noetic_adjustments: Option<NoeticAdjustment>,
}

impl Validate for DecisionCyclePayload {
    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(ended) = self.phase_ended_utc
            && ended < self.phase_started_utc
        {
            return Err(ValidationError::malformed(
                crate::telemetry::MessageType::DecisionCycle,
                "phase_ended_utc precedes phase_started_utc",
            ));
        }
        Ok(())
    }
}

// ─── MPG delta ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpgDeltaPayload {
    pub mpg_id: String,
    pub level: i64,
    pub delta_id: String,
    pub operations: Vec<MpgOperation>,
}

impl Validate for MpgDeltaPayload {
    fn validate(&self) -> Result<(), ValidationError> {
        for (index, op) in self.operations.iter().enumerate() {
            op.validate_shape(index)?;
        }
        Ok(())
    }
}

// ─── Rogue variable ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    Segment,
    Pathway,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RogueVariableImpactFactors {
    pub rate_of_change: f64,
    pub breadth_of_impact: f64,
    pub amplification: f64,
    pub emotional_load: f64,
    pub gate_leverage: f64,
    pub robustness: f64,
}

impl RogueVariableImpactFactors {
    /// Weighted potency score over the six impact factors.
    pub fn potency_index(&self) -> f64 {
        0.25 * self.rate_of_change
            + 0.15 * self.breadth_of_impact
            + 0.2 * self.amplification
            + 0.15 * self.emotional_load
            + 0.15 * self.gate_leverage
            + 0.1 * self.robustness
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RogueVariableShapleyStats {
    pub mean_abs_contrib: f64,
    pub std_abs_contrib: f64,
    pub candidate_abs_contrib: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RogueVariableEventPayload {
    pub rogue_id: String,
    pub mpg_id: String,
    pub candidate_type: CandidateType,
    pub level_range: (i64, i64),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathway_nodes: Option<Vec<String>>,
    pub shapley_stats: RogueVariableShapleyStats,
    pub potency_index: f64,
    pub impact_factors: RogueVariableImpactFactors,
}

impl Validate for RogueVariableEventPayload {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.rogue_id.is_empty() {
            return Err(ValidationError::malformed(
                crate::telemetry::MessageType::RogueVariableEvent,
                "rogue_id is empty",
            ));
        }
        if !self.potency_index.is_finite() {
            return Err(ValidationError::OutOfRange {
                field: "potency_index",
                value: self.potency_index,
            });
        }
        let f = &self.impact_factors;
        unit("impact_factors.rate_of_change", f.rate_of_change)?;
        unit("impact_factors.breadth_of_impact", f.breadth_of_impact)?;
        unit("impact_factors.amplification", f.amplification)?;
        unit("impact_factors.emotional_load", f.emotional_load)?;
        unit("impact_factors.gate_leverage", f.gate_leverage)?;
        unit("impact_factors.robustness", f.robustness)?;
        Ok(())
    }
}

// ─── MUFS ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnawarenessType {
    #[serde(rename = "IU")]
    Input,
    #[serde(rename = "PU")]
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionUtility {
    pub choice: String,
    pub utility: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MufsEventPayload {
    pub mufs_id: String,
    pub decision_id: String,
    pub mpg_id: String,
    pub unawareness_types: Vec<UnawarenessType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_unaware_refs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_unaware_node_ids: Option<Vec<String>>,
    pub decision_full: DecisionUtility,
    #[serde(rename = "decision_without_U")]
    pub decision_without_u: DecisionUtility,
    pub minimal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_metadata: Option<serde_json::Value>,
}

impl Validate for MufsEventPayload {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.mufs_id.is_empty() {
            return Err(ValidationError::malformed(
                crate::telemetry::MessageType::MufsEvent,
                "mufs_id is empty",
            ));
        }
        Ok(())
    }
}
