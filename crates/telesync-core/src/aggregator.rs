//! Visual state aggregator: the single-writer merge engine.
//!
//! Envelopes arrive in any cross-type order. Each one is merged by its
//! type's rule and, when it touches the graph or an overlay, derived node
//! flags are recomputed before the call returns. The aggregator is a plain
//! `&mut self` state machine; the stream crate wraps it in a service that
//! owns it exclusively and publishes immutable snapshots.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{SyncError, ValidationError};
use crate::graph::MpgGraphState;
use crate::overlay::{MufsOverlay, OverlaySet, RogueOverlay, Supersede};
use crate::payload::{
    DecisionCyclePayload, MpgDeltaPayload, MufsEventPayload, NoeticStatePayload,
    RogueVariableEventPayload, SomaticStatePayload, SymbolicStatePayload,
};
use crate::telemetry::{
    MessageType, RawTelemetryEnvelope, TelemetryEnvelope, TelemetryPayload, TypedTelemetry,
};

/// Number of recent `delta_id`s remembered for replay protection.
const DEFAULT_DELTA_MEMORY: usize = 1024;

/// Fully merged point-in-time view handed to renderers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisualSnapshot {
    /// Incremented once per applied mutation.
    pub version: u64,
    pub somatic: Option<TelemetryEnvelope<SomaticStatePayload>>,
    pub symbolic: Option<TelemetryEnvelope<SymbolicStatePayload>>,
    pub noetic: Option<TelemetryEnvelope<NoeticStatePayload>>,
    pub decision_cycle: Option<TelemetryEnvelope<DecisionCyclePayload>>,
    pub graph: MpgGraphState,
    pub overlays: OverlaySet,
    /// Timestamp of the most recently applied envelope.
    pub last_event_at: Option<DateTime<Utc>>,
}

impl VisualSnapshot {
    pub fn hotspot_node_ids(&self) -> Vec<&str> {
        self.graph
            .nodes
            .values()
            .filter(|n| n.is_rogue_hotspot)
            .map(|n| n.id.as_str())
            .collect()
    }

    pub fn ghost_node_ids(&self) -> Vec<&str> {
        self.graph
            .nodes
            .values()
            .filter(|n| n.is_unaware_ghost)
            .map(|n| n.id.as_str())
            .collect()
    }
}

/// What happened to one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied { version: u64 },
    /// Sequence at or below the last applied one for its lineage.
    Stale { applied: u64 },
    /// `mpg_delta` whose `delta_id` was already applied.
    Duplicate,
    /// Unrecognised message type.
    Ignored,
    Rejected(ValidationError),
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Fold into the shared error taxonomy. `Ok(Some(version))` when applied,
    /// `Ok(None)` for duplicates and unknown types.
    pub fn into_result(
        self,
        message_type: MessageType,
        sequence: u64,
    ) -> Result<Option<u64>, SyncError> {
        match self {
            Self::Applied { version } => Ok(Some(version)),
            Self::Duplicate | Self::Ignored => Ok(None),
            Self::Stale { applied } => Err(SyncError::StaleUpdate {
                message_type,
                sequence,
                applied,
            }),
            Self::Rejected(e) => Err(SyncError::Validation(e)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub applied: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub ignored: u64,
    pub rejected: u64,
}

#[derive(Debug)]
pub struct VisualStateAggregator {
    state: VisualSnapshot,
    /// Last applied sequence for each last-write-wins message type.
    applied_sequences: HashMap<MessageType, u64>,
    recent_deltas: VecDeque<String>,
    recent_delta_ids: HashSet<String>,
    delta_memory: usize,
    stats: AggregatorStats,
}

impl Default for VisualStateAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl VisualStateAggregator {
    pub fn new() -> Self {
        Self::with_delta_memory(DEFAULT_DELTA_MEMORY)
    }

    pub fn with_delta_memory(delta_memory: usize) -> Self {
        Self {
            state: VisualSnapshot::default(),
            applied_sequences: HashMap::new(),
            recent_deltas: VecDeque::new(),
            recent_delta_ids: HashSet::new(),
            delta_memory: delta_memory.max(1),
            stats: AggregatorStats::default(),
        }
    }

    pub fn state(&self) -> &VisualSnapshot {
        &self.state
    }

    /// Owned copy of the current merged state.
    pub fn snapshot(&self) -> VisualSnapshot {
        self.state.clone()
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Decode a whole envelope from JSON and apply it.
    pub fn apply_value(&mut self, value: serde_json::Value) -> ApplyOutcome {
        match RawTelemetryEnvelope::from_value(value) {
            Ok(raw) => self.apply_raw(raw),
            Err(e) => {
                warn!(error = %e, "aggregator: dropping undecodable envelope");
                self.stats.rejected += 1;
                ApplyOutcome::Rejected(e)
            }
        }
    }

    /// Validate the payload against its message type and apply it.
    pub fn apply_raw(&mut self, raw: RawTelemetryEnvelope) -> ApplyOutcome {
        let message_type = raw.message_type;
        let sequence = raw.sequence;
        match raw.decode() {
            Ok(typed) => self.apply(typed),
            Err(e) => {
                let outcome = ApplyOutcome::Rejected(e);
                self.record(&outcome, message_type, sequence);
                outcome
            }
        }
    }

    pub fn apply(&mut self, envelope: TypedTelemetry) -> ApplyOutcome {
        let (header, payload) = envelope.into_parts();
        let message_type = payload.message_type();
        let sequence = header.sequence;

        let outcome = match payload {
            TelemetryPayload::SomaticState(p) => {
                self.apply_latest(message_type, header.with_payload(p), |s, e| s.somatic = Some(e))
            }
            TelemetryPayload::SymbolicState(p) => {
                self.apply_latest(message_type, header.with_payload(p), |s, e| s.symbolic = Some(e))
            }
            TelemetryPayload::NoeticState(p) => {
                self.apply_latest(message_type, header.with_payload(p), |s, e| s.noetic = Some(e))
            }
            TelemetryPayload::DecisionCycle(p) => self.apply_latest(
                message_type,
                header.with_payload(p),
                |s, e| s.decision_cycle = Some(e),
            ),
            TelemetryPayload::MpgDelta(p) => self.apply_delta(header.timestamp_utc, p),
            TelemetryPayload::RogueVariableEvent(p) => self.apply_rogue(&header, &p),
            TelemetryPayload::MufsEvent(p) => self.apply_mufs(&header, &p),
            TelemetryPayload::Unrecognized(_) => ApplyOutcome::Ignored,
        };

        self.record(&outcome, message_type, sequence);
        outcome
    }

    /// Replace the graph wholesale, e.g. from a server-provided snapshot.
    pub fn load_graph_snapshot(&mut self, graph: MpgGraphState) -> u64 {
        self.state.graph = graph;
        self.state.overlays.derive(&mut self.state.graph);
        self.bump()
    }

    /// Drop a rogue overlay by id. Returns the new version if it existed.
    pub fn clear_rogue_overlay(&mut self, rogue_id: &str) -> Option<u64> {
        if !self.state.overlays.remove_rogue(rogue_id) {
            return None;
        }
        self.state.overlays.derive(&mut self.state.graph);
        Some(self.bump())
    }

    /// Drop a MUFS overlay by id. Returns the new version if it existed.
    pub fn clear_mufs_overlay(&mut self, mufs_id: &str) -> Option<u64> {
        if !self.state.overlays.remove_mufs(mufs_id) {
            return None;
        }
        self.state.overlays.derive(&mut self.state.graph);
        Some(self.bump())
    }

    // ── merge rules ──────────────────────────────────────────────

    fn apply_latest<T>(
        &mut self,
        message_type: MessageType,
        envelope: TelemetryEnvelope<T>,
        store: impl FnOnce(&mut VisualSnapshot, TelemetryEnvelope<T>),
    ) -> ApplyOutcome {
        if let Some(&applied) = self.applied_sequences.get(&message_type)
            && envelope.sequence <= applied
        {
            return ApplyOutcome::Stale { applied };
        }
        self.applied_sequences.insert(message_type, envelope.sequence);
        let at = envelope.timestamp_utc;
        store(&mut self.state, envelope);
        self.commit(at)
    }

    fn apply_delta(&mut self, at: DateTime<Utc>, delta: MpgDeltaPayload) -> ApplyOutcome {
        if self.recent_delta_ids.contains(&delta.delta_id) {
            return ApplyOutcome::Duplicate;
        }
        match self.state.graph.apply_delta(&delta) {
            Ok(summary) => {
                if summary.missing_targets > 0 {
                    debug!(
                        delta_id = %delta.delta_id,
                        missing = summary.missing_targets,
                        "aggregator: update on unknown id ignored"
                    );
                }
                self.state.overlays.derive(&mut self.state.graph);
                self.remember_delta(delta.delta_id);
                self.commit(at)
            }
            Err(e) => ApplyOutcome::Rejected(e),
        }
    }

    fn apply_rogue(
        &mut self,
        header: &TelemetryEnvelope<()>,
        payload: &RogueVariableEventPayload,
    ) -> ApplyOutcome {
        let overlay = RogueOverlay::from_event(payload, header.sequence, header.timestamp_utc);
        match self.state.overlays.upsert_rogue(overlay) {
            Supersede::Stale { applied } => ApplyOutcome::Stale { applied },
            Supersede::Inserted | Supersede::Replaced => {
                self.state.overlays.derive(&mut self.state.graph);
                self.commit(header.timestamp_utc)
            }
        }
    }

    fn apply_mufs(&mut self, header: &TelemetryEnvelope<()>, payload: &MufsEventPayload) -> ApplyOutcome {
        let overlay = MufsOverlay::from_event(payload, header.sequence, header.timestamp_utc);
        match self.state.overlays.upsert_mufs(overlay) {
            Supersede::Stale { applied } => ApplyOutcome::Stale { applied },
            Supersede::Inserted | Supersede::Replaced => {
                self.state.overlays.derive(&mut self.state.graph);
                self.commit(header.timestamp_utc)
            }
        }
    }

    // ── bookkeeping ──────────────────────────────────────────────

    fn remember_delta(&mut self, delta_id: String) {
        if self.recent_deltas.len() == self.delta_memory
            && let Some(evicted) = self.recent_deltas.pop_front()
        {
            self.recent_delta_ids.remove(&evicted);
        }
        self.recent_delta_ids.insert(delta_id.clone());
        self.recent_deltas.push_back(delta_id);
    }

    fn commit(&mut self, at: DateTime<Utc>) -> ApplyOutcome {
        self.state.last_event_at = Some(match self.state.last_event_at {
            Some(prev) => prev.max(at),
            None => at,
        });
        ApplyOutcome::Applied {
            version: self.bump(),
        }
    }

    fn bump(&mut self) -> u64 {
        self.state.version += 1;
        self.state.version
    }

    fn record(&mut self, outcome: &ApplyOutcome, message_type: MessageType, sequence: u64) {
        match outcome {
            ApplyOutcome::Applied { version } => {
                self.stats.applied += 1;
                trace!(%message_type, sequence, version, "aggregator: applied");
            }
            ApplyOutcome::Stale { applied } => {
                self.stats.stale += 1;
                debug!(%message_type, sequence, applied, "aggregator: stale envelope dropped");
            }
            ApplyOutcome::Duplicate => {
                self.stats.duplicate += 1;
                debug!(%message_type, sequence, "aggregator: duplicate delta skipped");
            }
            ApplyOutcome::Ignored => {
                self.stats.ignored += 1;
                trace!(sequence, "aggregator: unrecognised message type ignored");
            }
            ApplyOutcome::Rejected(e) => {
                self.stats.rejected += 1;
                warn!(%message_type, sequence, error = %e, "aggregator: malformed payload dropped");
            }
        }
    }
}
