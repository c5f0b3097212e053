//! Telemetry source capability: where outbound envelopes come from.
//!
//! Platform sensors exist on some hosts and not others. Instead of a
//! nullable lookup, a host without a sensor gets an [`UnavailableSource`]
//! that reports why and never yields events.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use thiserror::Error;

use crate::envelope::EventEnvelope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceAvailability {
    Available,
    Unavailable { reason: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {detail}")]
    Decode { line: usize, detail: String },

    #[error("source {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },
}

/// Produces envelopes for the outbound queue.
pub trait TelemetrySource: Send {
    fn name(&self) -> &str;

    fn availability(&self) -> SourceAvailability;

    /// Return up to `max` envelopes. An empty vector means nothing is ready.
    fn poll(&mut self, max: usize) -> Result<Vec<EventEnvelope>, SourceError>;
}

/// Stand-in for a sensor the current platform does not have.
#[derive(Debug, Clone)]
pub struct UnavailableSource {
    name: String,
    reason: String,
}

impl UnavailableSource {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl TelemetrySource for UnavailableSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn availability(&self) -> SourceAvailability {
        SourceAvailability::Unavailable {
            reason: self.reason.clone(),
        }
    }

    fn poll(&mut self, _max: usize) -> Result<Vec<EventEnvelope>, SourceError> {
        Err(SourceError::Unavailable {
            name: self.name.clone(),
            reason: self.reason.clone(),
        })
    }
}

/// Replays envelopes from a JSONL file, one per line. Blank lines are skipped.
///
/// A line that does not decode is reported by the first `poll` that has
/// nothing else to return, so envelopes read before it are never lost.
pub struct JsonlReplaySource {
    name: String,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    exhausted: bool,
    deferred: Option<SourceError>,
}

impl JsonlReplaySource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        Ok(Self {
            name: format!("replay:{}", path.display()),
            lines: BufReader::new(file).lines(),
            line_no: 0,
            exhausted: false,
            deferred: None,
        })
    }

    /// True once the file is read to the end and every error was reported.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.deferred.is_none()
    }
}

impl TelemetrySource for JsonlReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn availability(&self) -> SourceAvailability {
        SourceAvailability::Available
    }

    fn poll(&mut self, max: usize) -> Result<Vec<EventEnvelope>, SourceError> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        let mut out = Vec::new();
        while out.len() < max {
            let Some(line) = self.lines.next() else {
                self.exhausted = true;
                break;
            };
            self.line_no += 1;
            let parsed = line.map_err(SourceError::from).and_then(|line| {
                if line.trim().is_empty() {
                    return Ok(None);
                }
                serde_json::from_str::<EventEnvelope>(&line)
                    .map(Some)
                    .map_err(|e| SourceError::Decode {
                        line: self.line_no,
                        detail: e.to_string(),
                    })
            });
            match parsed {
                Ok(Some(envelope)) => out.push(envelope),
                Ok(None) => {}
                Err(e) if out.is_empty() => return Err(e),
                Err(e) => {
                    self.deferred = Some(e);
                    break;
                }
            }
        }
        Ok(out)
    }
}
