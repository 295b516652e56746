#![forbid(unsafe_code)]

use serde::Deserialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeKind {
    LogProbe,
    MetricProbe,
    SpanProbe,
    SpanDecorationProbe,
}

/// A probe parsed out of one configuration fragment. Only `id` and `version`
/// matter to the debouncer; the rest is carried through for the consumer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProbeDefinition {
    pub id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    #[serde(rename = "where", default)]
    pub location: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ProbeDefinition {
    pub fn identity(&self) -> (&str, u64) {
        (&self.id, self.version)
    }

    pub fn cmp_identity(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeParseError {
    #[error("malformed probe definition: {0}")]
    Json(#[from] serde_json::Error),

    #[error("probe definition has an empty id")]
    MissingId,
}

pub trait ProbeParser: Send {
    fn parse_probe(&self, raw: &str) -> Result<ProbeDefinition, ProbeParseError>;
}

/// Parses the JSON probe definitions tracers receive over remote
/// configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonProbeParser;

impl ProbeParser for JsonProbeParser {
    fn parse_probe(&self, raw: &str) -> Result<ProbeDefinition, ProbeParseError> {
        let probe: ProbeDefinition = serde_json::from_str(raw)?;
        if probe.id.is_empty() {
            return Err(ProbeParseError::MissingId);
        }
        Ok(probe)
    }
}
