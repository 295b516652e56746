#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Self-description a tracer library publishes from inside the instrumented
/// process. Encoded as a MessagePack map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerMetadata {
    pub schema_version: u8,
    pub runtime_id: Option<String>,
    pub tracer_language: String,
    pub tracer_version: String,
    pub hostname: String,
    pub service_name: Option<String>,
    pub service_env: Option<String>,
    pub service_version: Option<String>,
}

impl TracerMetadata {
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
