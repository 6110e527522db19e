// Progress events
//
// The orchestrator reports progress through a callback so the CLI can render it (progress bar)
// and tests can record it.

use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub correlation_id: String,
    pub step: String,
    pub severity: String, // "info" | "warn" | "error"
    pub phase: String,
    pub percent: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u128>,
}

pub type ProgressEmitter = Arc<dyn Fn(ProgressPayload) + Send + Sync>;

/// Emitter that drops every event.
pub fn noop_emitter() -> ProgressEmitter {
    Arc::new(|_| {})
}
