//! Wire contract with the AI agents.
//!
//! The orchestrator writes a JSON task descriptor to the agent's stdin and
//! streams its stdout looking for two line shapes: progress tokens
//! `{"progress": 0.42}` and, for planners, a final plan envelope
//! `{"plan": {"title": ..., "steps": [...]}}`. Everything else is log text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// JSON handed to the agent on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskDescriptor {
    pub task_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub repository_url: String,
    pub base_branch: String,
    /// Present for implementation runs: the approved plan the agent executes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutput {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<PlanStepOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStepOutput {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

/// Structured token recognized on an agent's stdout.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Progress(f64),
    Plan(PlanOutput),
}

/// Try to interpret one stdout line as a structured token. Returns `None`
/// for ordinary log text (including malformed JSON, which agents are free
/// to print).
pub fn parse_agent_line(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;

    if let Some(progress) = obj.get("progress").and_then(Value::as_f64) {
        if (0.0..=1.0).contains(&progress) {
            return Some(AgentEvent::Progress(progress));
        }
        return None;
    }
    if let Some(plan) = obj.get("plan") {
        let plan: PlanOutput = serde_json::from_value(plan.clone()).ok()?;
        return Some(AgentEvent::Plan(plan));
    }
    None
}
