//! Plan capture: the tool a planner session uses to hand over its plan.
//!
//! The planner is given one local tool, `submit_implementation_plan`, whose
//! schema is generated from [`ImplementationPlan`]. The handler validates the
//! submission again on arrival and stores the first valid plan in a shared
//! [`PlanCapture`] that the loop reads once the planner turn is over.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::harness::{json_schema_for, LocalTool, ToolDefinition, ToolHandler, ToolOutput, ToolServer};

pub const PLAN_SERVER_NAME: &str = "autonav-memento";
pub const PLAN_TOOL_NAME: &str = "submit_implementation_plan";

const MIN_SUMMARY_CHARS: usize = 10;
const MIN_STEP_CHARS: usize = 5;

/// One concrete step of an implementation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    /// What to do in this step.
    #[schemars(length(min = 5))]
    pub description: String,
    /// Files the step is expected to touch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Commands to run while carrying out the step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

/// Structured plan submitted by the planner for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationPlan {
    /// Short description of what this iteration achieves.
    #[schemars(length(min = 10))]
    pub summary: String,
    /// Ordered steps for the implementer.
    #[schemars(length(min = 1))]
    pub steps: Vec<PlanStep>,
    /// How to tell that the iteration succeeded.
    #[schemars(length(min = 1))]
    pub validation_criteria: Vec<String>,
    /// True when the task is already done and no further work is needed.
    pub is_complete: bool,
    /// Final message for the user when the task is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanValidationError {
    #[error("Plan does not match the schema: {0}")]
    Malformed(String),

    #[error("summary must be at least 10 characters")]
    SummaryTooShort,

    #[error("steps must contain at least one step")]
    NoSteps,

    #[error("step {0} description must be at least 5 characters")]
    StepTooShort(usize),

    #[error("validationCriteria must contain at least one entry")]
    NoValidationCriteria,
}

impl ImplementationPlan {
    /// Check the constraints serde cannot express.
    pub fn validate(&self) -> Result<(), PlanValidationError> {
        if self.summary.trim().chars().count() < MIN_SUMMARY_CHARS {
            return Err(PlanValidationError::SummaryTooShort);
        }
        if self.steps.is_empty() {
            return Err(PlanValidationError::NoSteps);
        }
        if let Some(index) = self
            .steps
            .iter()
            .position(|step| step.description.trim().chars().count() < MIN_STEP_CHARS)
        {
            return Err(PlanValidationError::StepTooShort(index + 1));
        }
        if self.validation_criteria.is_empty() {
            return Err(PlanValidationError::NoValidationCriteria);
        }
        Ok(())
    }

    /// Parse and validate raw tool input.
    pub fn from_tool_input(input: Value) -> Result<Self, PlanValidationError> {
        let plan: ImplementationPlan = serde_json::from_value(input)
            .map_err(|e| PlanValidationError::Malformed(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    plan: Option<ImplementationPlan>,
    last_error: Option<PlanValidationError>,
    rejected: usize,
}

/// Shared slot the plan tool writes into. Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct PlanCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl PlanCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn plan(&self) -> Option<ImplementationPlan> {
        self.lock().plan.clone()
    }

    pub fn is_captured(&self) -> bool {
        self.lock().plan.is_some()
    }

    /// Remove and return the captured plan.
    pub fn take(&self) -> Option<ImplementationPlan> {
        self.lock().plan.take()
    }

    /// The most recent rejected submission's validation error.
    pub fn last_error(&self) -> Option<PlanValidationError> {
        self.lock().last_error.clone()
    }

    pub fn rejected_count(&self) -> usize {
        self.lock().rejected
    }

    /// Clear everything before the next planner run.
    pub fn reset(&self) {
        *self.lock() = CaptureState::default();
    }

    /// Store `plan` unless one is already held. Returns whether it was stored.
    fn store(&self, plan: ImplementationPlan) -> bool {
        let mut state = self.lock();
        if state.plan.is_some() {
            return false;
        }
        state.plan = Some(plan);
        true
    }

    fn reject(&self, error: PlanValidationError) {
        let mut state = self.lock();
        state.rejected += 1;
        state.last_error = Some(error);
    }
}

struct SubmitPlan {
    capture: PlanCapture,
}

#[async_trait]
impl ToolHandler for SubmitPlan {
    async fn call(&self, input: Value) -> ToolOutput {
        let plan = match ImplementationPlan::from_tool_input(input) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Rejected plan submission: {}", e);
                let message = format!("Invalid plan: {}. Fix the plan and submit it again.", e);
                self.capture.reject(e);
                return ToolOutput::error(message);
            }
        };

        let complete = plan.is_complete;
        let steps = plan.steps.len();
        if !self.capture.store(plan) {
            debug!("Ignoring plan submitted after one was already captured");
            return ToolOutput::error(
                "A plan was already submitted for this iteration. Stop here.",
            );
        }

        if complete {
            info!("Planner marked the task complete");
            ToolOutput::success("Task marked complete. No further iterations will run.")
        } else {
            info!("Captured plan with {} steps", steps);
            ToolOutput::success(format!(
                "Plan submitted with {} steps. It will be handed to the implementer.",
                steps
            ))
        }
    }
}

pub fn plan_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: PLAN_TOOL_NAME.to_string(),
        description: "Submit the implementation plan for this iteration. Set isComplete \
                      to true (with a completionMessage) if the task is already finished."
            .to_string(),
        input_schema: json_schema_for::<ImplementationPlan>(),
    }
}

/// Tool server exposing `submit_implementation_plan`, bound to `capture`.
pub fn plan_tool_server(capture: PlanCapture) -> ToolServer {
    ToolServer::new(PLAN_SERVER_NAME).with_tool(LocalTool {
        definition: plan_tool_definition(),
        handler: Arc::new(SubmitPlan { capture }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_input() -> Value {
        json!({
            "summary": "Add retry handling to the fetcher",
            "steps": [
                {"description": "Wrap fetch in a retry loop", "files": ["src/fetch.rs"]},
                {"description": "Add unit tests", "commands": ["cargo test"]}
            ],
            "validationCriteria": ["tests pass"],
            "isComplete": false
        })
    }

    async fn submit(server: &ToolServer, input: Value) -> ToolOutput {
        server.tools[0].handler.call(input).await
    }

    #[test]
    fn schema_uses_wire_names_and_requires_core_fields() {
        let schema = plan_tool_definition().input_schema;
        let properties = schema["properties"].as_object().unwrap();
        for key in ["summary", "steps", "validationCriteria", "isComplete", "completionMessage"] {
            assert!(properties.contains_key(key), "missing {}", key);
        }
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(required.contains(&"isComplete"));
        assert!(required.contains(&"steps"));
        assert!(!required.contains(&"completionMessage"));
        assert_eq!(properties["summary"]["minLength"], 10);
        assert_eq!(properties["steps"]["minItems"], 1);
        assert_eq!(properties["steps"]["items"]["properties"]["description"]["minLength"], 5);
        assert!(schema.get("$schema").is_none());
    }

    #[tokio::test]
    async fn valid_plan_is_captured() {
        let capture = PlanCapture::new();
        let server = plan_tool_server(capture.clone());
        assert_eq!(server.name, PLAN_SERVER_NAME);
        assert_eq!(
            server.qualified_name(PLAN_TOOL_NAME),
            "mcp__autonav-memento__submit_implementation_plan"
        );

        let output = submit(&server, valid_input()).await;
        assert!(!output.is_error);
        assert!(output.content.starts_with("Plan submitted"));

        let plan = capture.plan().unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].files, vec!["src/fetch.rs".to_string()]);
        assert_eq!(plan.validation_criteria, vec!["tests pass".to_string()]);
        assert!(!plan.is_complete);
    }

    #[tokio::test]
    async fn completion_is_acknowledged_differently() {
        let capture = PlanCapture::new();
        let server = plan_tool_server(capture.clone());
        let mut input = valid_input();
        input["isComplete"] = json!(true);
        input["completionMessage"] = json!("All done");

        let output = submit(&server, input).await;
        assert!(output.content.starts_with("Task marked complete"));
        assert_eq!(capture.plan().unwrap().completion_message.as_deref(), Some("All done"));
    }

    #[tokio::test]
    async fn invalid_plans_are_rejected_and_recorded() {
        let capture = PlanCapture::new();
        let server = plan_tool_server(capture.clone());

        let mut input = valid_input();
        input["summary"] = json!("short");
        let output = submit(&server, input).await;
        assert!(output.is_error);
        assert_eq!(capture.last_error(), Some(PlanValidationError::SummaryTooShort));

        let mut input = valid_input();
        input["steps"][1]["description"] = json!("ok");
        submit(&server, input).await;
        assert_eq!(capture.last_error(), Some(PlanValidationError::StepTooShort(2)));

        let mut input = valid_input();
        input.as_object_mut().unwrap().remove("isComplete");
        submit(&server, input).await;
        assert!(matches!(capture.last_error(), Some(PlanValidationError::Malformed(_))));

        let mut input = valid_input();
        input["validationCriteria"] = json!([]);
        submit(&server, input).await;
        assert_eq!(capture.last_error(), Some(PlanValidationError::NoValidationCriteria));

        assert_eq!(capture.rejected_count(), 4);
        assert!(!capture.is_captured());
    }

    #[tokio::test]
    async fn first_valid_plan_wins() {
        let capture = PlanCapture::new();
        let server = plan_tool_server(capture.clone());
        submit(&server, valid_input()).await;

        let mut second = valid_input();
        second["summary"] = json!("A completely different plan");
        let output = submit(&server, second).await;
        assert!(output.is_error);
        assert_eq!(capture.plan().unwrap().summary, "Add retry handling to the fetcher");

        capture.reset();
        assert!(capture.plan().is_none());
        assert!(capture.last_error().is_none());
    }
}
