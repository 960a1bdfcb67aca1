//! Planning tools: register a step plan and transition it mid-run.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_args, PlanSlot, Tool, ToolContext, ToolResult};
use crate::planner::{self, PlanStatus, PlanStrategy, StepStatus, TaskStep};

/// Register a new TaskPlan for the run. Fails while another plan is
/// active, so the model updates instead of silently replacing it.
pub struct CreatePlan {
    plan: PlanSlot,
}

impl CreatePlan {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            plan: ctx.plan.clone(),
        }
    }
}

#[derive(Deserialize)]
struct StepInput {
    description: String,
    #[serde(default)]
    purpose: String,
    #[serde(default)]
    checkpoint: bool,
}

#[async_trait]
impl Tool for CreatePlan {
    fn name(&self) -> &str {
        "create_plan"
    }

    fn description(&self) -> &str {
        "Register a step-by-step plan for the current task. Use update_plan to transition steps afterwards."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "The task this plan addresses"},
                "steps": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": {"type": "string"},
                            "purpose": {"type": "string"},
                            "checkpoint": {"type": "boolean", "default": false}
                        },
                        "required": ["description"]
                    }
                },
                "strategy": {"type": "string", "enum": ["default", "conservative", "aggressive", "diagnostic"], "default": "default"},
                "success_criteria": {"type": "string"},
                "risk_assessment": {"type": "string"}
            },
            "required": ["task", "steps"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            task: String,
            steps: Vec<StepInput>,
            #[serde(default)]
            strategy: PlanStrategy,
            success_criteria: Option<String>,
            risk_assessment: Option<String>,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };

        let mut slot = self.plan.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.evaluate_status() != PlanStatus::Completed {
                return Ok(ToolResult::fail(
                    "an active plan already exists; use update_plan instead",
                ));
            }
        }

        let steps: Vec<TaskStep> = args
            .steps
            .into_iter()
            .map(|s| {
                let mut step = TaskStep::new(s.description, s.purpose);
                step.checkpoint = s.checkpoint;
                step
            })
            .collect();
        let plan = match planner::create_plan(
            &args.task,
            steps,
            args.strategy,
            args.success_criteria,
            args.risk_assessment,
        ) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::fail(e.to_string())),
        };
        let summary = plan.summary();
        let step_ids: Vec<Value> = plan
            .steps
            .iter()
            .map(|s| serde_json::json!({"id": s.id, "description": s.description}))
            .collect();
        *slot = Some(plan);
        Ok(ToolResult::ok(format!("plan registered\n{}", summary))
            .with_metadata("steps", Value::Array(step_ids)))
    }
}

/// Transition, extend, shrink or re-strategise the active plan.
pub struct UpdatePlan {
    plan: PlanSlot,
}

impl UpdatePlan {
    pub fn new(ctx: &ToolContext) -> Self {
        Self {
            plan: ctx.plan.clone(),
        }
    }
}

#[async_trait]
impl Tool for UpdatePlan {
    fn name(&self) -> &str {
        "update_plan"
    }

    fn description(&self) -> &str {
        "Modify the active plan: update a step's status, add/remove/modify/retry steps, or change strategy."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["update_step", "add_step", "remove_step", "modify_step", "retry_step", "change_strategy"]},
                "step_id": {"type": "string"},
                "status": {"type": "string", "enum": ["pending", "in_progress", "completed", "failed", "skipped", "blocked"]},
                "description": {"type": "string"},
                "purpose": {"type": "string"},
                "alternative_approach": {"type": "string"},
                "position": {"type": "integer", "minimum": 0},
                "strategy": {"type": "string", "enum": ["default", "conservative", "aggressive", "diagnostic"]},
                "reason": {"type": "string"}
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Args {
            action: String,
            step_id: Option<String>,
            status: Option<StepStatus>,
            description: Option<String>,
            #[serde(default)]
            purpose: String,
            alternative_approach: Option<String>,
            position: Option<usize>,
            strategy: Option<PlanStrategy>,
            reason: Option<String>,
        }
        let args: Args = match parse_args(args) {
            Ok(a) => a,
            Err(r) => return Ok(*r),
        };

        let mut slot = self.plan.lock().await;
        let Some(plan) = slot.as_mut() else {
            return Ok(ToolResult::fail("no active plan; call create_plan first"));
        };

        let outcome = match args.action.as_str() {
            "update_step" => match (args.step_id.as_deref(), args.status) {
                (Some(id), Some(status)) => plan.update_step(id, status),
                _ => Err(anyhow::anyhow!("update_step needs step_id and status")),
            },
            "add_step" => match args.description {
                Some(desc) => {
                    let step = TaskStep::new(desc, args.purpose);
                    let position = args.position.unwrap_or(plan.steps.len());
                    plan.add_step(position, step)
                }
                None => Err(anyhow::anyhow!("add_step needs a description")),
            },
            "remove_step" => match args.step_id.as_deref() {
                Some(id) => plan.remove_step(id).map(|_| ()),
                None => Err(anyhow::anyhow!("remove_step needs step_id")),
            },
            "modify_step" => match args.step_id.as_deref() {
                Some(id) => plan.modify_step(id, args.description, args.alternative_approach),
                None => Err(anyhow::anyhow!("modify_step needs step_id")),
            },
            "retry_step" => match args.step_id.as_deref() {
                Some(id) => plan.retry_step(id),
                None => Err(anyhow::anyhow!("retry_step needs step_id")),
            },
            "change_strategy" => match args.strategy {
                Some(strategy) => {
                    plan.change_strategy(
                        strategy,
                        args.reason.as_deref().unwrap_or("requested by model"),
                    );
                    Ok(())
                }
                None => Err(anyhow::anyhow!("change_strategy needs a strategy")),
            },
            other => Err(anyhow::anyhow!("unknown plan action: {}", other)),
        };

        match outcome {
            Ok(()) => {
                let status = plan.evaluate_status();
                Ok(ToolResult::ok(format!(
                    "plan status: {:?}\n{}",
                    status,
                    plan.summary()
                )))
            }
            Err(e) => Ok(ToolResult::fail(e.to_string())),
        }
    }
}
