//! Task planning: complexity analysis, strategy recommendation, and the
//! mutable step plan the agent maintains mid-flight.
//!
//! All plan mutations are recorded in an append-only adjustments log so a
//! finished run explains how its plan evolved.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    #[default]
    Default,
    Conservative,
    Aggressive,
    Diagnostic,
}

impl std::fmt::Display for PlanStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStrategy::Default => write!(f, "default"),
            PlanStrategy::Conservative => write!(f, "conservative"),
            PlanStrategy::Aggressive => write!(f, "aggressive"),
            PlanStrategy::Diagnostic => write!(f, "diagnostic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    OnTrack,
    AtRisk,
    Blocked,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub purpose: String,
    pub status: StepStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_approach: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_duration_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    2
}

impl TaskStep {
    pub fn new(description: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            id: format!("step_{}", uuid::Uuid::new_v4()),
            description: description.into(),
            purpose: purpose.into(),
            status: StepStatus::Pending,
            retry_count: 0,
            max_retries: default_max_retries(),
            checkpoint: false,
            alternative_approach: None,
            dependencies: Vec::new(),
            start_time: None,
            actual_duration_ms: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == StepStatus::Failed && self.retry_count < self.max_retries
    }
}

/// One entry in the append-only adjustments log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAdjustment {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub original_task: String,
    pub analysis: TaskComplexity,
    pub steps: Vec<TaskStep>,
    pub current_step_index: usize,
    pub strategy: PlanStrategy,
    pub adjustments: Vec<PlanAdjustment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<String>,
}

impl TaskPlan {
    pub fn current_step(&self) -> Option<&TaskStep> {
        self.steps.get(self.current_step_index)
    }

    fn log(&mut self, kind: &str, detail: String) {
        self.adjustments.push(PlanAdjustment {
            at: Utc::now(),
            kind: kind.to_string(),
            detail,
        });
        self.updated_at = Utc::now();
    }

    fn step_position(&self, step_id: &str) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| anyhow::anyhow!("no step with id {}", step_id))
    }

    /// Transition one step's status. Completing or skipping the current
    /// step advances `current_step_index` to the next non-terminal step;
    /// the index never regresses here.
    pub fn update_step(&mut self, step_id: &str, status: StepStatus) -> Result<()> {
        let pos = self.step_position(step_id)?;
        let step = &mut self.steps[pos];
        match status {
            StepStatus::InProgress if step.start_time.is_none() => {
                step.start_time = Some(Utc::now());
            }
            StepStatus::Completed | StepStatus::Failed => {
                if let Some(started) = step.start_time {
                    let elapsed = Utc::now().signed_duration_since(started);
                    step.actual_duration_ms = Some(elapsed.num_milliseconds().max(0) as u64);
                }
            }
            _ => {}
        }
        step.status = status;
        self.log("update_step", format!("{} -> {:?}", step_id, status));

        if pos == self.current_step_index
            && matches!(
                status,
                StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
            )
        {
            self.advance();
        }
        Ok(())
    }

    /// Move the index forward past terminal steps, staying inside
    /// `[0, steps.len())`.
    fn advance(&mut self) {
        while self.current_step_index + 1 < self.steps.len()
            && matches!(
                self.steps[self.current_step_index].status,
                StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
            )
        {
            self.current_step_index += 1;
        }
    }

    /// Insert a step at `position` (clamped to the plan's end).
    pub fn add_step(&mut self, position: usize, step: TaskStep) -> Result<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            bail!("duplicate step id {}", step.id);
        }
        let position = position.min(self.steps.len());
        self.log(
            "add_step",
            format!("{} at {}: {}", step.id, position, step.description),
        );
        self.steps.insert(position, step);
        if position <= self.current_step_index && self.steps.len() > 1 {
            // Keep pointing at the same step the agent was on.
            self.current_step_index += 1;
        }
        Ok(())
    }

    /// Remove a step. The last remaining step cannot be removed, which
    /// keeps `current_step_index` meaningful.
    pub fn remove_step(&mut self, step_id: &str) -> Result<TaskStep> {
        if self.steps.len() == 1 {
            bail!("cannot remove the only step of a plan");
        }
        let pos = self.step_position(step_id)?;
        let removed = self.steps.remove(pos);
        if pos < self.current_step_index
            || self.current_step_index >= self.steps.len()
        {
            self.current_step_index = self.current_step_index.saturating_sub(1);
        }
        self.log("remove_step", format!("{}: {}", step_id, removed.description));
        Ok(removed)
    }

    /// Rewrite a step's description and approach, preserving its status.
    pub fn modify_step(
        &mut self,
        step_id: &str,
        description: Option<String>,
        alternative_approach: Option<String>,
    ) -> Result<()> {
        let pos = self.step_position(step_id)?;
        let step = &mut self.steps[pos];
        if let Some(desc) = description {
            step.description = desc;
        }
        if let Some(alt) = alternative_approach {
            step.alternative_approach = Some(alt);
        }
        self.log("modify_step", step_id.to_string());
        Ok(())
    }

    /// Re-open a failed step for another attempt. This is the only way the
    /// index moves backward.
    pub fn retry_step(&mut self, step_id: &str) -> Result<()> {
        let pos = self.step_position(step_id)?;
        let step = &mut self.steps[pos];
        if !step.can_retry() {
            bail!(
                "step {} is not retriable (status {:?}, {}/{} retries used)",
                step_id,
                step.status,
                step.retry_count,
                step.max_retries
            );
        }
        step.retry_count += 1;
        step.status = StepStatus::Pending;
        step.start_time = None;
        if pos < self.current_step_index {
            self.current_step_index = pos;
        }
        self.log(
            "retry_step",
            format!("{} (attempt {})", step_id, self.steps[pos].retry_count + 1),
        );
        Ok(())
    }

    pub fn change_strategy(&mut self, strategy: PlanStrategy, reason: &str) {
        if self.strategy == strategy {
            return;
        }
        self.log(
            "change_strategy",
            format!("{} -> {} ({})", self.strategy, strategy, reason),
        );
        self.strategy = strategy;
    }

    /// Overall plan health.
    pub fn evaluate_status(&self) -> PlanStatus {
        if self
            .steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
        {
            return PlanStatus::Completed;
        }
        if self.steps.iter().any(|s| {
            s.status == StepStatus::Blocked
                || (s.status == StepStatus::Failed && !s.can_retry())
        }) {
            return PlanStatus::Blocked;
        }
        if self
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Failed || s.retry_count > 0)
        {
            return PlanStatus::AtRisk;
        }
        PlanStatus::OnTrack
    }

    /// Compact progress block for the system prompt.
    pub fn summary(&self) -> String {
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let mut out = format!(
            "Plan ({}/{} steps done, strategy {}):\n",
            done,
            self.steps.len(),
            self.strategy
        );
        for (i, step) in self.steps.iter().enumerate() {
            let marker = match step.status {
                StepStatus::Completed => "[x]",
                StepStatus::InProgress => "[>]",
                StepStatus::Failed => "[!]",
                StepStatus::Skipped => "[-]",
                StepStatus::Blocked => "[#]",
                StepStatus::Pending => "[ ]",
            };
            let cursor = if i == self.current_step_index { " <- current" } else { "" };
            out.push_str(&format!("{} {}{}\n", marker, step.description, cursor));
        }
        out
    }
}

/// Task complexity from keyword heuristics and length. Total and
/// deterministic: the same task always classifies the same way.
pub fn analyse_task_complexity(task: &str) -> TaskComplexity {
    let lower = task.to_lowercase();
    const COMPLEX_SIGNALS: &[&str] = &[
        "diagnose", "deploy", "migrate", "migration", "monitor", "troubleshoot", "cluster",
        "all hosts", "every host", "排查", "部署", "迁移", "监控",
    ];
    const MODERATE_SIGNALS: &[&str] = &[
        "configure", "config", "create", "install", "set up", "setup", "analyse", "analyze",
        "check and", "配置", "创建", "安装", "分析",
    ];

    let mentioned_services = ["nginx", "mysql", "postgres", "redis", "docker", "kafka"]
        .iter()
        .filter(|s| lower.contains(**s))
        .count();

    if COMPLEX_SIGNALS.iter().any(|s| lower.contains(s)) || mentioned_services >= 2 {
        return TaskComplexity::Complex;
    }
    if MODERATE_SIGNALS.iter().any(|s| lower.contains(s)) || task.chars().count() > 100 {
        return TaskComplexity::Moderate;
    }
    TaskComplexity::Simple
}

/// Context fed into strategy recommendation.
#[derive(Debug, Clone, Default)]
pub struct StrategyContext {
    pub production: bool,
    pub prior_failures: u32,
}

#[derive(Debug, Clone)]
pub struct StrategyRecommendation {
    pub strategy: PlanStrategy,
    pub reason: String,
    pub confidence: f32,
}

pub fn recommend_strategy(task: &str, context: &StrategyContext) -> StrategyRecommendation {
    let lower = task.to_lowercase();

    if context.prior_failures >= 2 {
        return StrategyRecommendation {
            strategy: PlanStrategy::Conservative,
            reason: "repeated failures call for smaller, verified steps".to_string(),
            confidence: 0.9,
        };
    }
    if context.production || lower.contains("production") || lower.contains("生产") {
        return StrategyRecommendation {
            strategy: PlanStrategy::Conservative,
            reason: "production environment".to_string(),
            confidence: 0.85,
        };
    }
    const DIAGNOSTIC_VERBS: &[&str] = &[
        "diagnose", "investigate", "analyse", "analyze", "why", "debug", "find out", "排查", "诊断",
    ];
    if DIAGNOSTIC_VERBS.iter().any(|v| lower.contains(v)) {
        return StrategyRecommendation {
            strategy: PlanStrategy::Diagnostic,
            reason: "analysis task: observe before changing anything".to_string(),
            confidence: 0.8,
        };
    }
    if lower.contains("urgent") || lower.contains("asap") || lower.contains("紧急") {
        return StrategyRecommendation {
            strategy: PlanStrategy::Aggressive,
            reason: "urgency outweighs step-by-step caution".to_string(),
            confidence: 0.7,
        };
    }
    StrategyRecommendation {
        strategy: PlanStrategy::Default,
        reason: "no special signals".to_string(),
        confidence: 0.6,
    }
}

/// Build a fresh plan with unique step ids.
pub fn create_plan(
    task: &str,
    steps: Vec<TaskStep>,
    strategy: PlanStrategy,
    success_criteria: Option<String>,
    risk_assessment: Option<String>,
) -> Result<TaskPlan> {
    if steps.is_empty() {
        bail!("a plan needs at least one step");
    }
    let mut seen = std::collections::HashSet::new();
    for step in &steps {
        if !seen.insert(step.id.as_str()) {
            bail!("duplicate step id {}", step.id);
        }
    }
    let now = Utc::now();
    Ok(TaskPlan {
        id: format!("plan_{}", uuid::Uuid::new_v4()),
        original_task: task.to_string(),
        analysis: analyse_task_complexity(task),
        steps,
        current_step_index: 0,
        strategy,
        adjustments: Vec::new(),
        created_at: now,
        updated_at: now,
        success_criteria,
        risk_assessment,
    })
}
