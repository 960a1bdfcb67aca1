//! Reflection: meta-analysis of recent tool history.
//!
//! Watches every tool call for pathological patterns (command loops,
//! failure streaks, stalled progress) and prescribes either a corrective
//! prompt or a strategy switch. Returning no prompt at all means the run
//! should be force-stopped.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use crate::i18n::Catalog;
use crate::planner::PlanStrategy;

/// Ring capacity for recent commands and signatures.
const HISTORY_CAP: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionIssue {
    DetectedCommandLoop,
    ConsecutiveFailures,
    TooManySteps,
    TooManyReflections,
    ProgressStalled,
}

impl std::fmt::Display for ReflectionIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReflectionIssue::DetectedCommandLoop => "detected_command_loop",
            ReflectionIssue::ConsecutiveFailures => "consecutive_failures",
            ReflectionIssue::TooManySteps => "too_many_steps",
            ReflectionIssue::TooManyReflections => "too_many_reflections",
            ReflectionIssue::ProgressStalled => "progress_stalled",
        };
        write!(f, "{}", s)
    }
}

/// Thresholds, taken from engine configuration at run start.
#[derive(Debug, Clone, Copy)]
pub struct ReflectionLimits {
    /// Tool calls before the step count itself becomes an issue.
    pub warn_steps: usize,
    /// Reflections before the run is force-stopped.
    pub max_reflections: usize,
    /// Minimum tool calls between two reflection injections.
    pub min_interval: usize,
}

impl Default for ReflectionLimits {
    fn default() -> Self {
        Self {
            warn_steps: 40,
            max_reflections: 3,
            min_interval: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySwitch {
    pub from: PlanStrategy,
    pub to: PlanStrategy,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionState {
    pub tool_call_count: usize,
    pub consecutive_failure_count: usize,
    pub total_failures: usize,
    pub success_count: usize,
    /// Successes since the last failure; drives recovery back to Default.
    pub consecutive_success_count: usize,
    pub last_commands: VecDeque<String>,
    pub last_tool_call_signatures: VecDeque<u64>,
    pub last_reflection_step: usize,
    pub reflection_count: usize,
    pub current_strategy: PlanStrategy,
    pub strategy_switches: Vec<StrategySwitch>,
    pub detected_issues: Vec<String>,
    /// Consecutive calls whose signature was already in the ring.
    stagnant_calls: usize,
}

impl Default for ReflectionState {
    fn default() -> Self {
        Self::new()
    }
}

fn signature(tool_name: &str, args: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    tool_name.hash(&mut hasher);
    args.hash(&mut hasher);
    hasher.finish()
}

impl ReflectionState {
    pub fn new() -> Self {
        Self {
            tool_call_count: 0,
            consecutive_failure_count: 0,
            total_failures: 0,
            success_count: 0,
            consecutive_success_count: 0,
            last_commands: VecDeque::with_capacity(HISTORY_CAP),
            last_tool_call_signatures: VecDeque::with_capacity(HISTORY_CAP),
            last_reflection_step: 0,
            reflection_count: 0,
            current_strategy: PlanStrategy::Default,
            strategy_switches: Vec::new(),
            detected_issues: Vec::new(),
            stagnant_calls: 0,
        }
    }

    /// Account for one executed tool call.
    pub fn record(&mut self, tool_name: &str, args: &str, command: Option<&str>, success: bool) {
        self.tool_call_count += 1;

        let sig = signature(tool_name, args);
        let seen_before = self.last_tool_call_signatures.contains(&sig);
        if seen_before {
            self.stagnant_calls += 1;
        } else {
            self.stagnant_calls = 0;
        }
        push_capped(&mut self.last_tool_call_signatures, sig);

        if let Some(cmd) = command {
            push_capped(&mut self.last_commands, cmd.to_string());
        }

        if success {
            self.success_count += 1;
            self.consecutive_success_count += 1;
            self.consecutive_failure_count = 0;
        } else {
            self.total_failures += 1;
            self.consecutive_failure_count += 1;
            self.consecutive_success_count = 0;
        }
    }

    /// Inspect the recent history for pathological patterns. Also caches
    /// the result in `detected_issues` for the run record.
    pub fn detect_issues(&mut self, limits: &ReflectionLimits) -> Vec<ReflectionIssue> {
        let mut issues = Vec::new();

        if self.has_command_loop() {
            issues.push(ReflectionIssue::DetectedCommandLoop);
        }
        if self.consecutive_failure_count >= 3 {
            issues.push(ReflectionIssue::ConsecutiveFailures);
        }
        if self.tool_call_count >= limits.warn_steps {
            issues.push(ReflectionIssue::TooManySteps);
        }
        if self.reflection_count >= limits.max_reflections {
            issues.push(ReflectionIssue::TooManyReflections);
        }
        if self.stagnant_calls >= 5 {
            issues.push(ReflectionIssue::ProgressStalled);
        }

        self.detected_issues = issues.iter().map(|i| i.to_string()).collect();
        issues
    }

    /// AAA over the last three commands, or ABAB over the last four.
    fn has_command_loop(&self) -> bool {
        let cmds: Vec<&String> = self.last_commands.iter().collect();
        let n = cmds.len();
        if n >= 3 && cmds[n - 1] == cmds[n - 2] && cmds[n - 2] == cmds[n - 3] {
            return true;
        }
        if n >= 4
            && cmds[n - 1] == cmds[n - 3]
            && cmds[n - 2] == cmds[n - 4]
            && cmds[n - 1] != cmds[n - 2]
        {
            return true;
        }
        false
    }

    /// Whether to inject a reflection prompt now. Requires a live issue
    /// and at least `min_interval` tool calls since the last injection.
    pub fn should_trigger_reflection(&mut self, limits: &ReflectionLimits) -> bool {
        let issues = self.detect_issues(limits);
        !issues.is_empty() && self.tool_call_count - self.last_reflection_step >= limits.min_interval
    }

    /// Mark that a reflection prompt was injected at the current step.
    pub fn note_reflection(&mut self) {
        self.reflection_count += 1;
        self.last_reflection_step = self.tool_call_count;
    }

    /// Strategy correction derived from the recent record: failures and
    /// loops fall back to conservative, sustained success recovers to
    /// default.
    pub fn should_switch_strategy(
        &mut self,
        limits: &ReflectionLimits,
    ) -> Option<(PlanStrategy, String)> {
        let issues = self.detect_issues(limits);
        let looping = issues.contains(&ReflectionIssue::DetectedCommandLoop);
        let failing = issues.contains(&ReflectionIssue::ConsecutiveFailures);

        if (looping || failing) && self.current_strategy != PlanStrategy::Conservative {
            let reason = if looping {
                "command loop detected".to_string()
            } else {
                "repeated failures".to_string()
            };
            return Some((PlanStrategy::Conservative, reason));
        }

        if self.current_strategy == PlanStrategy::Conservative
            && self.consecutive_success_count >= 3
            && issues.is_empty()
        {
            return Some((
                PlanStrategy::Default,
                "sustained success; easing back to normal pace".to_string(),
            ));
        }
        None
    }

    /// Apply a strategy switch and log it.
    pub fn switch_strategy(&mut self, to: PlanStrategy, reason: String) {
        if self.current_strategy == to {
            return;
        }
        self.strategy_switches.push(StrategySwitch {
            from: self.current_strategy,
            to,
            reason,
        });
        self.current_strategy = to;
    }

    /// Compose the corrective user-role prompt for the current issues.
    /// `None` means the run should be force-stopped.
    pub fn generate_reflection_prompt(
        &mut self,
        limits: &ReflectionLimits,
        catalog: &Catalog,
    ) -> Option<String> {
        let issues = self.detect_issues(limits);
        if issues.contains(&ReflectionIssue::TooManyReflections) {
            return None;
        }
        // Most specific issue wins; a loop explains a stall, not the
        // other way around.
        if issues.contains(&ReflectionIssue::DetectedCommandLoop) {
            return Some(catalog.reflection_loop().to_string());
        }
        if issues.contains(&ReflectionIssue::ConsecutiveFailures) {
            return Some(catalog.reflection_failures().to_string());
        }
        if issues.contains(&ReflectionIssue::TooManySteps) {
            return Some(catalog.reflection_too_many_steps().to_string());
        }
        if issues.contains(&ReflectionIssue::ProgressStalled) {
            return Some(catalog.reflection_stalled().to_string());
        }
        None
    }
}

fn push_capped<T>(ring: &mut VecDeque<T>, value: T) {
    if ring.len() == HISTORY_CAP {
        ring.pop_front();
    }
    ring.push_back(value);
}
