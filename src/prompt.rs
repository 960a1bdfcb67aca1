//! System prompt assembly.
//!
//! The system message is an ordered concatenation: persona preamble,
//! user-configured rules, the ReAct framework preamble, terminal context,
//! remembered host facts, the active plan summary, and the tool
//! signatures. A token budget is enforced by trimming host memories first
//! and rules second; the framework preamble and tool list are never cut.

use crate::api::types::ToolDefinition;
use crate::config::Language;
use crate::knowledge::HostProfile;
use crate::terminal::ShellKind;
use crate::token_count::estimate_content_tokens;

/// The sixteen MBTI codes and the voice each lends the persona.
const MBTI_STYLES: [(&str, &str); 16] = [
    ("INTJ", "You are methodical and strategic; you outline the shortest reliable path before acting."),
    ("INTP", "You are analytical and curious; you explain the why behind each diagnostic."),
    ("ENTJ", "You are decisive and direct; you drive toward the result and say what you are doing."),
    ("ENTP", "You are inventive; you consider an unconventional angle when the obvious one stalls."),
    ("INFJ", "You are thoughtful and careful; you warn about side effects before they happen."),
    ("INFP", "You are gentle and patient; you keep explanations approachable."),
    ("ENFJ", "You are encouraging; you narrate progress so the operator always knows where things stand."),
    ("ENFP", "You are enthusiastic; you keep the session lively without losing precision."),
    ("ISTJ", "You are meticulous; you verify each step before moving to the next."),
    ("ISFJ", "You are protective; you prefer reversible actions and take backups first."),
    ("ESTJ", "You are organized and procedural; you follow runbooks and report deviations."),
    ("ESFJ", "You are attentive; you confirm intent before anything invasive."),
    ("ISTP", "You are hands-on and terse; you let command output do the talking."),
    ("ISFP", "You are calm and unobtrusive; you touch only what the task requires."),
    ("ESTP", "You are pragmatic and quick; you favor the direct fix with a safety check."),
    ("ESFP", "You are upbeat; you summarize findings in plain language."),
];

pub fn is_valid_mbti(code: &str) -> bool {
    MBTI_STYLES.iter().any(|(c, _)| *c == code)
}

const REACT_PREAMBLE: &str = "\
You work in a loop: reason about the situation, call one or more tools, \
observe their results, and continue until the task is done. Then answer \
with plain text and no tool calls.

Rules of engagement:
- The terminal is shared state. Check its status before running a command \
if the previous one may still be running.
- Commands are risk-checked. If one is rejected or requires confirmation, \
adapt instead of retrying it verbatim.
- Prefer read-only diagnostics before mutating anything.
- If output suggests a long-running command, use wait and \
check_terminal_status instead of piling up new commands.
- When the task is finished, state the outcome concisely.";

const REACT_PREAMBLE_ZH: &str = "\
你以循环方式工作：分析现状，调用一个或多个工具，观察结果，持续推进直到任务完成。\
完成后用纯文本作答，不再调用工具。

行为准则：
- 终端是共享状态。若上一条命令可能仍在运行，先检查终端状态再执行新命令。
- 所有命令都会经过风险检查。命令被拒绝或需要确认时，请调整方案而不是原样重试。
- 在做任何变更之前，优先使用只读命令进行诊断。
- 如果输出表明命令长时间运行，请使用 wait 和 check_terminal_status，不要堆积新命令。
- 任务完成后，简明说明结果。";

/// Everything the builder needs for one system message.
pub struct PromptInput<'a> {
    pub mbti: Option<&'a str>,
    pub rules: &'a str,
    pub language: Language,
    pub host_id: &'a str,
    pub profile: &'a HostProfile,
    pub shell_kind: ShellKind,
    pub memories: Vec<String>,
    pub plan_summary: Option<String>,
    pub tools: &'a [ToolDefinition],
}

pub struct PromptBuilder {
    token_budget: usize,
}

impl PromptBuilder {
    pub fn new(token_budget: usize) -> Self {
        Self { token_budget }
    }

    pub fn build_system_prompt(&self, input: &PromptInput<'_>) -> String {
        let persona = self.persona_section(input);
        let preamble = match input.language {
            Language::EnUs => REACT_PREAMBLE,
            Language::ZhCn => REACT_PREAMBLE_ZH,
        };
        let terminal = terminal_section(input);
        let tools = tool_section(input.tools);

        // Fixed sections are never trimmed; whatever budget remains is
        // shared by memories (trimmed first) and rules.
        let fixed = [
            persona.as_str(),
            preamble,
            terminal.as_str(),
            input.plan_summary.as_deref().unwrap_or(""),
            tools.as_str(),
        ]
        .join("\n\n");
        let fixed_tokens = estimate_content_tokens(&fixed);
        let remaining = self.token_budget.saturating_sub(fixed_tokens);

        let mut rule_lines: Vec<&str> = input
            .rules
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let mut memories = input.memories.clone();

        loop {
            let variable: usize = memories
                .iter()
                .map(|m| estimate_content_tokens(m))
                .sum::<usize>()
                + rule_lines
                    .iter()
                    .map(|r| estimate_content_tokens(r))
                    .sum::<usize>();
            if variable <= remaining {
                break;
            }
            // Memories go first, least relevant (last) first; then the
            // oldest rules from the top of the list.
            if memories.pop().is_none() {
                if rule_lines.is_empty() {
                    break;
                }
                rule_lines.remove(0);
            }
        }

        let mut sections: Vec<String> = vec![persona];
        if !rule_lines.is_empty() {
            sections.push(format!("Operator rules:\n{}", rule_lines.join("\n")));
        }
        sections.push(preamble.to_string());
        sections.push(terminal);
        if !memories.is_empty() {
            sections.push(format!(
                "What you remember about {}:\n- {}",
                input.host_id,
                memories.join("\n- ")
            ));
        }
        if let Some(plan) = &input.plan_summary {
            sections.push(plan.clone());
        }
        sections.push(tools);
        sections.join("\n\n")
    }

    fn persona_section(&self, input: &PromptInput<'_>) -> String {
        let base = match input.language {
            Language::EnUs => {
                "You are ShellPilot, an operations agent that accomplishes tasks by driving a terminal."
            }
            Language::ZhCn => "你是 ShellPilot，一个通过操作终端来完成运维任务的智能代理。",
        };
        match input
            .mbti
            .and_then(|code| MBTI_STYLES.iter().find(|(c, _)| *c == code))
        {
            Some((_, style)) => format!("{} {}", base, style),
            None => base.to_string(),
        }
    }
}

fn terminal_section(input: &PromptInput<'_>) -> String {
    let shell = input
        .profile
        .shell
        .clone()
        .unwrap_or_else(|| match input.shell_kind {
            ShellKind::Posix => "sh".to_string(),
            ShellKind::Ssh => "remote shell over ssh".to_string(),
            ShellKind::Unknown => "unknown".to_string(),
        });
    let mut out = format!("Terminal context:\n- host: {}\n- shell: {}", input.host_id, shell);
    if let Some(os) = &input.profile.os {
        out.push_str(&format!("\n- os: {}", os));
    }
    if let Some(dir) = &input.profile.working_dir {
        out.push_str(&format!("\n- working directory: {}", dir));
    }
    if input.shell_kind == ShellKind::Ssh {
        out.push_str(
            "\n- note: this is a remote session; prompt detection is unreliable, verify with check_terminal_status",
        );
    }
    out
}

fn tool_section(tools: &[ToolDefinition]) -> String {
    let mut out = String::from("Available tools:\n");
    for tool in tools {
        out.push_str(&format!(
            "- {}: {}\n",
            tool.function.name, tool.function.description
        ));
    }
    out
}
