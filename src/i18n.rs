//! Localisation catalog for user-visible status strings and error hints.
//!
//! The catalog is a plain value owned by whoever builds the engine, never a
//! process-wide singleton. Wire payloads and log lines stay in English;
//! only strings shown to the operator or fed to the model as guidance go
//! through here.

use crate::config::Language;

/// All user-visible strings for one language.
#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    lang: Language,
}

impl Catalog {
    pub fn new(lang: Language) -> Self {
        Self { lang }
    }

    pub fn language(&self) -> Language {
        self.lang
    }

    fn pick(&self, en: &'static str, zh: &'static str) -> &'static str {
        match self.lang {
            Language::EnUs => en,
            Language::ZhCn => zh,
        }
    }

    pub fn user_rejected(&self) -> &'static str {
        self.pick(
            "user rejected the command; propose a safer alternative",
            "用户拒绝了该命令；请提出更安全的替代方案",
        )
    }

    pub fn command_blocked(&self) -> &'static str {
        self.pick(
            "command is blocked by policy and will never be executed",
            "该命令被安全策略禁止，不会被执行",
        )
    }

    pub fn still_running_hint(&self) -> &'static str {
        self.pick(
            "command is still running; use wait then check_terminal_status before sending anything else",
            "命令仍在运行；请先使用 wait，再用 check_terminal_status 查看状态，不要再发送其他输入",
        )
    }

    pub fn terminal_busy_hint(&self) -> &'static str {
        self.pick(
            "terminal is busy; use wait or check_terminal_status, or send_control_key if the foreground command must be interrupted",
            "终端正忙；请使用 wait 或 check_terminal_status，若必须中断前台命令可使用 send_control_key",
        )
    }

    pub fn confirmation_timeout(&self) -> &'static str {
        self.pick(
            "confirmation was not answered in time; command not executed",
            "确认请求超时未响应；命令未执行",
        )
    }

    pub fn ask_user_timeout(&self) -> &'static str {
        self.pick(
            "(no reply within 5 minutes; proceed with your best judgement)",
            "（5 分钟内未收到回复；请按你的最佳判断继续）",
        )
    }

    pub fn loop_stop_message(&self) -> &'static str {
        self.pick(
            "Stopped: the agent kept repeating the same operations without progress.",
            "已停止：代理反复执行相同操作且没有进展。",
        )
    }

    pub fn reflection_loop(&self) -> &'static str {
        self.pick(
            "You are repeating the same command without new results. State the problem plainly, then either try a different approach or finish with what you know.",
            "你在重复执行相同的命令且没有新结果。请直接说明问题所在，然后换一种方法，或基于已知信息收尾。",
        )
    }

    pub fn reflection_failures(&self) -> &'static str {
        self.pick(
            "Several consecutive tool calls failed. Re-read the last errors, simplify your approach, and verify each assumption with a read-only command first.",
            "连续多次工具调用失败。请重新阅读最近的错误信息，简化思路，并先用只读命令逐一验证你的假设。",
        )
    }

    pub fn reflection_too_many_steps(&self) -> &'static str {
        self.pick(
            "You have used many steps without finishing. Summarise progress so far and complete the task with the fewest remaining actions.",
            "你已经执行了很多步骤但尚未完成。请总结目前的进展，并用最少的剩余操作完成任务。",
        )
    }

    pub fn reflection_stalled(&self) -> &'static str {
        self.pick(
            "Recent steps made no visible progress. Reconsider the plan: is there a simpler diagnostic you have not tried?",
            "最近的步骤没有可见进展。请重新审视计划：是否有尚未尝试的更简单的诊断方法？",
        )
    }

    pub fn run_timeout_message(&self) -> &'static str {
        self.pick(
            "Stopped: the run exceeded its time limit.",
            "已停止：本次运行超过了时间限制。",
        )
    }

    pub fn tool_cap_message(&self) -> &'static str {
        self.pick(
            "Stopped: the run exceeded its tool call limit.",
            "已停止：本次运行超过了工具调用次数上限。",
        )
    }

    pub fn aborted_message(&self) -> &'static str {
        self.pick("Run aborted by user.", "运行已被用户中止。")
    }

    pub fn hint_permission(&self) -> &'static str {
        self.pick(
            "hint: permission denied; check ownership or retry with elevated rights if appropriate",
            "提示：权限不足；请检查属主，或在合适的情况下提升权限重试",
        )
    }

    pub fn hint_not_found(&self) -> &'static str {
        self.pick(
            "hint: target not found; verify the path or name with a read-only command first",
            "提示：目标不存在；请先用只读命令确认路径或名称",
        )
    }

    pub fn hint_timeout(&self) -> &'static str {
        self.pick(
            "hint: operation timed out; use wait then check_terminal_status",
            "提示：操作超时；请使用 wait，然后 check_terminal_status",
        )
    }

    pub fn hint_transient(&self) -> &'static str {
        self.pick(
            "hint: transient failure; retrying once is reasonable",
            "提示：临时性失败；可以重试一次",
        )
    }

    pub fn hint_syntax(&self) -> &'static str {
        self.pick(
            "hint: the command appears malformed; fix the syntax before retrying",
            "提示：命令格式有误；请先修正语法再重试",
        )
    }

    pub fn summary_task(&self) -> &'static str {
        self.pick("Task", "任务")
    }

    pub fn summary_status(&self) -> &'static str {
        self.pick("Status", "状态")
    }

    pub fn summary_answer(&self) -> &'static str {
        self.pick("Answer", "结论")
    }

    pub fn summary_last_error(&self) -> &'static str {
        self.pick("Last error", "最近错误")
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(Language::EnUs)
    }
}
