//! Pattern-based shell command risk classification.
//!
//! Ordered rule evaluation, first match wins: blocked, then dangerous,
//! then moderate, else safe. Chained commands (`;`, `&&`, `||`, `|`) are
//! assessed per segment and the whole chain takes the worst level, so a
//! `ls && rm -rf /tmp/x` cannot hide behind its harmless prefix.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::SafetyError;

/// Static classification of a command's potential impact. The derive order
/// gives the total order policy comparisons rely on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Safe,
    Moderate,
    Dangerous,
    Blocked,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Safe => write!(f, "safe"),
            RiskLevel::Moderate => write!(f, "moderate"),
            RiskLevel::Dangerous => write!(f, "dangerous"),
            RiskLevel::Blocked => write!(f, "blocked"),
        }
    }
}

/// Outcome of interactive-command auto-correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoCorrection {
    /// The command was rewritten to a non-blocking equivalent.
    Rewrite { corrected: String, note: String },
    /// The command cannot run non-interactively; a substitute is suggested.
    Reject { reason: String },
}

static BLOCKED_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"\brm\s+(-[a-zA-Z]+\s+)*(/+\s*$|/+\s|/\*)",
            "rm targeting the filesystem root",
        ),
        (r"\bmkfs(\.[a-z0-9]+)?\b", "mkfs formats a filesystem"),
        (
            r"\bdd\s+[^|;]*\bof=\s*/dev/(sd|hd|nvme|vd|xvd)",
            "dd writing to a disk device",
        ),
        (r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;?\s*:", "fork bomb"),
        (
            r"\bchmod\s+(-[a-zA-Z]+\s+)*777\s+/+\s*$",
            "chmod 777 on the filesystem root",
        ),
        (
            r"\bchmod\s+-[a-zA-Z]*R[a-zA-Z]*\s+777\s+/+\s*($|\s)",
            "recursive chmod 777 on the filesystem root",
        ),
        (r">\s*/dev/(sd|hd|nvme|vd|xvd)[a-z]?", "redirect onto a disk device"),
    ]
    .iter()
    .map(|(p, d)| (Regex::new(p).expect("blocked pattern"), *d))
    .collect()
});

static DANGEROUS_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"^\s*(sudo\s+)?rm\b", "rm deletes files"),
        (r"^\s*(sudo\s+)?kill(all)?\b", "kill terminates processes"),
        (r"^\s*(sudo\s+)?shutdown\b", "shutdown halts the host"),
        (r"^\s*(sudo\s+)?reboot\b", "reboot restarts the host"),
        (r"^\s*(sudo\s+)?poweroff\b", "poweroff halts the host"),
        (
            r"^\s*(sudo\s+)?systemctl\s+(stop|restart|disable|mask)\b",
            "systemctl stops or restarts a service",
        ),
        (
            r"^\s*(sudo\s+)?mv\s+[^;|&]*\s(/etc|/boot|/sys|/usr|/bin|/sbin|/lib)(/|\s|$)",
            "mv into or over a system path",
        ),
        (
            r"^\s*(sudo\s+)?mv\s+(/etc|/boot|/sys|/usr|/bin|/sbin|/lib)/",
            "mv of a system path",
        ),
        (r"\biptables\s+(-[a-zA-Z]+\s+)*-F\b", "iptables flush"),
        (r"^\s*(sudo\s+)?userdel\b", "userdel removes an account"),
        (r"(?i)\bdrop\s+(table|database)\b", "SQL drop statement"),
        (
            r"(^|\s)(>|>>|\btee\b)\s*(/etc|/boot|/sys)/",
            "write into a system path",
        ),
        (
            r"^\s*(sudo\s+)?(sed\s+-i|chmod|chown|cp|touch|ln|mkdir|rmdir|truncate)\s+[^;|&]*(/etc|/boot|/sys)(/|\s|$)",
            "modification under a system path",
        ),
    ]
    .iter()
    .map(|(p, d)| (Regex::new(p).expect("dangerous pattern"), *d))
    .collect()
});

static MODERATE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"^\s*(sudo\s+)?mv\b", "mv relocates files"),
        (r"^\s*(sudo\s+)?cp\b", "cp overwrites files"),
        (
            r"^\s*(sudo\s+)?(apt(-get)?|yum|dnf|brew|npm|pip3?|cargo)\s+(install|remove|uninstall|upgrade)\b",
            "package manager mutation",
        ),
        (r"^\s*(sudo\s+)?chmod\b", "chmod changes permissions"),
        (r"^\s*(sudo\s+)?chown\b", "chown changes ownership"),
        (r"\bsed\s+(-[a-zA-Z]*\s+)*-i\b", "in-place sed edit"),
        (r"^\s*git\s+push\b", "git push mutates a remote"),
        (r"^\s*git\s+reset\s+--hard\b", "git reset --hard discards work"),
        (r"^\s*git\s+(checkout|clean|rebase)\b", "git working-tree mutation"),
        (r"^\s*(sudo\s+)?(mkdir|rmdir|truncate)\b", "filesystem mutation"),
        (r"^\s*(sudo\s+)?systemctl\s+(start|enable|reload)\b", "service start"),
        (r"(^|\s)(>|>>)\s*\S", "output redirection writes a file"),
    ]
    .iter()
    .map(|(p, d)| (Regex::new(p).expect("moderate pattern"), *d))
    .collect()
});

/// Collapse whitespace runs so spacing tricks do not dodge the patterns.
fn normalize(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a chain on `;`, `&&`, `||` and `|`, ignoring separators inside
/// single or double quotes.
fn split_chain(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ';' => {
                    parts.push(std::mem::take(&mut current));
                }
                '&' | '|' => {
                    if chars.peek() == Some(&c) {
                        chars.next();
                    }
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    parts.push(current);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// Stateless command risk classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskAssessor;

impl RiskAssessor {
    pub fn new() -> Self {
        Self
    }

    /// Classify a command. Fails only on an empty command; the assessor is
    /// total otherwise.
    pub fn assess(&self, command: &str) -> Result<AssessedRisk, SafetyError> {
        let normalized = normalize(command);
        if normalized.is_empty() {
            return Err(SafetyError::EmptyCommand);
        }

        let mut worst = AssessedRisk {
            level: RiskLevel::Safe,
            reason: None,
        };
        let mut segments = split_chain(&normalized);
        // Match the whole chain too: some patterns span separators.
        segments.push(normalized.clone());

        for segment in &segments {
            let segment = segment.trim();
            let assessed = Self::assess_segment(segment);
            if assessed.level > worst.level {
                worst = assessed;
            }
            if worst.level == RiskLevel::Blocked {
                break;
            }
        }
        Ok(worst)
    }

    fn assess_segment(segment: &str) -> AssessedRisk {
        for (pattern, description) in BLOCKED_PATTERNS.iter() {
            if pattern.is_match(segment) {
                return AssessedRisk {
                    level: RiskLevel::Blocked,
                    reason: Some(description),
                };
            }
        }
        for (pattern, description) in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(segment) {
                return AssessedRisk {
                    level: RiskLevel::Dangerous,
                    reason: Some(description),
                };
            }
        }
        for (pattern, description) in MODERATE_PATTERNS.iter() {
            if pattern.is_match(segment) {
                return AssessedRisk {
                    level: RiskLevel::Moderate,
                    reason: Some(description),
                };
            }
        }
        AssessedRisk {
            level: RiskLevel::Safe,
            reason: None,
        }
    }

    /// Rewrite interactive-only commands to non-blocking equivalents the
    /// agent can observe. Returns None when the command is fine as-is.
    pub fn auto_correct(&self, command: &str) -> Option<AutoCorrection> {
        let normalized = normalize(command);
        let words = shlex::split(&normalized)?;
        let program = words.first().map(String::as_str)?;

        match program {
            "top" if words.len() == 1 => Some(AutoCorrection::Rewrite {
                corrected: "top -bn1".to_string(),
                note: "top runs full-screen; using one batch iteration".to_string(),
            }),
            "htop" => Some(AutoCorrection::Reject {
                reason: "htop is full-screen only; use `top -bn1` or `ps aux --sort=-%cpu | head` instead"
                    .to_string(),
            }),
            "apt" | "apt-get" | "yum" | "dnf"
                if words.iter().any(|w| w == "install" || w == "remove")
                    && !words.iter().any(|w| w == "-y" || w == "--yes" || w == "--assume-yes") =>
            {
                let mut corrected: Vec<String> = Vec::with_capacity(words.len() + 1);
                for w in &words {
                    corrected.push(w.clone());
                    if w == "install" || w == "remove" {
                        corrected.push("-y".to_string());
                    }
                }
                Some(AutoCorrection::Rewrite {
                    corrected: corrected.join(" "),
                    note: "added -y so the package manager does not wait for confirmation"
                        .to_string(),
                })
            }
            "ping" if !words.iter().any(|w| w == "-c" || w.starts_with("-c")) => {
                Some(AutoCorrection::Rewrite {
                    corrected: format!("ping -c 4 {}", words[1..].join(" ")).trim().to_string(),
                    note: "bounded ping to 4 packets so it terminates".to_string(),
                })
            }
            _ => None,
        }
    }
}

/// A classification plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssessedRisk {
    pub level: RiskLevel,
    pub reason: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn level(cmd: &str) -> RiskLevel {
        RiskAssessor::new().assess(cmd).unwrap().level
    }

    #[test]
    fn test_risk_level_total_order() {
        assert!(RiskLevel::Safe < RiskLevel::Moderate);
        assert!(RiskLevel::Moderate < RiskLevel::Dangerous);
        assert!(RiskLevel::Dangerous < RiskLevel::Blocked);
    }

    #[test]
    fn test_blocked_commands() {
        for cmd in [
            "rm -rf /",
            "rm -rf /*",
            "sudo rm -rf /",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|:& };:",
            "chmod -R 777 /",
            "echo x > /dev/sda",
        ] {
            assert_eq!(level(cmd), RiskLevel::Blocked, "not blocked: {}", cmd);
        }
    }

    #[test]
    fn test_dangerous_commands() {
        for cmd in [
            "rm -rf /var/log/nginx",
            "rm old.txt",
            "kill -9 1234",
            "shutdown -h now",
            "reboot",
            "systemctl restart nginx",
            "systemctl stop postgresql",
            "iptables -F",
            "userdel ops",
            "mysql -e 'DROP TABLE users'",
            "sed -i 's/a/b/' /etc/hosts",
            "mv service.conf /etc/systemd/system/",
            "mkdir /etc/nginx/conf.d",
            "rmdir /boot/old",
            "truncate -s0 /sys/kernel/something",
        ] {
            assert_eq!(level(cmd), RiskLevel::Dangerous, "not dangerous: {}", cmd);
        }
    }

    #[test]
    fn test_system_path_rule_outranks_generic_verb_rule() {
        // The same verbs stay moderate away from system paths.
        assert_eq!(level("mkdir -p build/out"), RiskLevel::Moderate);
        assert_eq!(level("truncate -s0 app.log"), RiskLevel::Moderate);
        assert_eq!(level("mkdir /etc/foo.d"), RiskLevel::Dangerous);
    }

    #[test]
    fn test_moderate_commands() {
        for cmd in [
            "mv a.txt b.txt",
            "cp -r src dst",
            "apt install curl",
            "npm install express",
            "pip install requests",
            "chmod +x run.sh",
            "chown ops:ops data/",
            "sed -i 's/a/b/' notes.txt",
            "git push origin main",
            "git reset --hard HEAD~1",
            "echo hi > out.txt",
        ] {
            assert_eq!(level(cmd), RiskLevel::Moderate, "not moderate: {}", cmd);
        }
    }

    #[test]
    fn test_safe_commands() {
        for cmd in [
            "df -h",
            "ls -la /var/log",
            "ps aux",
            "uptime",
            "cat /var/log/syslog",
            "grep error app.log",
            "git status",
            "du -sh .",
        ] {
            assert_eq!(level(cmd), RiskLevel::Safe, "not safe: {}", cmd);
        }
    }

    #[test]
    fn test_chain_takes_worst_segment() {
        assert_eq!(level("ls && rm -rf /tmp/build"), RiskLevel::Dangerous);
        assert_eq!(level("uptime; reboot"), RiskLevel::Dangerous);
        assert_eq!(level("df -h | grep sda"), RiskLevel::Safe);
        assert_eq!(level("echo ok && mkfs.ext4 /dev/sdb1"), RiskLevel::Blocked);
    }

    #[test]
    fn test_quoted_separator_not_split() {
        // The ; lives inside quotes; grep is read-only.
        assert_eq!(level("grep 'rm -rf /x;' app.log"), RiskLevel::Safe);
    }

    #[test]
    fn test_empty_command_fails() {
        assert!(RiskAssessor::new().assess("   ").is_err());
        assert!(RiskAssessor::new().assess("").is_err());
    }

    #[test]
    fn test_auto_correct_top() {
        match RiskAssessor::new().auto_correct("top") {
            Some(AutoCorrection::Rewrite { corrected, .. }) => assert_eq!(corrected, "top -bn1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_auto_correct_htop_rejected() {
        assert!(matches!(
            RiskAssessor::new().auto_correct("htop"),
            Some(AutoCorrection::Reject { .. })
        ));
    }

    #[test]
    fn test_auto_correct_apt_install() {
        match RiskAssessor::new().auto_correct("apt install nginx") {
            Some(AutoCorrection::Rewrite { corrected, .. }) => {
                assert_eq!(corrected, "apt install -y nginx")
            }
            other => panic!("unexpected: {:?}", other),
        }
        // Already non-interactive: leave alone.
        assert!(RiskAssessor::new()
            .auto_correct("apt install -y nginx")
            .is_none());
    }

    #[test]
    fn test_auto_correct_ping() {
        match RiskAssessor::new().auto_correct("ping web-1") {
            Some(AutoCorrection::Rewrite { corrected, .. }) => {
                assert_eq!(corrected, "ping -c 4 web-1")
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(RiskAssessor::new().auto_correct("ping -c 2 web-1").is_none());
    }

    #[test]
    fn test_no_correction_for_ordinary_commands() {
        assert!(RiskAssessor::new().auto_correct("df -h").is_none());
        assert!(RiskAssessor::new().auto_correct("ls -la").is_none());
    }

    proptest! {
        // The assessor is total over non-empty commands and deterministic.
        #[test]
        fn prop_assess_total_and_deterministic(cmd in "[ -~]{1,80}") {
            let assessor = RiskAssessor::new();
            match (assessor.assess(&cmd), assessor.assess(&cmd)) {
                (Ok(a), Ok(b)) => prop_assert_eq!(a.level, b.level),
                (Err(_), Err(_)) => {} // only for all-whitespace input
                _ => prop_assert!(false, "nondeterministic outcome"),
            }
        }
    }
}
