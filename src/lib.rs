//! ShellPilot - an AI operations agent for terminals
//!
//! An agent engine that accomplishes natural-language ops tasks by driving
//! a terminal through an LLM ReAct loop:
//!
//! - **Risk gating**: every shell command is classified (safe / moderate /
//!   dangerous / blocked) before a byte reaches the terminal
//! - **Terminal awareness**: idle / running / waiting-input / may-be-stuck
//!   classification from the live output buffer
//! - **Planning**: dynamic step plans with retries and strategy switches
//! - **Reflection**: loop and failure detection with corrective prompts
//! - **Orchestration**: a master agent fanning sub-tasks out to per-host
//!   worker agents
//!
//! # Quick Start
//!
//! ```ignore
//! use shellpilot::{AgentEngine, Config};
//!
//! let config = Config::load(None)?;
//! let client = std::sync::Arc::new(shellpilot::api::ApiClient::new(&config)?);
//! let engine = AgentEngine::new(client, config);
//! let run = engine.run_task("show disk usage", &ctx, &confirmations).await;
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod history;
pub mod i18n;
pub mod knowledge;
pub mod mcp;
pub mod orchestrator;
pub mod output;
pub mod planner;
pub mod prompt;
pub mod reflection;
pub mod safety;
pub mod terminal;
pub mod token_count;
pub mod tools;

pub use config::{Config, ExecutionMode, Language};
pub use engine::{AgentEngine, AgentRun, RunStatus};
pub use errors::{Result, ShellPilotError};
pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use safety::{RiskAssessor, RiskLevel};
