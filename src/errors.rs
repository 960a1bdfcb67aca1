use thiserror::Error;

/// The central error type for the ShellPilot system.
///
/// This hierarchy enables programmatic recovery and unified error handling
/// across engine, API, tools, safety, and terminal layers.
#[derive(Error, Debug)]
pub enum ShellPilotError {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Safety error: {0}")]
    Safety(#[from] SafetyError),

    #[error("Terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Tool call limit reached ({limit})")]
    ToolCallLimit { limit: usize },

    #[error("Run timed out after {seconds} seconds")]
    RunTimeout { seconds: u64 },

    #[error("Task aborted")]
    Aborted,

    #[error("A confirmation is already pending for this run")]
    ConfirmationAlreadyPending,

    #[error("Terminal '{terminal_id}' is already bound to run {owner}")]
    TerminalBusy { terminal_id: String, owner: String },

    #[error("Agent loop panicked: {0}")]
    Panic(String),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("API request timed out")]
    Timeout,

    #[error("Rate limit exceeded. Retry after {retry_after_secs:?} seconds")]
    RateLimit { retry_after_secs: Option<u64> },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("API returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Failed to parse API response: {0}")]
    Parse(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool '{name}' failed: {message}")]
    Execution { name: String, message: String },

    #[error("Tool '{name}' not found")]
    NotFound { name: String },

    #[error("Invalid arguments for tool '{name}': {message}")]
    InvalidArguments { name: String, message: String },

    #[error("Tool execution timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Command blocked: {command} ({reason})")]
    BlockedCommand { command: String, reason: String },

    #[error("Command rejected by user: {command}")]
    RejectedByUser { command: String },

    #[error("Empty command")]
    EmptyCommand,
}

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("Terminal '{0}' not found")]
    NotFound(String),

    #[error("Terminal session dropped: {0}")]
    SessionDropped(String),

    #[error("Failed to spawn shell: {0}")]
    Spawn(String),

    #[error("Write to terminal failed: {0}")]
    Write(String),
}

pub type Result<T> = std::result::Result<T, ShellPilotError>;
