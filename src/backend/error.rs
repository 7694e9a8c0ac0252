//! Error types for the tiering control plane.
//!
//! Failures fall into three groups:
//!
//! - [`CodegenError`]: anything that goes wrong between dispatching a work item
//!   and installing its result. Always recovered internally (rollback or a
//!   replacement entry point) and never visible to script.
//! - [`ScriptError`]: the only script-visible conditions, raised when a
//!   redeferred function has to be reparsed.
//! - [`EntryPointError`] / [`ConfigError`]: misuse of the API surface.

use std::fmt;

use super::entry_point::EntryPointState;

// =============================================================================
// CodegenError
// =============================================================================

/// Failure while compiling, recording or installing native code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// Allocation failed (code heap, guard registry, cache arrays)
    OutOfMemory,

    /// Backend ran out of native stack
    StackOverflow,

    /// Work item was cancelled before it completed
    Aborted,

    /// Per-engine JIT limit reached; the entry point stays interpreted
    ExceedJitLimit,

    /// Native code could not be installed
    InstallFailure(String),

    /// Backend-specific failure
    Backend(String),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::OutOfMemory => write!(f, "Out of memory during code generation"),
            CodegenError::StackOverflow => write!(f, "Stack overflow during code generation"),
            CodegenError::Aborted => write!(f, "Code generation aborted"),
            CodegenError::ExceedJitLimit => write!(f, "JIT limit exceeded"),
            CodegenError::InstallFailure(msg) => write!(f, "Install failure: {}", msg),
            CodegenError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for CodegenError {}

/// Result type for code generation and installation
pub type CodegenResult<T> = Result<T, CodegenError>;

// =============================================================================
// EntryPointError
// =============================================================================

/// Misuse of an entry point handle or an illegal lifecycle edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointError {
    /// The handle refers to an entry point that has been freed
    StaleHandle,

    /// The requested transition is not allowed from the current state
    InvalidTransition {
        from: EntryPointState,
        to: EntryPointState,
    },

    /// The handle refers to a function that has been removed
    UnknownFunction,

    /// The function has no loop with this number
    UnknownLoop(u32),

    /// The function has no byte code to compile
    NotParsed,

    /// The compile queue is gone
    QueueClosed,
}

impl fmt::Display for EntryPointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryPointError::StaleHandle => write!(f, "Stale entry point handle"),
            EntryPointError::InvalidTransition { from, to } => {
                write!(f, "Invalid entry point transition: {:?} -> {:?}", from, to)
            }
            EntryPointError::UnknownFunction => write!(f, "Unknown function"),
            EntryPointError::UnknownLoop(n) => write!(f, "Unknown loop {}", n),
            EntryPointError::NotParsed => write!(f, "Function has no byte code"),
            EntryPointError::QueueClosed => write!(f, "Compile queue closed"),
        }
    }
}

impl std::error::Error for EntryPointError {}

// =============================================================================
// ScriptError / ParseError
// =============================================================================

/// Error produced by the external bytecode generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    OutOfMemory,
    StackOverflow,
    Syntax(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::OutOfMemory => write!(f, "Out of memory while parsing"),
            ParseError::StackOverflow => write!(f, "Stack overflow while parsing"),
            ParseError::Syntax(msg) => write!(f, "Syntax error: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

/// Condition surfaced to script code
///
/// Only reparse of a redeferred function can produce these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    OutOfMemory,
    StackOverflow,
    SyntaxError(String),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::OutOfMemory => write!(f, "Out of memory"),
            ScriptError::StackOverflow => write!(f, "Out of stack space"),
            ScriptError::SyntaxError(msg) => write!(f, "SyntaxError: {}", msg),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<ParseError> for ScriptError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::OutOfMemory => ScriptError::OutOfMemory,
            ParseError::StackOverflow => ScriptError::StackOverflow,
            ParseError::Syntax(msg) => ScriptError::SyntaxError(msg),
        }
    }
}

impl From<CodegenError> for ScriptError {
    fn from(err: CodegenError) -> Self {
        match err {
            CodegenError::StackOverflow => ScriptError::StackOverflow,
            _ => ScriptError::OutOfMemory,
        }
    }
}

/// Result type for script-visible operations
pub type ScriptResult<T> = Result<T, ScriptError>;

// =============================================================================
// EngineError
// =============================================================================

/// Any failure surfaced by an [`Engine`](super::engine::Engine) call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    EntryPoint(EntryPointError),
    Script(ScriptError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::EntryPoint(e) => write!(f, "{}", e),
            EngineError::Script(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::EntryPoint(e) => Some(e),
            EngineError::Script(e) => Some(e),
        }
    }
}

impl From<EntryPointError> for EngineError {
    fn from(e: EntryPointError) -> Self {
        EngineError::EntryPoint(e)
    }
}

impl From<ScriptError> for EngineError {
    fn from(e: ScriptError) -> Self {
        EngineError::Script(e)
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// ConfigError
// =============================================================================

/// Error loading or validating a [`TieringConfig`](super::config::TieringConfig)
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_maps_to_script_error() {
        assert_eq!(ScriptError::from(ParseError::OutOfMemory), ScriptError::OutOfMemory);
        assert_eq!(
            ScriptError::from(ParseError::StackOverflow),
            ScriptError::StackOverflow
        );
        assert_eq!(
            ScriptError::from(CodegenError::Backend("layout".into())),
            ScriptError::OutOfMemory
        );
    }

    #[test]
    fn test_engine_error_wraps() {
        let err: EngineError = EntryPointError::StaleHandle.into();
        assert_eq!(err.to_string(), "Stale entry point handle");
        let err: EngineError = ScriptError::StackOverflow.into();
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_display() {
        let err = EntryPointError::InvalidTransition {
            from: EntryPointState::NotScheduled,
            to: EntryPointState::CodeGenDone,
        };
        assert_eq!(
            err.to_string(),
            "Invalid entry point transition: NotScheduled -> CodeGenDone"
        );
        assert_eq!(
            CodegenError::InstallFailure("guards".into()).to_string(),
            "Install failure: guards"
        );
    }
}
