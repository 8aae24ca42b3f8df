//! The sealpipe SDK registers secrets with a container engine and runs ordered command sequences inside a
//! container that can read those secrets as environment variables.
//!
//! ```ignore
//! use sealpipe_sdk::{with_connection, Config, PipelineError};
//!
//! let out = with_connection(Config::default(), |client| async move {
//!     let secret = client.set_secret("ghApiToken", "TOKEN").await?;
//!
//!     client
//!         .container()
//!         .with_platform("linux/amd64")?
//!         .from_image("alpine:3.17")?
//!         .with_secret_variable("GITHUB_API_TOKEN", &secret)?
//!         .with_exec(["apk", "add", "curl"])?
//!         .with_exec(["sh", "-c", "echo $GITHUB_API_TOKEN"])?
//!         .stdout()
//!         .await
//! })
//! .await?;
//! ```
pub mod connection;
pub mod container;
pub mod engine;
pub mod executor;
pub mod secret;


pub use connection::{with_connection, Config, Connection, LogOutput, LogSink};
pub use container::{Container, EnvBinding, EnvValue, Platform, RegistryAuth};
pub use executor::ExecutionResult;
pub use secret::SecretHandle;

use engine::EngineError;
use lazy_regex::regex;
use std::time::Duration;

/// How much of a failing command's stderr is carried in the error's display message.
const STDERR_EXCERPT_LEN: usize = 2048;

/// Represents the different ways a pipeline can fail. Every error surfaces to the immediate caller; none are
/// retried internally.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The session with the engine could not be established.
    #[error("could not connect to engine; {0}")]
    Connection(String),

    /// The connection was already closed when the operation was attempted.
    #[error("connection is closed; no further operations are allowed")]
    UseAfterClose,

    #[error("secret '{0}' is already registered in this session")]
    DuplicateSecret(String),

    /// A handle or plan was used against a connection it does not belong to.
    #[error("invalid handle; {0}")]
    InvalidHandle(String),

    #[error("invalid image reference '{0}'")]
    InvalidImageRef(String),

    #[error("invalid {argument}: '{value}'; {description}")]
    InvalidArgument {
        argument: String,
        value: String,
        description: String,
    },

    /// The plan is incomplete and was never submitted to the engine.
    #[error("plan is invalid; {0}")]
    PlanValidation(String),

    /// A command in the sequence exited non-zero. Commands after `index` were not run.
    #[error("command {index} exited with status {exit_code}; stderr: {}", stderr_excerpt(.stderr))]
    CommandExecution {
        index: usize,
        exit_code: i64,
        stderr: String,
    },

    #[error("engine unavailable; {0}")]
    EngineUnavailable(String),

    #[error("run did not complete within {0:?}")]
    Timeout(Duration),

    #[error("engine error; {0}")]
    Engine(EngineError),

    #[error("unexpected error occurred; {0}")]
    Unknown(String),
}

impl From<EngineError> for PipelineError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Connection(msg) => PipelineError::EngineUnavailable(msg),
            other => PipelineError::Engine(other),
        }
    }
}

/// Returns the tail of a command's stderr, bounded so a noisy command can't flood the error message.
fn stderr_excerpt(stderr: &str) -> &str {
    let trimmed = stderr.trim_end();
    if trimmed.len() <= STDERR_EXCERPT_LEN {
        return trimmed;
    }

    let mut start = trimmed.len() - STDERR_EXCERPT_LEN;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }

    &trimmed[start..]
}

/// Environment variable names follow the POSIX portable character set so they survive every shell the
/// container might run.
fn validate_env_name(value: &str) -> Result<(), PipelineError> {
    let env_name = regex!("^[A-Za-z_][A-Za-z0-9_]*$");

    if !env_name.is_match(value) {
        return Err(PipelineError::InvalidArgument {
            argument: "env_name".to_string(),
            value: value.to_string(),
            description: "must start with a letter or underscore and contain only alphanumerics or underscores"
                .to_string(),
        });
    }

    Ok(())
}

fn validate_non_empty(arg: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::InvalidArgument {
            argument: arg.to_string(),
            value: value.to_string(),
            description: "cannot be empty".to_string(),
        });
    }

    Ok(())
}
