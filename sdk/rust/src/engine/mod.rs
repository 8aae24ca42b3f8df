pub mod docker;

#[cfg(test)]
pub(crate) mod fake;

use crate::connection::LogSink;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use strum::{Display, EnumString};

/// Represents different engine failure possibilities.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Failed to start the engine due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init engine; {0}")]
    FailedPrecondition(String),

    /// Failed to communicate with engine due to network error or other.
    #[error("could not connect to engine; {0}")]
    Connection(String),

    /// Container requested by name could not be found.
    #[error("container not found; {0}")]
    NoSuchContainer(String),

    /// Image requested by name could not be found or pulled.
    #[error("image not found; {0}")]
    NoSuchImage(String),

    /// A secret id was referenced that this engine session never stored.
    #[error("secret not found; {0}")]
    NoSuchSecret(String),

    /// An expected and unknown error has occurred.
    #[error("unexpected engine error occurred; {0}")]
    Unknown(String),
}

/// The value an environment variable is bound to at exec time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variable {
    Literal(String),
    /// Id of a secret previously stored with [`Engine::store_secret`]. The engine resolves it.
    Secret(String),
}

/// Private registries sometimes require authentication. The password is always a stored secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server: String,
    pub user: String,
    pub secret_id: String,
}

#[derive(Debug, Clone)]
pub struct StartContainerRequest {
    /// A unique identifier to identify the container with.
    pub name: String,
    /// The image repository and image name; tag or digest can be included.
    pub image: String,
    /// Target platform in `os/arch[/variant]` form. None means the engine's default.
    pub platform: Option<String>,
    /// Registry authentication details.
    pub registry_auth: Option<RegistryAuth>,
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Name of a container previously started with [`Engine::start_container`].
    pub container: String,
    /// Argument vector; the first element is the executable.
    pub command: Vec<String>,
    /// Ordered environment bindings for this exec.
    pub variables: Vec<(String, Variable)>,
    pub workdir: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResponse {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// The engine trait defines what the interface between a connection and a container engine should look like.
/// Each connection owns its own engine instance, so nothing stored here is shared between sessions.
#[async_trait]
pub trait Engine: Debug + Send + Sync {
    /// Returns the engine's version; doubles as a check that the engine is reachable.
    async fn version(&self) -> Result<String, EngineError>;

    /// Hand the plaintext of a secret to the engine. This is the only time the value crosses the boundary.
    async fn store_secret(&self, id: &str, value: SecretString) -> Result<(), EngineError>;

    /// Start a container based on details passed; Should implement automatically pulling and registry auth
    /// of the image if necessary. The container must stay alive until removed so that execs share its state.
    async fn start_container(&self, req: StartContainerRequest) -> Result<(), EngineError>;

    /// Run a single command inside a started container and wait for it to exit.
    async fn exec(&self, req: ExecRequest) -> Result<ExecResponse, EngineError>;

    /// Kill and remove a container along with any state it accumulated.
    async fn remove_container(&self, name: &str) -> Result<(), EngineError>;

    /// Release everything the session stored, secrets included.
    async fn close(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")] // This handles case insensitivity during deserialization
#[strum(serialize_all = "snake_case")]
pub enum Kind {
    #[default]
    Docker,
}

pub async fn new(
    config: &crate::connection::Config,
    log: LogSink,
) -> Result<Arc<dyn Engine>, EngineError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Kind::Docker => {
            let Some(docker_config) = &config.docker else {
                return Err(EngineError::FailedPrecondition(
                    "docker engine settings not found in config".into(),
                ));
            };

            let engine = docker::Engine::new(docker_config, log).await?;
            Ok(Arc::new(engine))
        }
    }
}
