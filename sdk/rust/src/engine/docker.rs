use super::{
    EngineError, ExecRequest, ExecResponse, RegistryAuth, StartContainerRequest, Variable,
};
use crate::connection::LogSink;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::ImageInspect;
use dashmap::{DashMap, DashSet};
use futures::stream::{StreamExt, TryStreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

fn format_env_var(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// Docker reports some architectures under their kernel names.
fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x86-64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Whether a cached image was built for `platform` (`os/arch[/variant]`). A variant is only compared when one
/// was asked for.
fn platform_matches(platform: &str, image: &ImageInspect) -> bool {
    let mut parts = platform.split('/');
    let (Some(os), Some(arch)) = (parts.next(), parts.next()) else {
        return false;
    };
    let variant = parts.next();

    if image.os.as_deref() != Some(os) {
        return false;
    }

    if image.architecture.as_deref().map(normalize_arch) != Some(normalize_arch(arch)) {
        return false;
    }

    match variant {
        Some(variant) => image.variant.as_deref() == Some(variant),
        None => true,
    }
}

/// Decides whether the image has to be pulled before a container can be created from it.
fn needs_pull(always_pull: bool, local: Option<&ImageInspect>, platform: Option<&str>) -> bool {
    if always_pull {
        return true;
    }

    match (local, platform) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(image), Some(platform)) => !platform_matches(platform, image),
    }
}

/// How many times an exec is inspected for its exit code before giving up.
const EXEC_INSPECT_ATTEMPTS: u32 = 20;
const EXEC_INSPECT_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, PartialEq, Eq)]
enum ExecState {
    Exited(i64),
    Running,
}

/// The daemon records an exec's exit asynchronously, so the attach stream can close before the exit code is
/// visible.
fn exec_state(running: Option<bool>, exit_code: Option<i64>) -> ExecState {
    match (running, exit_code) {
        (Some(true), _) | (_, None) => ExecState::Running,
        (_, Some(code)) => ExecState::Exited(code),
    }
}

/// Folds every container that could not be removed into one error.
fn cleanup_result(failures: Vec<(String, EngineError)>) -> Result<(), EngineError> {
    if failures.is_empty() {
        return Ok(());
    }

    let details: Vec<String> = failures
        .iter()
        .map(|(name, e)| format!("{name}: {e}"))
        .collect();

    Err(EngineError::Unknown(format!(
        "could not remove {} container(s) on close; {}",
        failures.len(),
        details.join(", ")
    )))
}

fn default_keepalive() -> Vec<String> {
    vec!["tail".into(), "-f".into(), "/dev/null".into()]
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The total amount of time any request is allowed to be pending for in seconds.
    pub timeout: u64,

    /// Path to the docker daemon socket. Omit to use the platform default.
    #[serde(default)]
    pub socket: Option<String>,

    /// Attempt to pull the image from the upstream repository even if it exists already locally.
    /// This is useful if your images don't use proper tagging or versioning.
    #[serde(default)]
    pub always_pull: bool,

    /// Replaces the container's entrypoint so it stays up while commands are exec'd into it.
    #[serde(default = "default_keepalive")]
    pub keepalive: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: 120,
            socket: None,
            always_pull: false,
            keepalive: default_keepalive(),
        }
    }
}

#[derive(Debug)]
pub struct Engine {
    client: bollard::Docker,
    config: Config,
    log: LogSink,
    /// Secret material for this session, keyed by handle id. Values never leave this map except as exec
    /// environment.
    secrets: DashMap<String, SecretString>,
    /// Containers started by this session that haven't been removed yet.
    containers: DashSet<String>,
}

impl Engine {
    #[instrument(skip(log), fields(origin = "engine::docker"))]
    pub async fn new(config: &Config, log: LogSink) -> Result<Self, EngineError> {
        let config = config.clone();

        let client = match &config.socket {
            Some(socket) => bollard::Docker::connect_with_socket(
                socket,
                config.timeout,
                bollard::API_DEFAULT_VERSION,
            ),
            None => bollard::Docker::connect_with_socket_defaults(),
        }
        .map_err(|e| {
            EngineError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;
        let client = client.with_timeout(Duration::from_secs(config.timeout));

        debug!("Local docker engine client created");

        Ok(Self {
            client,
            config,
            log,
            secrets: DashMap::new(),
            containers: DashSet::new(),
        })
    }

    fn secret(&self, id: &str) -> Result<SecretString, EngineError> {
        self.secrets
            .get(id)
            .map(|secret| SecretString::new(secret.expose_secret().clone()))
            .ok_or_else(|| EngineError::NoSuchSecret(id.to_string()))
    }

    fn credentials(
        &self,
        auth: &Option<RegistryAuth>,
    ) -> Result<Option<bollard::auth::DockerCredentials>, EngineError> {
        let Some(auth) = auth else {
            return Ok(None);
        };

        let password = self.secret(&auth.secret_id)?;

        Ok(Some(bollard::auth::DockerCredentials {
            username: Some(auth.user.clone()),
            password: Some(password.expose_secret().clone()),
            serveraddress: Some(auth.server.clone()),
            ..Default::default()
        }))
    }

    async fn pull_image(
        &self,
        image: &str,
        platform: &Option<String>,
        credentials: Option<bollard::auth::DockerCredentials>,
    ) -> Result<(), EngineError> {
        self.log.line(format!("pulling image {image}"));

        let mut pull = Box::pin(self.client.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image.to_string(),
                platform: platform.clone().unwrap_or_default(),
                ..Default::default()
            }),
            None,
            credentials,
        ));

        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(|e| EngineError::NoSuchImage(format!("{image}; {e}")))?;

            if let Some(status) = progress.status {
                match progress.id {
                    Some(layer) => self.log.line(format!("{image}: {layer}: {status}")),
                    None => self.log.line(format!("{image}: {status}")),
                }
            }
        }

        Ok(())
    }

    /// Returns the locally cached image, if there is one.
    async fn local_image(&self, image: &str) -> Result<Option<ImageInspect>, EngineError> {
        match self.client.inspect_image(image).await {
            Ok(inspection) => Ok(Some(inspection)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(EngineError::Connection(e.to_string())),
        }
    }

    async fn exit_code(&self, exec_id: &str) -> Result<i64, EngineError> {
        for attempt in 1..=EXEC_INSPECT_ATTEMPTS {
            let inspection = self
                .client
                .inspect_exec(exec_id)
                .await
                .map_err(|e| EngineError::Unknown(format!("could not inspect exec; {e}")))?;

            match exec_state(inspection.running, inspection.exit_code) {
                ExecState::Exited(code) => return Ok(code),
                ExecState::Running => {
                    trace!(exec_id, attempt, "exec has not reported an exit code yet");
                    tokio::time::sleep(EXEC_INSPECT_INTERVAL).await;
                }
            }
        }

        Err(EngineError::Unknown(
            "exec finished without an exit code".into(),
        ))
    }

    fn resolve_variables(&self, variables: &[(String, Variable)]) -> Result<Vec<String>, EngineError> {
        variables
            .iter()
            .map(|(key, value)| match value {
                Variable::Literal(value) => Ok(format_env_var(key, value)),
                Variable::Secret(id) => {
                    let secret = self.secret(id)?;
                    Ok(format_env_var(key, secret.expose_secret()))
                }
            })
            .collect()
    }
}

#[async_trait]
impl super::Engine for Engine {
    async fn version(&self) -> Result<String, EngineError> {
        let version = self.client.version().await.map_err(|e| {
            EngineError::Connection(format!(
                "{}; Make sure the Docker daemon is installed and running.",
                e
            ))
        })?;

        Ok(version.version.unwrap_or_default())
    }

    async fn store_secret(&self, id: &str, value: SecretString) -> Result<(), EngineError> {
        self.secrets.insert(id.to_string(), value);
        trace!(secret_id = %id, "Stored secret");
        Ok(())
    }

    #[instrument(skip(self), fields(origin = "engine::docker"))]
    async fn start_container(&self, request: StartContainerRequest) -> Result<(), EngineError> {
        let credentials = self.credentials(&request.registry_auth)?;

        let local = self.local_image(&request.image).await?;

        if needs_pull(
            self.config.always_pull,
            local.as_ref(),
            request.platform.as_deref(),
        ) {
            self.pull_image(&request.image, &request.platform, credentials)
                .await?;
        }

        // We attempt to remove the container as a first step to running it. This enables us to reuse a
        // container name without the error that a container with that name already exists.
        if let Err(e) = self
            .client
            .remove_container(
                &request.name,
                Some(bollard::container::RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            trace!(container_name = %request.name, err = ?e, "could not remove previous container");
        }

        let container_config = bollard::container::Config {
            image: Some(request.image.clone()),
            entrypoint: Some(self.config.keepalive.clone()),
            labels: Some(HashMap::from([(
                "sealpipe.managed".to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        };

        self.client
            .create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: request.name.as_str(),
                    platform: request.platform.as_deref(),
                }),
                container_config,
            )
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;

        self.containers.insert(request.name.clone());

        self.client
            .start_container::<String>(&request.name, None)
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;

        debug!(container_name = %request.name, "Started container");

        Ok(())
    }

    #[instrument(skip(self, request), fields(origin = "engine::docker", container = %request.container))]
    async fn exec(&self, request: ExecRequest) -> Result<ExecResponse, EngineError> {
        let env = self.resolve_variables(&request.variables)?;

        let create_exec_options = CreateExecOptions::<String> {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            env: Some(env),
            cmd: Some(request.command),
            working_dir: request.workdir,
            user: request.user,
            ..Default::default()
        };

        let created = self
            .client
            .create_exec(&request.container, create_exec_options)
            .await
            .map_err(|e| EngineError::NoSuchContainer(format!("{}; {e}", request.container)))?;

        let start_exec_options = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let results = self
            .client
            .start_exec(&created.id, Some(start_exec_options))
            .await
            .map_err(|e| EngineError::Unknown(format!("could not start exec; {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match results {
            StartExecResults::Attached { output, .. } => {
                let mut output =
                    output.map_err(|e| EngineError::Connection(format!("exec output lost; {e}")));

                while let Some(log) = output.try_next().await? {
                    match log {
                        LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::Unknown(
                    "Could not properly attach to exec".into(),
                ))
            }
        }

        let exit_code = self.exit_code(&created.id).await?;

        Ok(ExecResponse {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        self.client
            .remove_container(
                name,
                Some(bollard::container::RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| EngineError::NoSuchContainer(format!("{name}; {e}")))?;

        self.containers.remove(name);
        debug!(container_name = %name, "Removed container");

        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.secrets.clear();

        let leftover: Vec<String> = self.containers.iter().map(|name| name.key().clone()).collect();
        let mut failures = vec![];

        for name in leftover {
            if let Err(e) = super::Engine::remove_container(self, &name).await {
                warn!(container_name = %name, err = %e, "could not remove container on close");
                failures.push((name, e));
            }
        }

        cleanup_result(failures)
    }
}
