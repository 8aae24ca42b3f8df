use crate::connection::Connection;
use crate::container::{Container, EnvValue};
use crate::engine::{self, Engine, ExecRequest, StartContainerRequest, Variable};
use crate::PipelineError;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// What a finished container run produced. Output is always that of the last command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Removes a started container when dropped. Covers runs abandoned mid-flight by a timeout or a dropped future.
struct ContainerGuard {
    engine: Arc<dyn Engine>,
    name: Option<String>,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn Engine>, name: &str) -> Self {
        Self {
            engine,
            name: Some(name.to_string()),
        }
    }

    async fn release(mut self) {
        if let Some(name) = self.name.take() {
            if let Err(e) = self.engine.remove_container(&name).await {
                error!(container_name = %name, err = %e, "could not remove container");
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };

        let engine = self.engine.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = engine.remove_container(&name).await {
                        error!(container_name = %name, err = %e, "could not remove abandoned container");
                    }
                });
            }
            Err(_) => {
                error!(
                    container_name = %name,
                    "no runtime available to remove abandoned container"
                );
            }
        }
    }
}

fn engine_variables(container: &Container) -> Vec<(String, Variable)> {
    container
        .variables
        .iter()
        .map(|binding| {
            let value = match &binding.value {
                EnvValue::Literal(value) => Variable::Literal(value.clone()),
                EnvValue::Secret(handle) => Variable::Secret(handle.id().to_string()),
            };
            (binding.name.clone(), value)
        })
        .collect()
}

impl Connection {
    /// Submit a container to the engine and wait for every command in it to finish.
    ///
    /// Commands run in order; the first one to exit non-zero stops the run and is reported as
    /// [`PipelineError::CommandExecution`]. Nothing is retried.
    #[instrument(skip(self, container), fields(session = %self.id()))]
    pub async fn run(&self, container: &Container) -> Result<ExecutionResult, PipelineError> {
        self.ensure_open()?;

        if container.conn.id() != self.id() {
            return Err(PipelineError::InvalidHandle(format!(
                "container was built on connection {} not {}",
                container.conn.id(),
                self.id()
            )));
        }

        for binding in &container.variables {
            if let EnvValue::Secret(handle) = &binding.value {
                handle.check_owner(self)?;
            }
        }

        if let Some(auth) = &container.registry_auth {
            auth.secret.check_owner(self)?;
        }

        container.validate()?;

        let _channel = self.inner.channel.lock().await;
        self.ensure_open()?;

        match self.inner.config.run_timeout_duration() {
            Some(timeout) => tokio::time::timeout(timeout, self.execute(container))
                .await
                .map_err(|_| PipelineError::Timeout(timeout))?,
            None => self.execute(container).await,
        }
    }

    async fn execute(&self, container: &Container) -> Result<ExecutionResult, PipelineError> {
        let engine = self.inner.engine.clone();
        let log = &self.inner.log;
        let image = container.validate()?;
        let name = format!("sealpipe-{}", Uuid::now_v7());

        log.line(format!("starting container from {image}"));

        engine
            .start_container(StartContainerRequest {
                name: name.clone(),
                image: image.to_string(),
                platform: container.platform.as_ref().map(ToString::to_string),
                registry_auth: container
                    .registry_auth
                    .as_ref()
                    .map(|auth| engine::RegistryAuth {
                        server: auth.address.clone(),
                        user: auth.username.clone(),
                        secret_id: auth.secret.id().to_string(),
                    }),
            })
            .await?;

        let guard = ContainerGuard::new(engine.clone(), &name);
        let variables = engine_variables(container);
        let total = container.commands.len();
        let mut last = None;

        for (index, command) in container.commands.iter().enumerate() {
            log.line(format!("[{}/{total}] exec {}", index + 1, command.join(" ")));
            debug!(container_name = %name, index, "Executing command");

            let response = match engine
                .exec(ExecRequest {
                    container: name.clone(),
                    command: command.clone(),
                    variables: variables.clone(),
                    workdir: container.workdir.clone(),
                    user: container.user.clone(),
                })
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    guard.release().await;
                    return Err(e.into());
                }
            };

            if response.exit_code != 0 {
                log.line(format!(
                    "[{}/{total}] exited with status {}",
                    index + 1,
                    response.exit_code
                ));
                guard.release().await;

                return Err(PipelineError::CommandExecution {
                    index,
                    exit_code: response.exit_code,
                    stderr: response.stderr,
                });
            }

            last = Some(response);
        }

        guard.release().await;

        let last = last.ok_or_else(|| {
            PipelineError::PlanValidation("no commands to run; add at least one with with_exec".into())
        })?;

        info!(container_name = %name, commands = total, "Container run complete");

        Ok(ExecutionResult {
            stdout: last.stdout,
            stderr: last.stderr,
            exit_code: last.exit_code,
        })
    }
}

impl Container {
    /// Run the container and return the standard output of its last command.
    pub async fn stdout(&self) -> Result<String, PipelineError> {
        self.conn.run(self).await.map(|result| result.stdout)
    }

    /// Run the container and return the standard error of its last command.
    pub async fn stderr(&self) -> Result<String, PipelineError> {
        self.conn.run(self).await.map(|result| result.stderr)
    }

    /// Run the container for its side effects only.
    pub async fn sync(&self) -> Result<(), PipelineError> {
        self.conn.run(self).await.map(|_| ())
    }
}
