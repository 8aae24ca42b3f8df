use crate::conf;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use sealpipe_sdk::{with_connection, Connection, Container, PipelineError};
use tracing::{debug, instrument};

/// Builds the container described by the pipeline section on `client`, exposing `secret` as the configured
/// variable.
fn build(
    client: &Connection,
    pipeline: &conf::Pipeline,
    secret: &sealpipe_sdk::SecretHandle,
) -> Result<Container, PipelineError> {
    let mut container = client.container();

    if let Some(platform) = &pipeline.platform {
        container = container.with_platform(platform)?;
    }

    container = container
        .from_image(&pipeline.image)?
        .with_secret_variable(&pipeline.variable, secret)?;

    for command in &pipeline.commands {
        container = container.with_exec(command.iter().map(String::as_str))?;
    }

    Ok(container)
}

/// Runs the configured pipeline and returns the stdout of its last command.
#[instrument(skip(config), fields(image = %config.pipeline.image))]
pub async fn run(config: &conf::Config) -> Result<String> {
    let pipeline = config.pipeline.clone();

    if pipeline.commands.is_empty() {
        bail!("no commands configured; set pipeline.commands");
    }

    let value = std::env::var(&pipeline.secret_source).with_context(|| {
        format!(
            "Could not read secret '{}' from environment variable {}",
            pipeline.secret_name,
            pipeline.secret_source.cyan()
        )
    })?;

    debug!(
        secret_name = %pipeline.secret_name,
        commands = pipeline.commands.len(),
        "Starting pipeline"
    );

    let output = with_connection(config.connection.clone(), |client| async move {
        let secret = client.set_secret(&pipeline.secret_name, value).await?;
        let container = build(&client, &pipeline, &secret)?;

        debug!(plan = %container.describe()?, "Submitting container");

        container.stdout().await
    })
    .await
    .map_err(|e| {
        let context = match &e {
            PipelineError::CommandExecution {
                index, exit_code, ..
            } => format!(
                "Pipeline command {} of {} failed with exit status {exit_code}",
                index + 1,
                config.pipeline.commands.len()
            ),
            _ => "Pipeline failed".to_string(),
        };

        anyhow::Error::new(e).context(context)
    })?;

    Ok(output)
}
