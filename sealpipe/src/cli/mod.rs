mod pipeline;

use crate::conf::{self, LogFormat};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sealpipe")]
#[command(about = "sealpipe runs commands in a container with a secret exposed as an environment variable.")]
#[command(
    long_about = "sealpipe runs commands in a container with a secret exposed as an environment variable.\n\n\
    It registers a secret read from the host environment with the container engine, starts the configured \
    image, runs each configured command in order inside the same container and prints what the last one wrote \
    to stdout. The secret's value is never written to logs or to the plan description."
)]
#[command(version = concat!(env!("BUILD_SEMVER"), " (", env!("BUILD_COMMIT"), ")"))]
pub struct Cli {
    /// Set configuration path; if empty default paths are used
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Base image reference, e.g. alpine:3.17; overrides configuration.
    #[arg(long)]
    image: Option<String>,

    /// Target platform in os/arch form, e.g. linux/amd64; overrides configuration.
    #[arg(long)]
    platform: Option<String>,
}

impl Cli {
    /// Flags always get final priority over all other configuration types.
    fn apply_overrides(&self, config: &mut conf::Config) {
        if let Some(image) = &self.image {
            config.pipeline.image = image.clone();
        }

        if let Some(platform) = &self.platform {
            config.pipeline.platform = Some(platform.clone());
        }
    }
}

fn init_logging(general: &conf::General) -> Result<()> {
    let filter = EnvFilter::try_new(&general.log_level)
        .with_context(|| format!("could not parse log_level '{}'", general.log_level))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match general.log_format {
        LogFormat::Pretty => subscriber.compact().try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };

    result.map_err(|e| anyhow!("could not init logging; {e}"))
}

/// init the CLI and run the configured pipeline.
pub async fn init() -> Result<()> {
    let args = Cli::parse();

    let mut config = conf::parse(args.config_path.as_deref())?;
    args.apply_overrides(&mut config);

    init_logging(&config.general)?;

    let output = pipeline::run(&config).await?;

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output.as_bytes())
        .and_then(|_| stdout.flush())
        .context("Could not write pipeline output")?;

    Ok(())
}
