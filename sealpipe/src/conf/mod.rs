use anyhow::{anyhow, bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

#[derive(RustEmbed)]
#[folder = "src/conf/"]
struct EmbeddedConfigFS;

const DEFAULT_CONFIG: &str = "default_config.toml";
const ENV_PREFIX: &str = "SEALPIPE_";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub connection: sealpipe_sdk::Config,
    pub pipeline: Pipeline,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct General {
    /// Any filter `tracing_subscriber::EnvFilter` understands, e.g. `warn` or `sealpipe_sdk=debug`.
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub image: String,
    pub platform: Option<String>,
    /// Name the secret is registered under.
    pub secret_name: String,
    /// Host environment variable the secret's value is read from.
    pub secret_source: String,
    /// Container environment variable the secret is exposed as.
    pub variable: String,
    /// Commands run in order inside the container.
    pub commands: Vec<Vec<String>>,
}

/// returns the embedded default configuration file.
fn default_config() -> Result<String> {
    let file = EmbeddedConfigFS::get(DEFAULT_CONFIG)
        .ok_or_else(|| anyhow!("embedded default configuration '{DEFAULT_CONFIG}' missing"))?;

    Ok(String::from_utf8(file.data.to_vec())?)
}

/// returns the default configuration paths that are searched in case user does not specify.
fn config_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return vec![];
    };

    vec![
        home.join(".sealpipe.toml"),
        home.join(".config").join("sealpipe.toml"),
    ]
}

/// Layers configuration sources in priority order: embedded defaults, then configuration files, then
/// environment variables. Later sources overwrite any conflicting keys from earlier ones.
fn layered(path_override: Option<&Path>) -> Result<Figment> {
    let mut figment = Figment::new().merge(Toml::string(&default_config()?));

    match path_override {
        Some(path) => {
            if !path.exists() {
                bail!("configuration file '{}' does not exist", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            for path in config_paths() {
                figment = figment.merge(Toml::file(path));
            }
        }
    }

    // Lastly env vars always override everything.
    Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// returns a correctly deserialized config struct from the configuration files and environment.
pub fn parse(path_override: Option<&Path>) -> Result<Config> {
    layered(path_override)?
        .extract::<Config>()
        .context("Could not parse configuration")
}
