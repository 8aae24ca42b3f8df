use crate::connection::Connection;
use crate::secret::SecretHandle;
use crate::{validate_env_name, validate_non_empty, PipelineError};
use lazy_regex::regex;
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;

/// A target platform in `os/arch[/variant]` form, e.g. `linux/amd64` or `linux/arm/v7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Platform(String);

impl FromStr for Platform {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let platform = regex!("^[a-z0-9]+/[a-z0-9_]+(/[a-z0-9]+)?$");

        if !platform.is_match(s) {
            return Err(PipelineError::InvalidArgument {
                argument: "platform".to_string(),
                value: s.to_string(),
                description: "must be in the form os/arch[/variant]".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Platform {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What an environment variable is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvValue {
    Literal(String),
    Secret(SecretHandle),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvBinding {
    pub name: String,
    pub value: EnvValue,
}

/// Credentials used to pull the base image. The password is always a registered secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryAuth {
    pub address: String,
    pub username: String,
    pub secret: SecretHandle,
}

/// Validates image references the way the docker daemon parses them: optional registry host (with port),
/// slash separated lowercase path components, then an optional tag and an optional sha256 digest.
fn validate_image_ref(reference: &str) -> Result<(), PipelineError> {
    let image_ref = regex!(
        r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?::[0-9]+)?(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*(?::[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?(?:@sha256:[a-f0-9]{64})?$"
    );

    if reference.len() > 255 || !image_ref.is_match(reference) {
        return Err(PipelineError::InvalidImageRef(reference.to_string()));
    }

    Ok(())
}

/// `Container` is an immutable description of work to be done in a container: which image to start, on which
/// platform, with which environment, and the ordered commands to run inside it. Nothing happens until the
/// container is run; every builder method returns a new value and leaves the receiver untouched, so partially
/// built containers can be branched freely.
///
/// Commands run one after another in the same container, each seeing the filesystem left by the ones before.
///
/// # Example
///
/// ```ignore
/// let base = client.container().from_image("alpine:3.17")?;
///
/// let with_curl = base.with_exec(["apk", "add", "curl"])?;
/// let version = with_curl.with_exec(["curl", "--version"])?.stdout().await?;
///
/// // `base` is unaffected by the branch above.
/// let release = base.with_exec(["cat", "/etc/alpine-release"])?.stdout().await?;
/// ```
#[must_use = "containers do nothing until run with .stdout(), .stderr() or .sync()"]
#[derive(Debug, Clone, Serialize)]
pub struct Container {
    #[serde(skip)]
    pub(crate) conn: Connection,
    pub(crate) image: Option<String>,
    pub(crate) platform: Option<Platform>,
    pub(crate) workdir: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) registry_auth: Option<RegistryAuth>,
    pub(crate) variables: Vec<EnvBinding>,
    pub(crate) commands: Vec<Vec<String>>,
}

impl Connection {
    /// Start an empty container description bound to this connection. Set an image with
    /// [`Container::from_image`] before running it. Once the connection is closed every fallible builder on the
    /// result returns [`PipelineError::UseAfterClose`].
    pub fn container(&self) -> Container {
        Container {
            conn: self.clone(),
            image: None,
            platform: None,
            workdir: None,
            user: None,
            registry_auth: None,
            variables: Vec::new(),
            commands: Vec::new(),
        }
    }
}

impl Container {
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    pub fn variables(&self) -> &[EnvBinding] {
        &self.variables
    }

    pub fn commands(&self) -> &[Vec<String>] {
        &self.commands
    }

    /// Copy of this container for a builder to modify. Fails once the connection is closed.
    fn fork(&self) -> Result<Self, PipelineError> {
        self.conn.ensure_open()?;
        Ok(self.clone())
    }

    /// Base the container on an image reference such as `alpine:3.17`.
    pub fn from_image(&self, reference: &str) -> Result<Self, PipelineError> {
        validate_image_ref(reference)?;

        let mut container = self.fork()?;
        container.image = Some(reference.to_string());
        Ok(container)
    }

    /// Target a specific platform; when unset the engine picks its default.
    pub fn with_platform(&self, platform: &str) -> Result<Self, PipelineError> {
        let platform = Platform::from_str(platform)?;

        let mut container = self.fork()?;
        container.platform = Some(platform);
        Ok(container)
    }

    fn with_binding(&self, name: &str, value: EnvValue) -> Result<Self, PipelineError> {
        validate_env_name(name)?;

        let mut container = self.fork()?;
        match container.variables.iter_mut().find(|b| b.name == name) {
            Some(binding) => binding.value = value,
            None => container.variables.push(EnvBinding {
                name: name.to_string(),
                value,
            }),
        }

        Ok(container)
    }

    /// Expose a registered secret to every command as the environment variable `name`. Binding a name that is
    /// already bound replaces the earlier value.
    pub fn with_secret_variable(
        &self,
        name: &str,
        secret: &SecretHandle,
    ) -> Result<Self, PipelineError> {
        self.conn.ensure_open()?;
        secret.check_owner(&self.conn)?;
        self.with_binding(name, EnvValue::Secret(secret.clone()))
    }

    /// Set a plain environment variable for every command.
    pub fn with_env_variable(&self, name: &str, value: &str) -> Result<Self, PipelineError> {
        self.with_binding(name, EnvValue::Literal(value.to_string()))
    }

    /// Remove the binding for `name`, if any. Infallible; a closed connection is reported when the container
    /// is run.
    pub fn without_env_variable(&self, name: &str) -> Self {
        let mut container = self.clone();
        container.variables.retain(|binding| binding.name != name);
        container
    }

    /// Run every command from `path`, which must be absolute.
    pub fn with_workdir(&self, path: &str) -> Result<Self, PipelineError> {
        if !path.starts_with('/') {
            return Err(PipelineError::InvalidArgument {
                argument: "workdir".to_string(),
                value: path.to_string(),
                description: "must be an absolute path".to_string(),
            });
        }

        let mut container = self.fork()?;
        container.workdir = Some(path.to_string());
        Ok(container)
    }

    /// Run every command as `user` (a name, uid or uid:gid).
    pub fn with_user(&self, user: &str) -> Result<Self, PipelineError> {
        validate_non_empty("user", user)?;

        let mut container = self.fork()?;
        container.user = Some(user.to_string());
        Ok(container)
    }

    /// Authenticate to `address` when pulling the base image.
    pub fn with_registry_auth(
        &self,
        address: &str,
        username: &str,
        secret: &SecretHandle,
    ) -> Result<Self, PipelineError> {
        validate_non_empty("registry address", address)?;
        validate_non_empty("registry username", username)?;
        secret.check_owner(&self.conn)?;

        let mut container = self.fork()?;
        container.registry_auth = Some(RegistryAuth {
            address: address.to_string(),
            username: username.to_string(),
            secret: secret.clone(),
        });
        Ok(container)
    }

    /// Append a command to run after every command already added. The first element is the executable.
    pub fn with_exec<I, S>(&self, argv: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();

        match argv.first() {
            None => {
                return Err(PipelineError::PlanValidation(
                    "exec requires at least an executable".into(),
                ))
            }
            Some(executable) if executable.trim().is_empty() => {
                return Err(PipelineError::PlanValidation(
                    "exec executable cannot be empty".into(),
                ))
            }
            _ => {}
        }

        let mut container = self.fork()?;
        container.commands.push(argv);
        Ok(container)
    }

    /// A JSON description of the container. Secret bindings appear only as their handle id and name.
    pub fn describe(&self) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(self).map_err(|e| {
            PipelineError::Unknown(format!("Could not successfully serialize container; {:#?}", e))
        })
    }

    /// Checks that the container is complete enough to submit.
    pub(crate) fn validate(&self) -> Result<&str, PipelineError> {
        let Some(image) = &self.image else {
            return Err(PipelineError::PlanValidation(
                "no image set; call from_image first".into(),
            ));
        };

        if self.commands.is_empty() {
            return Err(PipelineError::PlanValidation(
                "no commands to run; add at least one with with_exec".into(),
            ));
        }

        Ok(image.as_str())
    }
}
