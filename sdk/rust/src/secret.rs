use crate::connection::Connection;
use crate::{validate_non_empty, PipelineError};
use secrecy::SecretString;
use serde::Serialize;
use std::fmt::Display;
use tracing::debug;
use uuid::Uuid;

/// An opaque reference to a secret registered with the engine. The plaintext stays with the engine; only this
/// handle circulates, and it is only valid on the connection that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SecretHandle {
    id: String,
    name: String,
    #[serde(skip)]
    session: Uuid,
}

impl SecretHandle {
    /// Engine-facing identifier of the secret.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The caller-chosen name the secret was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fails unless the handle was issued by `conn`.
    pub(crate) fn check_owner(&self, conn: &Connection) -> Result<(), PipelineError> {
        if self.session != conn.id() {
            return Err(PipelineError::InvalidHandle(format!(
                "secret '{}' belongs to connection {} not {}",
                self.name,
                self.session,
                conn.id()
            )));
        }

        Ok(())
    }
}

impl Display for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

impl Connection {
    /// Register a secret with the engine and get back a handle that can be bound into containers.
    ///
    /// Names are unique within a session; registering the same name twice fails with
    /// [`PipelineError::DuplicateSecret`]. The value is handed to the engine once and not kept by the connection.
    pub async fn set_secret(
        &self,
        name: &str,
        value: impl Into<String>,
    ) -> Result<SecretHandle, PipelineError> {
        self.ensure_open()?;
        validate_non_empty("secret name", name)?;

        let value = SecretString::new(value.into());

        let _channel = self.inner.channel.lock().await;
        self.ensure_open()?;

        if self.inner.secrets.contains_key(name) {
            return Err(PipelineError::DuplicateSecret(name.to_string()));
        }

        let handle = SecretHandle {
            id: format!("secret:{}", Uuid::now_v7()),
            name: name.to_string(),
            session: self.id(),
        };

        self.inner.engine.store_secret(&handle.id, value).await?;
        self.inner
            .secrets
            .insert(name.to_string(), handle.clone());

        self.inner.log.line(format!("registered secret {handle}"));
        debug!(session = %self.id(), secret_name = %name, secret_id = %handle.id, "Registered secret");

        Ok(handle)
    }

    /// Names of every secret registered in this session, sorted.
    pub fn secrets(&self) -> Result<Vec<String>, PipelineError> {
        self.ensure_open()?;

        let mut names: Vec<String> = self
            .inner
            .secrets
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();

        Ok(names)
    }
}
