use crate::engine::{self, Engine};
use crate::secret::SecretHandle;
use crate::PipelineError;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::{Display as StrumDisplay, EnumString};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a connection writes its human-readable diagnostic lines.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, StrumDisplay, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogOutput {
    #[default]
    Stderr,
    Stdout,
    None,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Destination for the connection's diagnostic log.
    #[serde(default)]
    pub log_output: LogOutput,

    /// Upper bound on a single plan run in seconds. 0 means runs may take as long as they need.
    #[serde(default)]
    pub run_timeout: u64,

    #[serde(default)]
    pub engine: engine::Kind,

    pub docker: Option<engine::docker::Config>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_output: LogOutput::default(),
            run_timeout: 0,
            engine: engine::Kind::default(),
            docker: Some(engine::docker::Config::default()),
        }
    }
}

impl Config {
    pub fn log_output(mut self, log_output: LogOutput) -> Self {
        self.log_output = log_output;
        self
    }

    pub fn run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout.as_secs();
        self
    }

    pub(crate) fn run_timeout_duration(&self) -> Option<Duration> {
        (self.run_timeout > 0).then(|| Duration::from_secs(self.run_timeout))
    }
}

/// A cloneable handle onto the diagnostic log destination. Lines are written whole so concurrent writers
/// don't interleave.
#[derive(Clone)]
pub struct LogSink {
    writer: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("enabled", &self.writer.is_some())
            .finish()
    }
}

impl LogSink {
    pub fn new(output: LogOutput) -> Self {
        match output {
            LogOutput::Stderr => Self::from_writer(Box::new(std::io::stderr())),
            LogOutput::Stdout => Self::from_writer(Box::new(std::io::stdout())),
            LogOutput::None => Self::discard(),
        }
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Some(Arc::new(Mutex::new(writer))),
        }
    }

    pub fn discard() -> Self {
        Self { writer: None }
    }

    pub fn line(&self, message: impl Display) {
        let Some(writer) = &self.writer else {
            return;
        };

        // A poisoned lock only means another writer panicked mid-line; the sink is still usable.
        let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(writer, "{message}").and_then(|_| writer.flush()) {
            debug!(err = %e, "could not write to diagnostic log");
        }
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    pub id: Uuid,
    pub config: Config,
    pub engine: Arc<dyn Engine>,
    pub log: LogSink,
    /// Secrets registered in this session, by caller-chosen name.
    pub secrets: DashMap<String, SecretHandle>,
    closed: AtomicBool,
    /// Serializes engine round trips so concurrent callers can't interleave on the session.
    pub channel: tokio::sync::Mutex<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        warn!(session = %self.id, "Connection dropped without being closed; releasing engine state");

        let engine = self.engine.clone();
        let session = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = engine.close().await {
                    error!(session = %session, err = %e, "could not release engine state");
                }
            });
        }
    }
}

/// A live session with an execution engine. Cloning is cheap and every clone refers to the same session.
///
/// Secrets registered and containers built through a connection are only valid on that connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Session>,
}

impl Connection {
    /// Open a session with the engine named in `config`.
    pub async fn open(config: Config) -> Result<Self, PipelineError> {
        let log = LogSink::new(config.log_output);
        Self::open_with_log(config, log).await
    }

    /// Like [`Connection::open`] but writes diagnostics to a caller-provided sink.
    pub async fn open_with_log(config: Config, log: LogSink) -> Result<Self, PipelineError> {
        let engine = engine::new(&config, log.clone())
            .await
            .map_err(|e| PipelineError::Connection(e.to_string()))?;

        Self::open_with_engine(config, engine, log).await
    }

    /// Open a session on an already constructed engine.
    pub async fn open_with_engine(
        config: Config,
        engine: Arc<dyn Engine>,
        log: LogSink,
    ) -> Result<Self, PipelineError> {
        let version = engine
            .version()
            .await
            .map_err(|e| PipelineError::Connection(e.to_string()))?;

        let id = Uuid::now_v7();

        log.line(format!("connected to {} engine {version}", config.engine));
        info!(session = %id, engine = %config.engine, version = %version, "Connection opened");

        Ok(Self {
            inner: Arc::new(Session {
                id,
                config,
                engine,
                log,
                secrets: DashMap::new(),
                closed: AtomicBool::new(false),
                channel: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Unique identifier for this session. Handles and containers built on it carry the same id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), PipelineError> {
        if self.is_closed() {
            return Err(PipelineError::UseAfterClose);
        }

        Ok(())
    }

    /// Close the session and release every secret the engine holds for it. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), PipelineError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Wait for anything in flight on the session to finish before tearing it down.
        let _channel = self.inner.channel.lock().await;

        self.inner.secrets.clear();
        let result = self.inner.engine.close().await;

        self.inner.log.line("connection closed");
        info!(session = %self.inner.id, "Connection closed");

        result.map_err(PipelineError::from)
    }
}

/// Open a connection, hand it to `body`, and close it once `body` finishes, whether it succeeded, failed or
/// panicked. A panic is resumed after the connection is closed.
pub async fn with_connection<F, Fut, T, E>(config: Config, body: F) -> Result<T, E>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<PipelineError>,
{
    let conn = Connection::open(config).await?;
    scoped(conn, body).await
}

pub(crate) async fn scoped<F, Fut, T, E>(conn: Connection, body: F) -> Result<T, E>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<PipelineError>,
{
    let outcome = AssertUnwindSafe(body(conn.clone())).catch_unwind().await;
    let closed = conn.close().await;

    match outcome {
        Err(panic) => std::panic::resume_unwind(panic),
        Ok(Err(e)) => {
            if let Err(close_err) = closed {
                error!(err = %close_err, "could not cleanly close connection");
            }
            Err(e)
        }
        Ok(Ok(value)) => {
            closed?;
            Ok(value)
        }
    }
}
