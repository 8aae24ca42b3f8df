//! A scripted, in-process engine that interprets a handful of commands so pipelines can be exercised without a
//! container daemon.
use super::{EngineError, ExecRequest, ExecResponse, StartContainerRequest, Variable};
use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct FakeContainer {
    image: String,
    platform: Option<String>,
    files: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct Engine {
    unreachable: AtomicBool,
    secrets: DashMap<String, SecretString>,
    containers: DashMap<String, FakeContainer>,
    removed: Mutex<Vec<String>>,
    executed: Mutex<Vec<Vec<String>>>,
    started: AtomicUsize,
    closed: AtomicBool,
    leftover_on_close: AtomicBool,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine that refuses every call as if its socket were gone.
    pub fn unreachable() -> Self {
        let engine = Self::default();
        engine.unreachable.store(true, Ordering::SeqCst);
        engine
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Makes `close` report a container it could not clean up.
    pub fn set_leftover_on_close(&self, leftover: bool) {
        self.leftover_on_close.store(leftover, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<Vec<String>> {
        self.executed.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stored_secrets(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Image and platform of every container still alive.
    pub fn live_containers(&self) -> Vec<(String, Option<String>)> {
        self.containers
            .iter()
            .map(|c| (c.image.clone(), c.platform.clone()))
            .collect()
    }

    /// Whether a `touch` ever created `path` in any container this engine ran.
    pub fn file_touched(&self, path: &str) -> bool {
        self.executed()
            .iter()
            .any(|argv| argv.len() == 2 && argv[0] == "touch" && argv[1] == path)
    }

    fn check_reachable(&self) -> Result<(), EngineError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::Connection("fake engine is unreachable".into()));
        }

        Ok(())
    }
}

fn expand(script: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::new();
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }

        if name.is_empty() {
            out.push('$');
        } else if let Some(value) = env.get(&name) {
            out.push_str(value);
        }
    }

    out
}

fn ok(stdout: impl Into<String>) -> ExecResponse {
    ExecResponse {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn failed(exit_code: i64, stderr: impl Into<String>) -> ExecResponse {
    ExecResponse {
        exit_code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

fn shell(script: &str, env: &HashMap<String, String>) -> ExecResponse {
    let script = script.trim();

    if let Some(rest) = script.strip_prefix("echo ") {
        return ok(format!("{}\n", expand(rest.trim_matches('"'), env)));
    }

    if let Some(code) = script.strip_prefix("exit ") {
        return match code.trim().parse::<i64>() {
            Ok(0) => ok(""),
            Ok(code) => failed(code, ""),
            Err(_) => failed(2, format!("sh: exit: Illegal number: {code}\n")),
        };
    }

    failed(127, format!("sh: {script}: not found\n"))
}

#[async_trait]
impl super::Engine for Engine {
    async fn version(&self) -> Result<String, EngineError> {
        self.check_reachable()?;
        Ok("fake-1.0".into())
    }

    async fn store_secret(&self, id: &str, value: SecretString) -> Result<(), EngineError> {
        self.check_reachable()?;
        self.secrets.insert(id.to_string(), value);
        Ok(())
    }

    async fn start_container(&self, req: StartContainerRequest) -> Result<(), EngineError> {
        self.check_reachable()?;

        if let Some(auth) = &req.registry_auth {
            if !self.secrets.contains_key(&auth.secret_id) {
                return Err(EngineError::NoSuchSecret(auth.secret_id.clone()));
            }
        }

        if req.image.ends_with(":missing") {
            return Err(EngineError::NoSuchImage(req.image));
        }

        self.started.fetch_add(1, Ordering::SeqCst);
        self.containers.insert(
            req.name,
            FakeContainer {
                image: req.image,
                platform: req.platform,
                files: HashSet::new(),
            },
        );

        Ok(())
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecResponse, EngineError> {
        self.check_reachable()?;

        if !self.containers.contains_key(&req.container) {
            return Err(EngineError::NoSuchContainer(req.container));
        }

        let mut env = HashMap::new();
        for (key, value) in &req.variables {
            let value = match value {
                Variable::Literal(value) => value.clone(),
                Variable::Secret(id) => self
                    .secrets
                    .get(id)
                    .map(|secret| secret.expose_secret().clone())
                    .ok_or_else(|| EngineError::NoSuchSecret(id.clone()))?,
            };
            env.insert(key.clone(), value);
        }

        self.executed.lock().unwrap().push(req.command.clone());

        let argv: Vec<&str> = req.command.iter().map(String::as_str).collect();
        let response = match argv.as_slice() {
            ["true"] => ok(""),
            ["false"] => failed(1, ""),
            ["echo", rest @ ..] => ok(format!("{}\n", expand(&rest.join(" "), &env))),
            ["pwd"] => ok(format!("{}\n", req.workdir.as_deref().unwrap_or("/"))),
            ["whoami"] => ok(format!("{}\n", req.user.as_deref().unwrap_or("root"))),
            ["touch", path] => {
                if let Some(mut container) = self.containers.get_mut(&req.container) {
                    container.files.insert(path.to_string());
                }
                ok("")
            }
            ["test", "-e", path] => {
                let exists = self
                    .containers
                    .get(&req.container)
                    .map(|container| container.files.contains(*path))
                    .unwrap_or(false);
                if exists {
                    ok("")
                } else {
                    failed(1, "")
                }
            }
            ["apk", "add", packages @ ..] => ok(format!(
                "fetch https://dl-cdn.alpinelinux.org/alpine/v3.17/main/x86_64/APKINDEX.tar.gz\nOK: installed {}\n",
                packages.join(" ")
            )),
            ["sleep", secs] => {
                let secs = secs.parse::<u64>().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                ok("")
            }
            ["sh", "-c", script] => shell(script, &env),
            [cmd, ..] => failed(127, format!("{cmd}: not found\n")),
            [] => failed(127, "empty command\n"),
        };

        Ok(response)
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        self.containers.remove(name);
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.secrets.clear();
        self.containers.clear();
        self.closed.store(true, Ordering::SeqCst);

        if self.leftover_on_close.load(Ordering::SeqCst) {
            return Err(EngineError::Unknown(
                "could not remove 1 container(s) on close; sealpipe-stuck".into(),
            ));
        }

        Ok(())
    }
}
