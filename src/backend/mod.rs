//! Lifecycle of the bundled local segmentation backend.
//!
//! [`BackendSupervisor::start`] materializes the bundle, finds an interpreter, launches the
//! server on a free loopback port and waits until it answers. [`BackendSupervisor::stop`]
//! terminates it again. Both are serialized behind one async mutex, so concurrent callers
//! share a single child process.

pub mod bundle;
pub mod locator;
pub mod logs;
pub mod port;
pub(crate) mod readiness;
pub mod repair;

use crate::config::SupervisorConfig;
use crate::error::SetupError;
use logs::LogTail;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const LOOPBACK: &str = "127.0.0.1";
/// Output lines attached to a readiness failure.
const FAILURE_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    /// The last start attempt failed. `start()` may be called again.
    Failed,
}

/// Everything needed to launch one backend process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub interpreter: PathBuf,
    pub entry_script: PathBuf,
    pub working_dir: PathBuf,
    pub port: u16,
}

/// Seam between the supervisor and the OS process API.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child>;
}

/// Runs `<interpreter> <entry> --host 127.0.0.1 --port N` inside the bundle directory.
#[derive(Debug, Default)]
pub struct CommandLauncher;

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Child> {
        Command::new(&spec.interpreter)
            .arg(&spec.entry_script)
            .args(["--host", LOOPBACK, "--port", &spec.port.to_string()])
            .current_dir(&spec.working_dir)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

struct BackendInstance {
    child: Child,
    base_url: String,
}

struct Inner {
    state: LifecycleState,
    instance: Option<BackendInstance>,
}

pub struct BackendSupervisor {
    cfg: SupervisorConfig,
    launcher: Box<dyn Launcher>,
    http: reqwest::Client,
    tail: LogTail,
    inner: Mutex<Inner>,
}

impl BackendSupervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self::with_launcher(cfg, Box::new(CommandLauncher))
    }

    pub fn with_launcher(cfg: SupervisorConfig, launcher: Box<dyn Launcher>) -> Self {
        Self {
            cfg,
            launcher,
            http: reqwest::Client::new(),
            tail: LogTail::default(),
            inner: Mutex::new(Inner {
                state: LifecycleState::Stopped,
                instance: None,
            }),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    /// Ensure a backend is running and ready. Returns its base URL.
    ///
    /// Idempotent while the process is alive: a second call returns the same URL without
    /// launching anything. A backend that exited on its own is replaced.
    pub async fn start(&self) -> Result<String, SetupError> {
        let mut inner = self.inner.lock().await;

        let ready = inner.state == LifecycleState::Ready;
        if let Some(inst) = inner.instance.as_mut() {
            match inst.child.try_wait() {
                Ok(None) if ready => return Ok(inst.base_url.clone()),
                Ok(Some(status)) => warn!(%status, "backend exited unexpectedly; relaunching"),
                _ => {}
            }
        }
        if let Some(mut stale) = inner.instance.take() {
            let _ = stale.child.start_kill();
        }

        inner.state = LifecycleState::Starting;
        info!("starting local backend");
        match self.launch(&mut inner).await {
            Ok(url) => {
                inner.state = LifecycleState::Ready;
                info!(base_url = %url, "local backend ready");
                Ok(url)
            }
            Err(e) => {
                inner.state = LifecycleState::Failed;
                if let Some(mut inst) = inner.instance.take() {
                    let _ = inst.child.kill().await;
                }
                warn!(error = %e, "local backend failed to start");
                Err(e)
            }
        }
    }

    async fn launch(&self, inner: &mut Inner) -> Result<String, SetupError> {
        let resource_root = self.cfg.resource_root.clone();
        let data_dir = self.cfg.data_dir.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            bundle::ensure_extracted(&resource_root, &data_dir)
        })
        .await
        .map_err(|e| SetupError::Extraction {
            target: self.cfg.data_dir.clone(),
            reason: e.to_string(),
        })??;
        debug!(
            fresh = extracted.fresh,
            files = extracted.files,
            "backend bundle in place"
        );
        let bundle_dir = extracted.dir;

        let interpreter = locator::locate(&bundle_dir)
            .ok_or_else(|| SetupError::RuntimeNotFound(bundle_dir.clone()))?;
        let entry_script = bundle_dir.join(&self.cfg.entry_script);
        if !entry_script.is_file() {
            return Err(SetupError::EntryScriptMissing(entry_script));
        }

        let port = port::allocate().map_err(SetupError::PortAllocation)?;
        let base_url = format!("http://{LOOPBACK}:{port}");
        let spec = LaunchSpec {
            interpreter,
            entry_script,
            working_dir: bundle_dir,
            port,
        };
        debug!(?spec, "launching backend");

        let mut child = self.launcher.launch(&spec).map_err(SetupError::Spawn)?;
        if let Some(out) = child.stdout.take() {
            logs::spawn_drain("stdout", out, self.tail.clone());
        }
        if let Some(err) = child.stderr.take() {
            logs::spawn_drain("stderr", err, self.tail.clone());
        }
        inner.instance = Some(BackendInstance {
            child,
            base_url: base_url.clone(),
        });

        readiness::wait_until_ready(&self.http, &base_url, self.cfg.readiness)
            .await
            .map_err(|e| match e {
                SetupError::NotReady { last_error, .. } => SetupError::NotReady {
                    last_error,
                    output_tail: self.tail.last(FAILURE_TAIL_LINES),
                },
                other => other,
            })?;
        Ok(base_url)
    }

    /// Terminate the backend if one is running. A no-op otherwise.
    ///
    /// Sends a graceful termination request, waits `stop_grace`, then kills forcibly.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let Some(mut inst) = inner.instance.take() else {
            inner.state = LifecycleState::Stopped;
            return;
        };
        inner.state = LifecycleState::Stopping;
        info!(base_url = %inst.base_url, "stopping local backend");
        terminate(&mut inst.child, self.cfg.stop_grace).await;
        inner.state = LifecycleState::Stopped;
    }
}

impl Drop for BackendSupervisor {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(inst) = inner.instance.as_mut() {
                let _ = inst.child.start_kill();
            }
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    request_shutdown(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "backend exited"),
        Ok(Err(e)) => warn!(error = %e, "failed waiting for backend"),
        Err(_) => {
            warn!(grace = ?grace, "backend ignored termination request; killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill backend");
            }
        }
    }
}

#[cfg(unix)]
fn request_shutdown(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: plain signal delivery to a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child) {
    let _ = child.start_kill();
}
