use std::path::PathBuf;
use std::time::Duration;

/// Entry point the bundled backend is launched with.
pub const ENTRY_SCRIPT: &str = "start_backend.py";

/// Readiness polling policy for a freshly launched backend.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    /// Give up after this long.
    pub deadline: Duration,
    /// Wait between probes.
    pub interval: Duration,
    /// Per-probe request timeout.
    pub probe_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Packaged bundle: a directory or a `.zip` archive.
    pub resource_root: PathBuf,
    /// Per-user extraction target.
    pub data_dir: PathBuf,
    pub entry_script: String,
    pub readiness: ReadinessPolicy,
    /// How long `stop()` waits after a graceful termination request.
    pub stop_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(resource_root: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            resource_root,
            data_dir,
            entry_script: ENTRY_SCRIPT.to_string(),
            readiness: ReadinessPolicy::default(),
            stop_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(600),
            user_agent: format!("cellpose-cli/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// `~/.cellpose/backend`, falling back to the working directory when no home is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cellpose")
        .join("backend")
}

/// Look for `backend/` or `backend.zip` beside the running executable.
pub fn default_resource_root() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = exe_dir.join("backend");
    if dir.is_dir() {
        return dir;
    }
    exe_dir.join("backend.zip")
}
