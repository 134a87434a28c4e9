use crate::client::endpoint_url;
use crate::config::ReadinessPolicy;
use crate::error::SetupError;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Path probed for readiness. It doubles as the model catalog endpoint.
pub const PROBE_PATH: &str = "/getModels";

/// Poll `GET {base_url}/getModels` until it answers 2xx or the deadline passes.
///
/// Connection errors and non-2xx statuses are retried silently. Each probe and each sleep is
/// clipped to the remaining time, so a backend that never comes up fails within roughly one
/// interval of the deadline. Returns the number of probes sent.
pub(crate) async fn wait_until_ready(
    http: &reqwest::Client,
    base_url: &str,
    policy: ReadinessPolicy,
) -> Result<u32, SetupError> {
    let url = endpoint_url(base_url, PROBE_PATH).map_err(|e| SetupError::NotReady {
        last_error: Some(e.to_string()),
        output_tail: Vec::new(),
    })?;
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut last_error: Option<String> = None;

    while let Some(remaining) = policy.deadline.checked_sub(start.elapsed()) {
        if remaining.is_zero() {
            break;
        }
        attempts += 1;
        let timeout = policy.probe_timeout.min(remaining).max(Duration::from_millis(1));
        match http.get(url.clone()).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(attempts, elapsed = ?start.elapsed(), "backend is ready");
                return Ok(attempts);
            }
            Ok(resp) => last_error = Some(format!("probe returned HTTP {}", resp.status())),
            Err(e) => last_error = Some(e.to_string()),
        }

        let Some(remaining) = policy.deadline.checked_sub(start.elapsed()) else {
            break;
        };
        tokio::time::sleep(policy.interval.min(remaining)).await;
    }

    Err(SetupError::NotReady {
        last_error,
        output_tail: Vec::new(),
    })
}
