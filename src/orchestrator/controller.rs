//! Session controller.
//!
//! Resolves which backend to talk to, runs catalog and segmentation work on worker tasks and
//! reports progress as `AppEvent`s. The bundled backend is stopped on every exit path.

use crate::backend::bundle::{BundleSource, EXTRACT_MARKER};
use crate::backend::{BackendSupervisor, LifecycleState};
use crate::client::upload::{self, PreparedImage};
use crate::client::SegmentationClient;
use crate::config::{ClientConfig, SupervisorConfig};
use crate::model::{
    AppEvent, InfoEvent, ModelCatalog, SegmentationParams, SegmentationRequest,
    SegmentationResult,
};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc::UnboundedSender;

/// Used when no bundled backend can be started.
pub(crate) const FALLBACK_BACKEND_URL: &str = "http://localhost:8000";

/// Where segmentation requests go.
#[derive(Debug, Clone)]
pub(crate) enum BackendChoice {
    External(String),
    Bundled(SupervisorConfig),
}

/// How the upload is scaled before transmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ScaleChoice {
    Original,
    Fixed(f64),
    /// Shrink wide images to roughly 500 px across.
    Auto,
}

/// Everything one session needs, already validated by the CLI layer.
#[derive(Debug, Clone)]
pub(crate) struct SessionPlan {
    pub backend: BackendChoice,
    pub client: ClientConfig,
    pub params: SegmentationParams,
    pub image: Option<PathBuf>,
    pub scale: ScaleChoice,
    pub list_models: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SessionOutcome {
    pub catalog: Option<ModelCatalog>,
    pub result: Option<SegmentationResult>,
}

/// Run one session to completion, or until Ctrl-C.
pub(crate) async fn run_session(
    plan: SessionPlan,
    event_tx: UnboundedSender<AppEvent>,
) -> Result<SessionOutcome> {
    let (base_url, supervisor) = resolve_backend(&plan.backend, &event_tx).await;

    let res = tokio::select! {
        r = run_work(&plan, &base_url, &event_tx) => r,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    if let Some(sup) = supervisor {
        let was_running = sup.state().await == LifecycleState::Ready;
        sup.stop().await;
        if was_running {
            let _ = event_tx.send(AppEvent::BackendStopped);
        }
    }
    res
}

/// Pick the backend URL, starting the bundled one when configured.
///
/// Never fails: a missing bundle or a failed start falls back to `FALLBACK_BACKEND_URL`.
pub(crate) async fn resolve_backend(
    choice: &BackendChoice,
    event_tx: &UnboundedSender<AppEvent>,
) -> (String, Option<Arc<BackendSupervisor>>) {
    let cfg = match choice {
        BackendChoice::External(url) => {
            let _ = event_tx.send(AppEvent::Info(InfoEvent::UsingExternalBackend {
                url: url.clone(),
            }));
            return (url.clone(), None);
        }
        BackendChoice::Bundled(cfg) => cfg.clone(),
    };

    let already_extracted = cfg.data_dir.join(EXTRACT_MARKER).exists();
    if !already_extracted && BundleSource::detect(&cfg.resource_root).is_none() {
        let _ = event_tx.send(AppEvent::Info(InfoEvent::BundleNotFound {
            fallback_url: FALLBACK_BACKEND_URL.to_string(),
        }));
        return (FALLBACK_BACKEND_URL.to_string(), None);
    }

    let _ = event_tx.send(AppEvent::BackendStarting);
    let sup = Arc::new(BackendSupervisor::new(cfg));
    let worker = sup.clone();
    let started = tokio::spawn(async move { worker.start().await }).await;

    match started {
        Ok(Ok(url)) => {
            let _ = event_tx.send(AppEvent::BackendReady {
                base_url: url.clone(),
            });
            (url, Some(sup))
        }
        Ok(Err(e)) => {
            let _ = event_tx.send(AppEvent::BackendFailed {
                message: e.to_string(),
            });
            fall_back(event_tx, sup)
        }
        Err(e) => {
            let _ = event_tx.send(AppEvent::BackendFailed {
                message: format!("backend start task failed: {e}"),
            });
            fall_back(event_tx, sup)
        }
    }
}

fn fall_back(
    event_tx: &UnboundedSender<AppEvent>,
    sup: Arc<BackendSupervisor>,
) -> (String, Option<Arc<BackendSupervisor>>) {
    let _ = event_tx.send(AppEvent::Info(InfoEvent::Message(format!(
        "Falling back to external backend at {FALLBACK_BACKEND_URL}"
    ))));
    // Keep the supervisor so teardown still runs for anything half-started.
    (FALLBACK_BACKEND_URL.to_string(), Some(sup))
}

async fn run_work(
    plan: &SessionPlan,
    base_url: &str,
    event_tx: &UnboundedSender<AppEvent>,
) -> Result<SessionOutcome> {
    let client = SegmentationClient::new(base_url, &plan.client)
        .with_context(|| format!("invalid backend URL {base_url}"))?;
    let mut outcome = SessionOutcome::default();
    let mut params = plan.params.clone();

    let needs_catalog = plan.list_models || (plan.image.is_some() && params.model_name.is_none());
    if needs_catalog {
        match client.fetch_models().await {
            Ok(catalog) => {
                let _ = event_tx.send(AppEvent::ModelsUpdated {
                    catalog: catalog.clone(),
                });
                outcome.catalog = Some(catalog);
            }
            Err(e) if plan.list_models => {
                return Err(e).context("failed to fetch the model catalog");
            }
            Err(e) => {
                let _ = event_tx.send(AppEvent::Info(InfoEvent::Message(format!(
                    "Could not fetch models: {e}"
                ))));
            }
        }
    }

    let Some(image_path) = plan.image.clone() else {
        return Ok(outcome);
    };

    if params.model_name.is_none() {
        params.model_name = outcome
            .catalog
            .as_ref()
            .and_then(|c| c.first_model(params.model_family))
            .map(str::to_string);
    }
    let _ = event_tx.send(AppEvent::Info(InfoEvent::ModelSelected {
        family: params.model_family,
        name: params.model_name.clone(),
    }));

    let prepared = prepare(image_path.clone(), plan.scale).await?;
    if let (Some(scale), Some((width, height))) = (prepared.transmission_scale, prepared.sent_size)
    {
        let _ = event_tx.send(AppEvent::Info(InfoEvent::ImageDownscaled {
            scale,
            width,
            height,
        }));
    }

    let mut request = SegmentationRequest::new(prepared.payload, params.clone());
    if let Some(scale) = prepared.transmission_scale {
        request = request.with_transmission_scale(scale)?;
    }

    let _ = event_tx.send(AppEvent::SegmentationStarted);
    let cells = match client.segment(&request).await {
        Ok(cells) => cells,
        Err(e) => {
            let _ = event_tx.send(AppEvent::SegmentationFailed {
                message: e.to_string(),
            });
            return Err(e).context("segmentation failed");
        }
    };

    let result = SegmentationResult {
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
        base_url: base_url.to_string(),
        image: image_path.display().to_string(),
        params,
        transmission_scale: request.transmission_scale(),
        cells,
    };
    let _ = event_tx.send(AppEvent::SegmentationCompleted {
        result: Box::new(result.clone()),
    });
    outcome.result = Some(result);
    Ok(outcome)
}

/// Decode and optionally downscale off the async runtime.
async fn prepare(path: PathBuf, scale: ScaleChoice) -> Result<PreparedImage> {
    tokio::task::spawn_blocking(move || {
        let factor = match scale {
            ScaleChoice::Original => None,
            ScaleChoice::Fixed(s) => Some(s),
            ScaleChoice::Auto => Some(upload::default_transmission_scale(upload::image_width(
                &path,
            )?)),
        };
        upload::prepare_image(&path, factor)
    })
    .await
    .context("image preparation task failed")?
    .context("failed to prepare image for upload")
}
