use crate::error::GeometryError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Model families the backend knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    Cellpose3,
    CellposeSam,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 2] = [ModelFamily::CellposeSam, ModelFamily::Cellpose3];

    /// Key used in query strings and in the `/getModels` payload.
    pub fn backend_key(self) -> &'static str {
        match self {
            ModelFamily::Cellpose3 => "Cellpose3.1",
            ModelFamily::CellposeSam => "CellposeSAM",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ModelFamily::Cellpose3 => "Cellpose 3.1",
            ModelFamily::CellposeSam => "Cellpose SAM",
        }
    }

    /// Accepts either the display name or the backend key, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|f| {
            name.eq_ignore_ascii_case(f.backend_key()) || name.eq_ignore_ascii_case(f.display_name())
        })
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Channel to segment, plus an optional helper (e.g. nuclei) channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channels {
    pub primary: u32,
    pub secondary: Option<u32>,
}

impl Channels {
    /// `"c1"` or `"c1,c2"`.
    pub fn as_query_value(&self) -> String {
        match self.secondary {
            Some(c2) => format!("{},{}", self.primary, c2),
            None => self.primary.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub percentile_low: f64,
    pub percentile_high: f64,
    pub tile_norm: u32,
}

impl Default for NormalizationParams {
    fn default() -> Self {
        Self {
            percentile_low: 1.0,
            percentile_high: 99.0,
            tile_norm: 0,
        }
    }
}

/// Every knob sent with a segmentation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationParams {
    pub model_family: ModelFamily,
    #[serde(default)]
    pub model_name: Option<String>,
    pub diameter: f64,
    pub channels: Channels,
    pub use_gpu: bool,
    pub batch_size: u32,
    pub resample: bool,
    /// `None` disables normalization.
    pub normalization: Option<NormalizationParams>,
    pub flow_threshold: f64,
    pub cellprob_threshold: f64,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        Self {
            model_family: ModelFamily::CellposeSam,
            model_name: None,
            diameter: 30.0,
            channels: Channels {
                primary: 0,
                secondary: None,
            },
            use_gpu: false,
            batch_size: 64,
            resample: false,
            normalization: Some(NormalizationParams::default()),
            flow_threshold: 0.4,
            cellprob_threshold: 0.0,
        }
    }
}

/// Image bytes as they will go over the wire.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub file_name: String,
    pub mime: &'static str,
    pub bytes: Bytes,
}

/// One segmentation invocation. Built once, never mutated after construction.
#[derive(Debug, Clone)]
pub struct SegmentationRequest {
    image: ImagePayload,
    params: SegmentationParams,
    transmission_scale: Option<f64>,
}

impl SegmentationRequest {
    pub fn new(image: ImagePayload, params: SegmentationParams) -> Self {
        Self {
            image,
            params,
            transmission_scale: None,
        }
    }

    /// Record that the image was downscaled by `scale` before upload.
    pub fn with_transmission_scale(mut self, scale: f64) -> Result<Self, GeometryError> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(GeometryError::InvalidScale(scale));
        }
        self.transmission_scale = Some(scale);
        Ok(self)
    }

    pub fn image(&self) -> &ImagePayload {
        &self.image
    }

    pub fn params(&self) -> &SegmentationParams {
        &self.params
    }

    pub fn transmission_scale(&self) -> Option<f64> {
        self.transmission_scale
    }

    /// Factor every returned coordinate is divided by.
    pub fn scale_factor(&self) -> f64 {
        self.transmission_scale.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Closed polygon; the last vertex connects back to the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
}

impl Polygon {
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn vertices(&self) -> impl Iterator<Item = Point> + '_ {
        self.xs
            .iter()
            .zip(self.ys.iter())
            .map(|(&x, &y)| Point { x, y })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

/// A detected cell in original-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: u32,
    pub centroid: Point,
    /// Mean vertex distance from the centroid.
    pub radius: f64,
    pub outline: Polygon,
    pub color: Rgb,
    pub intensity: f64,
}

/// Model names grouped by family key, in the order the backend listed them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelCatalog(pub BTreeMap<String, Vec<String>>);

impl ModelCatalog {
    /// Decode a `/getModels` payload. Entries whose value is not an array of strings are skipped.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(body)?;
        let families = raw
            .into_iter()
            .filter_map(|(key, value)| {
                let serde_json::Value::Array(items) = value else {
                    return None;
                };
                let names = items
                    .into_iter()
                    .filter_map(|v| match v {
                        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
                        _ => None,
                    })
                    .collect();
                Some((key, names))
            })
            .collect();
        Ok(Self(families))
    }

    pub fn models_for(&self, family: ModelFamily) -> &[String] {
        self.0
            .get(family.backend_key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn first_model(&self, family: ModelFamily) -> Option<&str> {
        self.models_for(family).first().map(String::as_str)
    }
}

/// Outcome of one completed segmentation, as printed in `--json` mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationResult {
    #[serde(default)]
    pub timestamp_utc: String,
    pub base_url: String,
    pub image: String,
    pub params: SegmentationParams,
    #[serde(default)]
    pub transmission_scale: Option<f64>,
    pub cells: Vec<Cell>,
}

/// Messages posted by worker tasks to the single presentation consumer.
#[derive(Debug, Clone)]
pub enum AppEvent {
    BackendStarting,
    BackendReady {
        base_url: String,
    },
    BackendFailed {
        message: String,
    },
    BackendStopped,
    ModelsUpdated {
        catalog: ModelCatalog,
    },
    SegmentationStarted,
    SegmentationCompleted {
        // Boxed to keep AppEvent small; the cell list can be large.
        result: Box<SegmentationResult>,
    },
    SegmentationFailed {
        message: String,
    },
    Info(InfoEvent),
}

/// Structured info events rendered by the presentation layer.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    UsingExternalBackend { url: String },
    BundleNotFound { fallback_url: String },
    ModelSelected { family: ModelFamily, name: Option<String> },
    ImageDownscaled { scale: f64, width: u32, height: u32 },
}

impl InfoEvent {
    /// Render a human-readable message for the CLI.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::UsingExternalBackend { url } => format!("Using external backend at {url}"),
            InfoEvent::BundleNotFound { fallback_url } => {
                format!("Bundled backend not found. Using external URL {fallback_url}")
            }
            InfoEvent::ModelSelected { family, name } => match name {
                Some(name) => format!("Model: {family} / {name}"),
                None => format!("Model: {family} (no model name available)"),
            },
            InfoEvent::ImageDownscaled {
                scale,
                width,
                height,
            } => format!("Uploading image downscaled by {scale:.2} to {width}x{height}px"),
        }
    }
}
