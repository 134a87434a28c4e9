//! HTTP client for the segmentation backend.
//!
//! `segment` uploads one image with the full parameter set and consumes the line-delimited
//! polygon response incrementally; `fetch_models` reads the model catalog.

mod endpoint;
mod lines;
pub mod upload;

pub use endpoint::{endpoint_url, segment_url};

use crate::config::ClientConfig;
use crate::error::{ClientError, ProtocolError, TransportError};
use crate::geometry;
use crate::model::{Cell, ModelCatalog, SegmentationRequest};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use lines::LineSplitter;
use reqwest::multipart::{Form, Part};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct SegmentationClient {
    http: reqwest::Client,
    base_url: String,
}

impl SegmentationClient {
    pub fn new(base_url: &str, cfg: &ClientConfig) -> Result<Self, TransportError> {
        // Validate early so a typo in --backend-url fails before any upload work.
        endpoint_url(base_url, "/")?;
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim().to_string(),
        })
    }


    /// `GET /getModels`.
    pub async fn fetch_models(&self) -> Result<ModelCatalog, ClientError> {
        let url = endpoint_url(&self.base_url, "/getModels")?;
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ProtocolError::Status { status, body }.into());
        }
        Ok(ModelCatalog::from_json(&body).map_err(ProtocolError::from)?)
    }

    /// Upload the image and return the detected cells in response order.
    pub async fn segment(&self, req: &SegmentationRequest) -> Result<Vec<Cell>, ClientError> {
        let url = segment_url(&self.base_url, req.params())?;
        let image = req.image();
        let part = Part::bytes(image.bytes.to_vec())
            .file_name(image.file_name.clone())
            .mime_str(image.mime)?;
        let form = Form::new().part("image", part);

        debug!(%url, bytes = image.bytes.len(), "uploading image for segmentation");
        let resp = self.http.post(url).multipart(form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await?;
            return Err(ProtocolError::Status { status, body }.into());
        }

        parse_cell_stream(resp.bytes_stream(), req.scale_factor()).await
    }
}

/// Turns response lines into cells, numbering them from 1 in arrival order.
struct CellCollector {
    scale: f64,
    line_no: usize,
    cells: Vec<Cell>,
}

impl CellCollector {
    fn new(scale: f64) -> Self {
        Self {
            scale,
            line_no: 0,
            cells: Vec::new(),
        }
    }

    fn accept(&mut self, raw: &[u8]) -> Result<(), ProtocolError> {
        self.line_no += 1;
        let line = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::InvalidEncoding { line: self.line_no })?;
        if line.trim().is_empty() {
            return Ok(());
        }
        let id = self.cells.len() as u32 + 1;
        let cell = geometry::parse_line(line)
            .and_then(|tokens| geometry::map_line(&tokens, self.scale, id))
            .map_err(|source| ProtocolError::MalformedLine {
                line: self.line_no,
                source,
            })?;
        self.cells.push(cell);
        Ok(())
    }
}

/// Parse a streamed body. Any bad line discards the whole result.
pub async fn parse_cell_stream<S, E>(stream: S, scale: f64) -> Result<Vec<Cell>, ClientError>
where
    S: Stream<Item = Result<Bytes, E>>,
    ClientError: From<E>,
{
    if !(scale > 0.0) {
        return Err(crate::error::GeometryError::InvalidScale(scale).into());
    }
    let mut splitter = LineSplitter::new();
    let mut collector = CellCollector::new(scale);
    let mut stream = std::pin::pin!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for line in splitter.push(&chunk) {
            collector.accept(&line)?;
        }
    }
    if let Some(rest) = splitter.finish() {
        collector.accept(&rest)?;
    }
    Ok(collector.cells)
}
