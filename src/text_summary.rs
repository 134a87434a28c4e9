//! Text summary builder for CLI output.
//!
//! Formats human-readable lines for text mode from a finished segmentation or a model catalog.

use crate::metrics;
use crate::model::{ModelCatalog, ModelFamily, SegmentationResult};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(result: &SegmentationResult) -> TextSummary {
    let mut lines = Vec::new();
    let params = &result.params;

    lines.push(format!("Image: {}", result.image));
    lines.push(format!("Backend: {}", result.base_url));
    lines.push(format!(
        "Model: {} / {}",
        params.model_family,
        params.model_name.as_deref().unwrap_or("-")
    ));
    if let Some(scale) = result.transmission_scale {
        lines.push(format!("Transmission scale: {scale:.2}"));
    }
    lines.push(format!("Cells: {}", result.cells.len()));

    let radii: Vec<f64> = result.cells.iter().map(|c| c.radius).collect();
    match metrics::compute_metrics(&radii) {
        Some((mean, median, p25, p75)) => lines.push(format!(
            "Radius (px): avg {mean:.1} med {median:.1} p25 {p25:.1} p75 {p75:.1}"
        )),
        None => {
            if let Some(cell) = result.cells.first() {
                lines.push(format!("Radius (px): {:.1}", cell.radius));
            }
        }
    }

    for cell in &result.cells {
        lines.push(format!(
            "  #{:<4} centroid ({:.1}, {:.1})  radius {:.1}  vertices {}",
            cell.id,
            cell.centroid.x,
            cell.centroid.y,
            cell.radius,
            cell.outline.len()
        ));
    }

    TextSummary { lines }
}

/// One line per known family, in display order.
pub(crate) fn build_catalog_summary(catalog: &ModelCatalog) -> TextSummary {
    let lines = ModelFamily::ALL
        .iter()
        .map(|family| {
            let names = catalog.models_for(*family);
            if names.is_empty() {
                format!("{}: (none)", family.display_name())
            } else {
                format!("{}: {}", family.display_name(), names.join(", "))
            }
        })
        .collect();
    TextSummary { lines }
}
