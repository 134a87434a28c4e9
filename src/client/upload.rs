use crate::error::ClientError;
use crate::model::ImagePayload;
use bytes::Bytes;
use image::imageops::FilterType;
use image::ImageFormat;
use std::io::Cursor;
use std::path::Path;

/// Images wider than this are downscaled by default to keep uploads small.
const TARGET_UPLOAD_WIDTH: f64 = 500.0;

/// Image ready for upload, plus the scale it was reduced by (if any).
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub payload: ImagePayload,
    pub transmission_scale: Option<f64>,
    pub sent_size: Option<(u32, u32)>,
}

/// Suggested transmission scale for an image of `width` pixels, rounded to two decimals.
pub fn default_transmission_scale(width: u32) -> f64 {
    if f64::from(width) <= TARGET_UPLOAD_WIDTH {
        return 1.0;
    }
    let scale = TARGET_UPLOAD_WIDTH / f64::from(width);
    ((scale * 100.0).round() / 100.0).max(0.01)
}

pub fn image_width(path: &Path) -> Result<u32, ClientError> {
    image::image_dimensions(path)
        .map(|(w, _)| w)
        .map_err(|e| image_err(path, e))
}

/// Load `path` for upload. A scale below 1 decodes, resizes (bilinear) and re-encodes as PNG;
/// otherwise the original file bytes are sent untouched.
pub fn prepare_image(path: &Path, scale: Option<f64>) -> Result<PreparedImage, ClientError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    let scale = scale.filter(|s| *s < 1.0);
    let Some(scale) = scale else {
        let bytes = std::fs::read(path).map_err(|e| image_err(path, e))?;
        return Ok(PreparedImage {
            payload: ImagePayload {
                file_name,
                mime: "application/octet-stream",
                bytes: Bytes::from(bytes),
            },
            transmission_scale: None,
            sent_size: None,
        });
    };
    if !(scale > 0.0) {
        return Err(crate::error::GeometryError::InvalidScale(scale).into());
    }

    let img = image::open(path).map_err(|e| image_err(path, e))?;
    let w = ((f64::from(img.width()) * scale) as u32).max(1);
    let h = ((f64::from(img.height()) * scale) as u32).max(1);
    let resized = img.resize_exact(w, h, FilterType::Triangle);

    let mut buf = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| image_err(path, e))?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    Ok(PreparedImage {
        payload: ImagePayload {
            file_name: format!("{stem}.png"),
            mime: "image/png",
            bytes: Bytes::from(buf),
        },
        transmission_scale: Some(scale),
        sent_size: Some((w, h)),
    })
}

fn image_err(path: &Path, e: impl std::fmt::Display) -> ClientError {
    ClientError::Image {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}
