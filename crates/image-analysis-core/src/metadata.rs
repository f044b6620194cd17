use chrono::{DateTime, Utc};
use image::ImageResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Basic image properties stored alongside the analysis results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Detected container format, e.g. "Jpeg"
    pub format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub file_modified: Option<DateTime<Utc>>,
}

/// Read dimensions and format from the image header without decoding pixels
pub fn extract_metadata<P: AsRef<Path>>(path: P) -> ImageResult<ImageMetadata> {
    let path = path.as_ref();
    let reader = image::io::Reader::open(path)?.with_guessed_format()?;
    let format = reader.format().map(|f| format!("{:?}", f));
    let (width, height) = reader.into_dimensions()?;

    let file_modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    Ok(ImageMetadata {
        format,
        width,
        height,
        aspect_ratio: if height == 0 {
            0.0
        } else {
            width as f64 / height as f64
        },
        file_modified,
    })
}
