use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Default extension allow-list for image discovery
pub const DEFAULT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "webp"];

/// Representation of an image file found during discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFile {
    /// Full path to the image file
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Last modified timestamp
    pub last_modified: SystemTime,

    /// Lowercase file extension
    pub extension: String,
}

impl ImageFile {
    /// Build an `ImageFile` from the filesystem metadata of `path`
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            last_modified: metadata.modified()?,
            extension: extension_of(path).unwrap_or_default(),
        })
    }

    /// File name component, lossily converted
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Parent directory with forward slashes, as stored in records
    pub fn directory(&self) -> String {
        self.path
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default()
    }

    /// MIME type sent to the remote analyzers
    pub fn mime_type(&self) -> &'static str {
        mime_for_extension(&self.extension)
    }
}

/// Lowercase extension of a path, if any
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Map an image extension to its MIME type
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for_extension("JPG"), "image/jpeg");
        assert_eq!(mime_for_extension("webp"), "image/webp");
        assert_eq!(mime_for_extension("raw"), "application/octet-stream");
    }

    #[test]
    fn test_directory_uses_forward_slashes() {
        let file = ImageFile {
            path: PathBuf::from("photos/2024/a.jpg"),
            size: 1,
            last_modified: SystemTime::UNIX_EPOCH,
            extension: "jpg".to_string(),
        };
        assert_eq!(file.filename(), "a.jpg");
        assert_eq!(file.directory(), "photos/2024");
        assert_eq!(file.mime_type(), "image/jpeg");
    }
}
