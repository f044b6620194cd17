use log::{debug, warn};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::logging::log_file_error;
use crate::types::{extension_of, ImageFile};

/// Discover images below `root`, sorted by path
pub fn discover_images<P: AsRef<Path>>(root: P, config: &Config) -> Result<Vec<ImageFile>> {
    let root = root.as_ref();
    if !root.exists() {
        return Err(Error::FileNotFound(root.to_path_buf()));
    }

    let processing = &config.processing;
    let max_depth = processing.max_depth.unwrap_or(usize::MAX);
    let max_size = processing
        .max_file_size_mb
        .map(|mb| mb.saturating_mul(1024 * 1024));

    let mut image_files = Vec::new();

    for entry in WalkDir::new(root).max_depth(max_depth).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry during scan: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !is_image_path(path, &processing.allowed_extensions) {
            continue;
        }

        match ImageFile::from_path(path) {
            Ok(image_file) => {
                if let Some(limit) = max_size {
                    if image_file.size > limit {
                        warn!(
                            "Skipping {}: {} bytes exceeds the {} MB limit",
                            path.display(),
                            image_file.size,
                            limit / (1024 * 1024)
                        );
                        continue;
                    }
                }
                image_files.push(image_file);
            }
            Err(e) => {
                // Log error but continue with other files
                log_file_error(path, "read metadata", &e);
            }
        }
    }

    image_files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!("Discovered {} images under {}", image_files.len(), root.display());
    Ok(image_files)
}

/// Whether a path carries one of the allowed extensions (case-insensitive)
pub fn is_image_path(path: &Path, allowed_extensions: &[String]) -> bool {
    match extension_of(path) {
        Some(ext) => allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext)),
        None => false,
    }
}

// -- Tests --
