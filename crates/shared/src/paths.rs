//! File path utilities for organizing data files.
//!
//! Uploaded videos live under `<root>/uploads`, next to the default
//! event log file.

use std::path::{Path, PathBuf};

/// File path manager for data files
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Create a new DataPaths with the given root directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root data directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the directory holding uploaded videos
    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// Get the stored path for an uploaded video
    pub fn upload_file(&self, filename: &str) -> PathBuf {
        self.uploads_dir().join(filename)
    }

    /// Create all necessary directories
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.uploads_dir())
    }
}

/// Sanitize a client-provided file extension
///
/// Returns the extension with its leading dot, or an empty string when the
/// name has no usable extension.
pub fn sanitized_extension(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return String::new();
    }

    format!(".{}", ext.to_ascii_lowercase())
}
