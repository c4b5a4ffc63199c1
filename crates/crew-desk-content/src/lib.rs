#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

mod scanner;

pub use scanner::{
    format_file_list, is_sensitive_file, scan_paths, should_exclude_directory, ScanOptions,
    ScanReport,
};

const SEPARATOR_WIDTH: usize = 80;

/// Outcome of reading one file for the content blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedFile {
    Loaded { path: PathBuf, text: String },
    Failed { path: PathBuf, reason: String },
}

impl LoadedFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Loaded { path, .. } | Self::Failed { path, .. } => path,
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }

    fn render(&self) -> String {
        let rule = "=".repeat(SEPARATOR_WIDTH);
        match self {
            Self::Loaded { path, text } => {
                format!("\n{rule}\nFile: {}\n{rule}\n\n{text}\n", path.display())
            }
            Self::Failed { path, reason } => {
                format!(
                    "\n{rule}\nFile: {}\nError: {reason}\n{rule}\n",
                    path.display()
                )
            }
        }
    }
}

/// Read each path in order. Failures become `Failed` entries; the batch never aborts.
#[must_use]
pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Vec<LoadedFile> {
    paths.iter().map(|path| load_one(path.as_ref())).collect()
}

/// Join rendered stanzas into the single text blob handed to a pipeline.
#[must_use]
pub fn render_blob(files: &[LoadedFile]) -> String {
    files
        .iter()
        .map(LoadedFile::render)
        .collect::<Vec<_>>()
        .join("\n")
}

#[must_use]
pub fn load_content<P: AsRef<Path>>(paths: &[P]) -> String {
    render_blob(&load_files(paths))
}

fn load_one(path: &Path) -> LoadedFile {
    let path = absolute_path(path);
    match std::fs::read(&path) {
        Ok(bytes) => {
            tracing::debug!(path = %path.display(), bytes = bytes.len(), "loaded content file");
            LoadedFile::Loaded {
                text: String::from_utf8_lossy(&bytes).into_owned(),
                path,
            }
        }
        Err(err) => {
            let reason = if err.kind() == std::io::ErrorKind::NotFound {
                "File not found".to_string()
            } else {
                err.to_string()
            };
            tracing::warn!(path = %path.display(), %reason, "content file could not be read");
            LoadedFile::Failed { path, reason }
        }
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
