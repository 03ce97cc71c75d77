use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::ExtractionError;
use crate::extracted::EvidenceFile;
use crate::format::FormatKind;

static UNSAFE_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());

const SNIFF_BYTES: u64 = 512;

/// Control id as it appears in evidence folder names.
pub fn sanitize_folder_name(control_id: &str) -> String {
    UNSAFE_CHARS.replace_all(control_id.trim(), "_").into_owned()
}

/// Locates and lists evidence under `<root>/<control id>`.
#[derive(Debug, Clone)]
pub struct EvidenceReader {
    root: PathBuf,
}

impl EvidenceReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exact folder for the control, else the first sub-folder (by name)
    /// containing the sanitised id, case-insensitively.
    pub fn resolve_folder(&self, control_id: &str) -> Option<PathBuf> {
        let sanitized = sanitize_folder_name(control_id);
        if sanitized.is_empty() {
            return None;
        }

        let exact = self.root.join(&sanitized);
        if exact.is_dir() {
            return Some(exact);
        }

        let needle = sanitized.to_lowercase();
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.root)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_lowercase().contains(&needle))
            })
            .collect();
        candidates.sort();

        let found = candidates.into_iter().next();
        if let Some(folder) = &found {
            debug!(control_id, folder = %folder.display(), "Matched evidence folder by name");
        }
        found
    }

    /// Every non-hidden file under `folder`, recursively, sorted by relative path.
    /// A missing folder yields no files.
    pub async fn list_files(&self, folder: &Path) -> Result<Vec<EvidenceFile>, ExtractionError> {
        let folder = folder.to_path_buf();
        tokio::task::spawn_blocking(move || list_files_blocking(&folder))
            .await
            .map_err(|e| ExtractionError::Io(std::io::Error::other(e)))?
    }
}

fn list_files_blocking(folder: &Path) -> Result<Vec<EvidenceFile>, ExtractionError> {
    if !folder.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(folder)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(folder = %folder.display(), error = %e, "Skipping unreadable evidence entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path().to_path_buf();
        let name = relative_name(folder, &path);
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let kind = FormatKind::detect(&path, &read_head(&path));

        files.push(EvidenceFile {
            path,
            name,
            kind,
            size_bytes,
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}

fn relative_name(folder: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(folder).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// First bytes of the file for content sniffing; empty if unreadable.
fn read_head(path: &Path) -> Vec<u8> {
    let mut head = Vec::new();
    if let Ok(file) = std::fs::File::open(path) {
        let _ = file.take(SNIFF_BYTES).read_to_end(&mut head);
    }
    head
}
