use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::models::{Document, DocumentId};
use crate::traits::Corpus;

const HTML_EXTENSIONS: &[&str] = &["html", "htm"];

/// A directory of saved HTML pages, one product per file.
///
/// Documents are returned sorted by file name; ids are file stems, falling
/// back to the full file name when two files share a stem.
#[derive(Debug, Clone)]
pub struct DirectoryCorpus {
    dir: PathBuf,
}

impl DirectoryCorpus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn is_html(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| HTML_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

impl Corpus for DirectoryCorpus {
    async fn discover(&self) -> Result<Vec<Document>, AppError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            AppError::DiscoveryError(format!(
                "Failed to read corpus directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            AppError::DiscoveryError(format!(
                "Failed to list corpus directory {}: {e}",
                self.dir.display()
            ))
        })? {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file && is_html(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut seen = HashSet::new();
        let documents = paths
            .into_iter()
            .map(|path| {
                let mut doc = Document::from_file(&path);
                if !seen.insert(doc.id.clone()) {
                    let file_name = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default();
                    doc.id = DocumentId::new(file_name);
                    seen.insert(doc.id.clone());
                }
                doc
            })
            .collect::<Vec<_>>();

        tracing::info!(
            dir = %self.dir.display(),
            documents = documents.len(),
            "Discovered corpus"
        );
        Ok(documents)
    }
}
