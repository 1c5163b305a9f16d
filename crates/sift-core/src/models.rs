use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;
use crate::images::ImageCandidate;
use crate::truth_sheet::TruthSheet;

/// Stable identifier of a document within one corpus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id from a file path (the file stem).
    ///
    /// Example: `"data/blue-sneaker.html"` → `"blue-sneaker"`
    pub fn from_path(path: &Path) -> Self {
        Self(
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("document")
                .to_string(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a document within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Succeeded => "succeeded",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentStatus::Pending)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a document's raw HTML lives.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    /// Read from disk when the document is processed.
    File(PathBuf),
    /// Already in memory.
    Inline(Arc<str>),
}

/// One raw HTML page of the corpus.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    /// Page URL, used to resolve relative image references.
    pub url: Option<String>,
    pub source: DocumentSource,
}

impl Document {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: DocumentId::from_path(&path),
            url: None,
            source: DocumentSource::File(path),
        }
    }

    pub fn from_html(id: impl Into<String>, html: impl Into<Arc<str>>) -> Self {
        Self {
            id: DocumentId::new(id),
            url: None,
            source: DocumentSource::Inline(html.into()),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Load the raw content. Invalid UTF-8 is replaced rather than rejected.
    pub async fn load(&self) -> Result<Arc<str>, AppError> {
        match &self.source {
            DocumentSource::Inline(html) => Ok(Arc::clone(html)),
            DocumentSource::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    AppError::DocumentError(format!("Failed to read {}: {e}", path.display()))
                })?;
                Ok(Arc::from(String::from_utf8_lossy(&bytes).as_ref()))
            }
        }
    }
}

/// Main-content text of a document, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DistilledContent(String);

impl DistilledContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

/// Everything the hydration collaborator gets to see about one document.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionUnit {
    pub document_id: DocumentId,
    pub truth_sheet: TruthSheet,
    pub distilled: DistilledContent,
    /// Ordered by descending quality score.
    pub images: Vec<ImageCandidate>,
    /// True when `images` holds only the starvation fallback candidate.
    pub image_starved: bool,
}

/// Request passed to a [`Hydrator`](crate::traits::Hydrator).
#[derive(Debug, Clone, Serialize)]
pub struct HydrationRequest {
    pub unit: ExtractionUnit,
    /// JSON Schema the returned record must satisfy.
    pub schema: serde_json::Value,
}

/// Why a document did not produce a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    HydrationFailure,
    ValidationFailure,
    ExtractionFailure,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::HydrationFailure => "hydration_failure",
            FailureReason::ValidationFailure => "validation_failure",
            FailureReason::ExtractionFailure => "extraction_failure",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one document's run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionResult {
    Success {
        document_id: DocumentId,
        record: serde_json::Value,
        /// SHA-256 of the raw document content
        content_hash: String,
        /// SHA-256 of the record (for change detection)
        data_hash: String,
    },
    Failure {
        document_id: DocumentId,
        reason: FailureReason,
        error: String,
        /// Whether the same input may succeed on another attempt.
        retryable: bool,
    },
}

impl ExtractionResult {
    pub fn failure(document_id: DocumentId, error: &AppError) -> Self {
        ExtractionResult::Failure {
            document_id,
            reason: error.failure_reason(),
            error: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        match self {
            ExtractionResult::Success { document_id, .. }
            | ExtractionResult::Failure { document_id, .. } => document_id,
        }
    }

    pub fn status(&self) -> DocumentStatus {
        match self {
            ExtractionResult::Success { .. } => DocumentStatus::Succeeded,
            ExtractionResult::Failure { .. } => DocumentStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionResult::Success { .. })
    }

    pub fn record(&self) -> Option<&serde_json::Value> {
        match self {
            ExtractionResult::Success { record, .. } => Some(record),
            ExtractionResult::Failure { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            ExtractionResult::Success { .. } => None,
            ExtractionResult::Failure { reason, .. } => Some(*reason),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExtractionResult::Failure {
                retryable: true,
                ..
            }
        )
    }
}

/// Full accounting of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: BTreeMap<DocumentId, ExtractionResult>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn get(&self, id: &str) -> Option<&ExtractionResult> {
        self.results.get(&DocumentId::new(id))
    }

    /// Failed documents a caller may want to run again.
    pub fn retry_candidates(&self) -> Vec<&DocumentId> {
        self.results
            .values()
            .filter(|r| r.is_retryable())
            .map(|r| r.document_id())
            .collect()
    }

    /// Successful records in document-id order, each tagged with its `id`.
    pub fn products(&self) -> Vec<serde_json::Value> {
        self.results
            .values()
            .filter_map(|result| match result {
                ExtractionResult::Success {
                    document_id,
                    record,
                    ..
                } => {
                    let mut record = record.clone();
                    if let Some(obj) = record.as_object_mut() {
                        obj.insert("id".into(), serde_json::json!(document_id));
                    }
                    Some(record)
                }
                ExtractionResult::Failure { .. } => None,
            })
            .collect()
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
