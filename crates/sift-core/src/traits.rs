use std::future::Future;

use crate::error::AppError;
use crate::images::RawImage;
use crate::models::{Document, HydrationRequest};
use crate::truth_sheet::TruthSheet;

/// Builds a truth sheet from the machine-readable signals in one HTML page.
///
/// Never fails: malformed blocks are skipped and an empty sheet is a valid result.
pub trait SignalExtractor: Send + Sync + Clone {
    fn extract(&self, html: &str) -> TruthSheet;
}

/// Reduces raw HTML to the readable text of its main content region.
pub trait Distiller: Send + Sync + Clone {
    fn distill(&self, html: &str) -> Result<String, AppError>;
}

/// Collects every absolute image reference in an HTML page.
pub trait ImageCollector: Send + Sync + Clone {
    /// `page_url` resolves relative references when the page has no `<base href>`.
    fn collect(&self, html: &str, page_url: Option<&str>) -> Vec<RawImage>;
}

/// Turns an extraction unit into a structured record, typically via an LLM.
// TODO: Add a local-model Hydrator impl for offline runs
pub trait Hydrator: Send + Sync + Clone {
    fn hydrate(
        &self,
        request: &HydrationRequest,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Enumerates the documents of one run.
pub trait Corpus: Send + Sync {
    /// Fails only when the corpus cannot be enumerated at all.
    fn discover(&self) -> impl Future<Output = Result<Vec<Document>, AppError>> + Send;
}

/// An in-memory corpus.
impl Corpus for Vec<Document> {
    async fn discover(&self) -> Result<Vec<Document>, AppError> {
        Ok(self.clone())
    }
}
