use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tracing::Instrument;

use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::images::{ImagePolicy, identity_key, is_non_product_url, select_candidates};
use crate::models::{
    DistilledContent, Document, ExtractionResult, ExtractionUnit, HydrationRequest, compute_hash,
};
use crate::schema::RecordSchema;
use crate::traits::{Distiller, Hydrator, ImageCollector, SignalExtractor};

/// Record field holding the product image list.
const IMAGE_FIELD: &str = "image_urls";

/// Runs one document through extraction, hydration, and validation.
///
/// Generic over all collaborators via traits, so tests can swap in mocks
/// without real HTML parsing or LLM calls. [`process`](Self::process) never
/// returns an error: every per-document problem becomes a failure result.
pub struct DocumentProcessor<X, D, I, H>
where
    X: SignalExtractor,
    D: Distiller,
    I: ImageCollector,
    H: Hydrator,
{
    extractor: X,
    distiller: D,
    collector: I,
    hydrator: H,
    schema: Arc<RecordSchema>,
    hydration_timeout: Duration,
    image_policy: ImagePolicy,
}

impl<X, D, I, H> DocumentProcessor<X, D, I, H>
where
    X: SignalExtractor + 'static,
    D: Distiller + 'static,
    I: ImageCollector + 'static,
    H: Hydrator,
{
    pub fn new(
        extractor: X,
        distiller: D,
        collector: I,
        hydrator: H,
        schema: RecordSchema,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            extractor,
            distiller,
            collector,
            hydrator,
            schema: Arc::new(schema),
            hydration_timeout: config.hydration_timeout,
            image_policy: config.image_policy.clone(),
        }
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Process one document end to end.
    pub async fn process(&self, document: &Document) -> ExtractionResult {
        let span = tracing::info_span!("document", id = %document.id);
        match self.try_process(document).instrument(span.clone()).await {
            Ok(result) => result,
            Err(e) => {
                span.in_scope(|| {
                    tracing::warn!(reason = %e.failure_reason(), error = %e, "Document failed");
                });
                ExtractionResult::failure(document.id.clone(), &e)
            }
        }
    }

    /// Build the extraction unit for a document without hydrating it.
    pub async fn prepare(&self, document: &Document) -> Result<ExtractionUnit, AppError> {
        let html = document.load().await?;
        self.assemble(document, html).await
    }

    async fn try_process(&self, document: &Document) -> Result<ExtractionResult, AppError> {
        // 1. Load
        let html = document.load().await?;
        let content_hash = compute_hash(&html);

        // 2. Extract (three independent sub-steps)
        let unit = self.assemble(document, html).await?;
        tracing::info!(
            fields = unit.truth_sheet.len(),
            skipped_blocks = unit.truth_sheet.skipped_blocks(),
            distilled_bytes = unit.distilled.as_str().len(),
            images = unit.images.len(),
            image_starved = unit.image_starved,
            "Extraction unit assembled"
        );

        // 3. Hydrate
        let request = HydrationRequest {
            unit,
            schema: self.schema.schema.clone(),
        };
        let record = tokio::time::timeout(self.hydration_timeout, self.hydrator.hydrate(&request))
            .await
            .map_err(|_| AppError::Timeout(self.hydration_timeout))??;

        // 4. Normalize + validate
        let record = normalize_record(record, &request.unit);
        self.schema.validate(&record)?;

        let data_hash = compute_hash(&record.to_string());
        tracing::info!(data_hash = %&data_hash[..8], "Record validated");

        Ok(ExtractionResult::Success {
            document_id: document.id.clone(),
            record,
            content_hash,
            data_hash,
        })
    }

    async fn assemble(
        &self,
        document: &Document,
        html: Arc<str>,
    ) -> Result<ExtractionUnit, AppError> {
        let structured = {
            let extractor = self.extractor.clone();
            let html = Arc::clone(&html);
            tokio::task::spawn_blocking(move || extractor.extract(&html))
        };
        let distilled = {
            let distiller = self.distiller.clone();
            let html = Arc::clone(&html);
            tokio::task::spawn_blocking(move || distiller.distill(&html))
        };
        let images = {
            let collector = self.collector.clone();
            let page_url = document.url.clone();
            let policy = self.image_policy.clone();
            tokio::task::spawn_blocking(move || {
                let raw = collector.collect(&html, page_url.as_deref());
                select_candidates(&raw, &policy)
            })
        };

        let (structured, distilled, images) = tokio::join!(structured, distilled, images);

        let truth_sheet = structured.map_err(|e| sub_step_failed("structured extraction", e))?;
        let distilled = match distilled.map_err(|e| sub_step_failed("distillation", e))? {
            Ok(text) => DistilledContent::new(text),
            Err(e) => {
                tracing::warn!(error = %e, "Distillation failed, continuing without content");
                DistilledContent::empty()
            }
        };
        let selection = images.map_err(|e| sub_step_failed("image selection", e))?;

        Ok(ExtractionUnit {
            document_id: document.id.clone(),
            truth_sheet,
            distilled,
            images: selection.candidates,
            image_starved: selection.starved,
        })
    }
}

fn sub_step_failed(step: &str, e: JoinError) -> AppError {
    AppError::Generic(format!("{step} task failed: {e}"))
}

/// Clean up the record's image list: drop non-product URLs and
/// identity-duplicates, and back-fill an empty list from the unit.
fn normalize_record(mut record: serde_json::Value, unit: &ExtractionUnit) -> serde_json::Value {
    if let Some(serde_json::Value::Array(urls)) = record.get_mut(IMAGE_FIELD) {
        let mut seen = HashSet::new();
        urls.retain(|url| match url.as_str() {
            Some(url) => !is_non_product_url(url) && seen.insert(identity_key(url)),
            None => false,
        });

        if urls.is_empty() {
            let fallback = unit
                .images
                .first()
                .map(|c| c.url.clone())
                .or_else(|| unit.truth_sheet.image_urls().first().cloned());
            if let Some(url) = fallback {
                urls.push(serde_json::Value::String(url));
            }
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{ImageSource, RawImage};
    use crate::models::FailureReason;
    use crate::testutil::*;
    use crate::truth_sheet::{Field, FieldWrite, Provenance, TruthSheet};

    fn config() -> PipelineConfig {
        PipelineConfig::default().with_hydration_timeout(Duration::from_millis(200))
    }

    fn processor(
        hydrator: MockHydrator,
    ) -> DocumentProcessor<MockExtractor, MockDistiller, MockCollector, MockHydrator> {
        DocumentProcessor::new(
            MockExtractor::empty(),
            MockDistiller::passthrough(),
            MockCollector::empty(),
            hydrator,
            RecordSchema::product().unwrap(),
            &config(),
        )
    }

    fn doc(id: &str) -> Document {
        Document::from_html(id, "<html><body><p>A mug</p></body></html>")
    }

    #[tokio::test]
    async fn happy_path_returns_validated_record() {
        let hydrator = MockHydrator::new();
        let result = processor(hydrator.clone()).process(&doc("mug")).await;

        match result {
            ExtractionResult::Success {
                document_id,
                record,
                content_hash,
                data_hash,
            } => {
                assert_eq!(document_id.as_str(), "mug");
                assert_eq!(record["name"], "mug");
                assert_eq!(content_hash.len(), 64);
                assert_eq!(data_hash.len(), 64);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(hydrator.requests().len(), 1);
    }

    #[tokio::test]
    async fn hydration_request_carries_all_three_outputs() {
        let mut builder = TruthSheet::builder();
        builder.apply(
            Provenance::LinkedData,
            FieldWrite::text(Field::Name, "Ceramic Mug").unwrap(),
        );
        let hydrator = MockHydrator::new();
        let processor = DocumentProcessor::new(
            MockExtractor::new(builder.build()),
            MockDistiller::passthrough(),
            MockCollector::new(vec![RawImage::new(
                "https://shop.com/products/mug.jpg",
                ImageSource::Img,
            )]),
            hydrator.clone(),
            RecordSchema::product().unwrap(),
            &config(),
        );

        processor.process(&doc("mug")).await;

        let request = &hydrator.requests()[0];
        assert_eq!(request.unit.truth_sheet.text(Field::Name), Some("Ceramic Mug"));
        assert!(request.unit.distilled.as_str().contains("A mug"));
        assert_eq!(request.unit.images.len(), 1);
        assert_eq!(request.schema["type"], "object");
    }

    #[tokio::test]
    async fn distillation_failure_continues_with_empty_content() {
        let hydrator = MockHydrator::new();
        let processor = DocumentProcessor::new(
            MockExtractor::empty(),
            MockDistiller::failing(),
            MockCollector::empty(),
            hydrator.clone(),
            RecordSchema::product().unwrap(),
            &config(),
        );

        let result = processor.process(&doc("mug")).await;

        assert!(result.is_success());
        assert!(hydrator.requests()[0].unit.distilled.is_empty());
    }

    #[tokio::test]
    async fn hydration_error_is_hydration_failure() {
        let hydrator = MockHydrator::new().fail_for(
            "mug",
            AppError::HydrationError {
                message: "overloaded".into(),
                status_code: 503,
                retryable: true,
            },
        );
        let result = processor(hydrator).process(&doc("mug")).await;
        assert_eq!(result.reason(), Some(FailureReason::HydrationFailure));
    }

    #[tokio::test]
    async fn hydration_timeout_is_hydration_failure() {
        let hydrator = MockHydrator::new().hang_for("mug");
        let result = processor(hydrator).process(&doc("mug")).await;

        match result {
            ExtractionResult::Failure { reason, error, .. } => {
                assert_eq!(reason, FailureReason::HydrationFailure);
                assert!(error.contains("timed out"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_record_is_validation_failure() {
        let hydrator =
            MockHydrator::new().respond_for("mug", serde_json::json!({"name": "Mug"}));
        let result = processor(hydrator).process(&doc("mug")).await;
        assert_eq!(result.reason(), Some(FailureReason::ValidationFailure));
    }

    #[tokio::test]
    async fn extractor_fault_is_extraction_failure() {
        let processor = DocumentProcessor::new(
            MockExtractor::panicking(),
            MockDistiller::passthrough(),
            MockCollector::empty(),
            MockHydrator::new(),
            RecordSchema::product().unwrap(),
            &config(),
        );
        let result = processor.process(&doc("mug")).await;
        assert_eq!(result.reason(), Some(FailureReason::ExtractionFailure));
    }

    #[tokio::test]
    async fn unreadable_document_is_extraction_failure() {
        let result = processor(MockHydrator::new())
            .process(&Document::from_file("/no/such/page.html"))
            .await;
        assert_eq!(result.reason(), Some(FailureReason::ExtractionFailure));
        assert_eq!(result.document_id().as_str(), "page");
    }

    #[tokio::test]
    async fn empty_image_list_is_backfilled_from_candidates() {
        let mut record = sample_product();
        record["image_urls"] = serde_json::json!([]);
        let processor = DocumentProcessor::new(
            MockExtractor::empty(),
            MockDistiller::passthrough(),
            MockCollector::new(vec![RawImage::new(
                "https://shop.com/products/mug.jpg",
                ImageSource::Img,
            )]),
            MockHydrator::new().respond_for("mug", record),
            RecordSchema::product().unwrap(),
            &config(),
        );

        let result = processor.process(&doc("mug")).await;
        let record = result.record().unwrap();
        assert_eq!(
            record["image_urls"],
            serde_json::json!(["https://shop.com/products/mug.jpg"])
        );
    }

    #[tokio::test]
    async fn non_product_and_duplicate_record_images_are_dropped() {
        let mut record = sample_product();
        record["image_urls"] = serde_json::json!([
            "https://shop.com/assets/logo.png",
            "https://cdn.shop.com/mug_800x800.jpg",
            "https://cdn.shop.com/mug_1600x1600.jpg"
        ]);
        let result = processor(MockHydrator::new().respond_for("mug", record))
            .process(&doc("mug"))
            .await;

        assert_eq!(
            result.record().unwrap()["image_urls"],
            serde_json::json!(["https://cdn.shop.com/mug_800x800.jpg"])
        );
    }

    #[tokio::test]
    async fn prepare_reports_image_starvation() {
        let processor = DocumentProcessor::new(
            MockExtractor::empty(),
            MockDistiller::passthrough(),
            MockCollector::new(vec![
                RawImage::new("https://shop.com/tiny.jpg", ImageSource::Img)
                    .with_dimensions(Some(40), Some(40)),
            ]),
            MockHydrator::new(),
            RecordSchema::product().unwrap(),
            &config(),
        );

        let unit = processor.prepare(&doc("mug")).await.unwrap();
        assert!(unit.image_starved);
        assert_eq!(unit.images.len(), 1);
    }
}
