//! Test utilities: mock implementations of the pipeline traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! Mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::images::RawImage;
use crate::models::{DocumentId, HydrationRequest};
use crate::traits::{Distiller, Hydrator, ImageCollector, SignalExtractor};
use crate::truth_sheet::TruthSheet;

/// A record that satisfies the built-in product schema.
pub fn sample_product() -> serde_json::Value {
    serde_json::json!({
        "name": "Ceramic Mug",
        "price": {"price": 19.99, "currency": "USD", "compare_at_price": null},
        "description": "A sturdy stoneware mug.",
        "key_features": ["Dishwasher safe", "350 ml"],
        "image_urls": ["https://shop.com/products/mug.jpg"],
        "video_url": null,
        "category": {"name": "Kitchen"},
        "brand": "Acme",
        "colors": ["White"],
        "variants": [{
            "sku": "MUG-WHT",
            "color": "White",
            "size": null,
            "price": 19.99,
            "image_url": null
        }]
    })
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock signal extractor that returns a fixed truth sheet.
#[derive(Clone)]
pub struct MockExtractor {
    sheet: TruthSheet,
    panics: bool,
}

impl MockExtractor {
    pub fn new(sheet: TruthSheet) -> Self {
        Self {
            sheet,
            panics: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(TruthSheet::builder().build())
    }

    /// Creates an extractor that panics, simulating an internal fault.
    pub fn panicking() -> Self {
        Self {
            sheet: TruthSheet::builder().build(),
            panics: true,
        }
    }
}

impl SignalExtractor for MockExtractor {
    fn extract(&self, _html: &str) -> TruthSheet {
        if self.panics {
            panic!("mock extractor fault");
        }
        self.sheet.clone()
    }
}

// ---------------------------------------------------------------------------
// MockDistiller
// ---------------------------------------------------------------------------

/// Mock distiller that returns the input unchanged.
#[derive(Clone)]
pub struct MockDistiller {
    fails: bool,
}

impl MockDistiller {
    pub fn passthrough() -> Self {
        Self { fails: false }
    }

    pub fn failing() -> Self {
        Self { fails: true }
    }
}

impl Distiller for MockDistiller {
    fn distill(&self, html: &str) -> Result<String, AppError> {
        if self.fails {
            Err(AppError::DistillationError("mock distillation error".into()))
        } else {
            Ok(html.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// MockCollector
// ---------------------------------------------------------------------------

/// Mock image collector that returns a fixed list of raw images.
#[derive(Clone)]
pub struct MockCollector {
    images: Vec<RawImage>,
}

impl MockCollector {
    pub fn new(images: Vec<RawImage>) -> Self {
        Self { images }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl ImageCollector for MockCollector {
    fn collect(&self, _html: &str, _page_url: Option<&str>) -> Vec<RawImage> {
        self.images.clone()
    }
}

// ---------------------------------------------------------------------------
// MockHydrator
// ---------------------------------------------------------------------------

enum Behavior {
    Respond(serde_json::Value),
    Fail(AppError),
    Hang,
    Panic,
}

/// Mock hydrator with per-document behavior.
///
/// Documents without a configured behavior get [`sample_product`] with
/// `name` set to the document id. Configured behaviors are consumed on use.
#[derive(Clone, Default)]
pub struct MockHydrator {
    behaviors: Arc<Mutex<HashMap<DocumentId, Behavior>>>,
    requests: Arc<Mutex<Vec<HydrationRequest>>>,
    delay: Duration,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockHydrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_behavior(self, id: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(DocumentId::new(id), behavior);
        self
    }

    pub fn respond_for(self, id: &str, record: serde_json::Value) -> Self {
        self.with_behavior(id, Behavior::Respond(record))
    }

    pub fn fail_for(self, id: &str, error: AppError) -> Self {
        self.with_behavior(id, Behavior::Fail(error))
    }

    /// The call for `id` never completes on its own.
    pub fn hang_for(self, id: &str) -> Self {
        self.with_behavior(id, Behavior::Hang)
    }

    pub fn panic_for(self, id: &str) -> Self {
        self.with_behavior(id, Behavior::Panic)
    }

    /// Delay every call, so concurrent calls overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<HydrationRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Hydrator for MockHydrator {
    async fn hydrate(&self, request: &HydrationRequest) -> Result<serde_json::Value, AppError> {
        let document_id = request.unit.document_id.clone();
        let behavior = self.behaviors.lock().unwrap().remove(&document_id);
        self.requests.lock().unwrap().push(request.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match behavior {
            Some(Behavior::Respond(record)) => Ok(record),
            Some(Behavior::Fail(error)) => Err(error),
            Some(Behavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AppError::Generic("mock hang elapsed".into()))
            }
            Some(Behavior::Panic) => panic!("mock hydrator fault"),
            None => {
                let mut record = sample_product();
                record["name"] = serde_json::Value::String(document_id.to_string());
                Ok(record)
            }
        }
    }
}
