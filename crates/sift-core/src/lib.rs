pub mod config;
pub mod corpus;
pub mod error;
pub mod images;
pub mod models;
pub mod orchestrator;
pub mod processor;
pub mod schema;
pub mod traits;
pub mod truth_sheet;

#[cfg(test)]
pub mod testutil;

pub use config::PipelineConfig;
pub use corpus::DirectoryCorpus;
pub use error::AppError;
pub use images::{ImageCandidate, ImagePolicy, ImageSource, RawImage};
pub use models::{
    Document, DocumentId, ExtractionResult, ExtractionUnit, FailureReason, HydrationRequest,
    RunReport, compute_hash,
};
pub use orchestrator::{Orchestrator, RunEvent, RunReporter, TracingRunReporter};
pub use processor::DocumentProcessor;
pub use schema::RecordSchema;
pub use traits::{Corpus, Distiller, Hydrator, ImageCollector, SignalExtractor};
pub use truth_sheet::{Field, FieldWrite, Provenance, TruthSheet};
