use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::models::{
    Document, DocumentId, DocumentStatus, ExtractionResult, FailureReason, RunReport,
};
use crate::processor::DocumentProcessor;
use crate::traits::{Corpus, Distiller, Hydrator, ImageCollector, SignalExtractor};

/// Events emitted during a run for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    Started {
        run_id: Uuid,
        documents: usize,
    },
    DocumentSucceeded {
        document_id: &'a DocumentId,
    },
    DocumentFailed {
        document_id: &'a DocumentId,
        reason: FailureReason,
        error: &'a str,
    },
    DuplicateSkipped {
        document_id: &'a DocumentId,
    },
    Cancelled {
        unfinished: usize,
    },
    Finished {
        run_id: Uuid,
        succeeded: usize,
        failed: usize,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Started { run_id, documents } => {
                tracing::info!(%run_id, documents, "Run started");
            }
            RunEvent::DocumentSucceeded { document_id } => {
                tracing::info!(%document_id, "Document succeeded");
            }
            RunEvent::DocumentFailed {
                document_id,
                reason,
                error,
            } => {
                tracing::warn!(%document_id, %reason, %error, "Document failed");
            }
            RunEvent::DuplicateSkipped { document_id } => {
                tracing::warn!(%document_id, "Duplicate document id, skipping");
            }
            RunEvent::Cancelled { unfinished } => {
                tracing::warn!(unfinished, "Run cancelled");
            }
            RunEvent::Finished {
                run_id,
                succeeded,
                failed,
            } => {
                tracing::info!(%run_id, succeeded, failed, "Run finished");
            }
        }
    }
}

/// Fans a corpus out across concurrent document tasks and gathers one
/// result per document.
///
/// A failing, hanging, or panicking document never affects its siblings;
/// the only run-level error is a corpus that cannot be enumerated.
pub struct Orchestrator<X, D, I, H>
where
    X: SignalExtractor,
    D: Distiller,
    I: ImageCollector,
    H: Hydrator,
{
    processor: Arc<DocumentProcessor<X, D, I, H>>,
    max_concurrency: usize,
}

impl<X, D, I, H> Orchestrator<X, D, I, H>
where
    X: SignalExtractor + 'static,
    D: Distiller + 'static,
    I: ImageCollector + 'static,
    H: Hydrator + 'static,
{
    pub fn new(processor: DocumentProcessor<X, D, I, H>, config: &PipelineConfig) -> Self {
        Self {
            processor: Arc::new(processor),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn processor(&self) -> &DocumentProcessor<X, D, I, H> {
        &self.processor
    }

    /// Run every document of the corpus to completion.
    pub async fn run<C, R>(&self, corpus: &C, reporter: &R) -> Result<RunReport, AppError>
    where
        C: Corpus,
        R: RunReporter,
    {
        self.run_until(corpus, CancellationToken::new(), reporter)
            .await
    }

    /// Like [`run`](Self::run), but stops early when `cancel` fires.
    ///
    /// Documents still in flight at cancellation are aborted and reported
    /// as [`FailureReason::Cancelled`].
    pub async fn run_until<C, R>(
        &self,
        corpus: &C,
        cancel: CancellationToken,
        reporter: &R,
    ) -> Result<RunReport, AppError>
    where
        C: Corpus,
        R: RunReporter,
    {
        let documents = corpus.discover().await?;
        Ok(self.process_all(documents, cancel, reporter).await)
    }

    /// Process an already-enumerated set of documents.
    pub async fn process_all<R>(
        &self,
        documents: Vec<Document>,
        cancel: CancellationToken,
        reporter: &R,
    ) -> RunReport
    where
        R: RunReporter,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        reporter.report(RunEvent::Started {
            run_id,
            documents: documents.len(),
        });

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut statuses = BTreeMap::new();
        let mut results = BTreeMap::new();
        let mut tasks = JoinSet::new();

        for document in documents {
            if statuses.contains_key(&document.id) {
                reporter.report(RunEvent::DuplicateSkipped {
                    document_id: &document.id,
                });
                continue;
            }
            statuses.insert(document.id.clone(), DocumentStatus::Pending);

            let processor = Arc::clone(&self.processor);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return ExtractionResult::failure(document.id.clone(), &AppError::Cancelled);
                };
                match AssertUnwindSafe(processor.process(&document))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => ExtractionResult::failure(
                        document.id.clone(),
                        &AppError::Generic(format!(
                            "Document processing panicked: {}",
                            panic_message(&*panic)
                        )),
                    ),
                }
            });
        }

        let mut cancelled = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => {
                        record(&mut results, &mut statuses, result, reporter);
                    }
                    Some(Err(e)) => {
                        // Tasks catch their own panics; only aborts land here.
                        tracing::error!(error = %e, "Document task ended abnormally");
                    }
                    None => break,
                },
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Ok(result) = joined {
                    record(&mut results, &mut statuses, result, reporter);
                }
            }
            reporter.report(RunEvent::Cancelled {
                unfinished: statuses.values().filter(|s| !s.is_terminal()).count(),
            });
        }

        // Anything still pending never produced a result of its own.
        for (document_id, status) in statuses {
            if !status.is_terminal() {
                let result = ExtractionResult::failure(document_id.clone(), &AppError::Cancelled);
                results.insert(document_id, result);
            }
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
        };
        reporter.report(RunEvent::Finished {
            run_id,
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        report
    }
}

fn record<R: RunReporter>(
    results: &mut BTreeMap<DocumentId, ExtractionResult>,
    statuses: &mut BTreeMap<DocumentId, DocumentStatus>,
    result: ExtractionResult,
    reporter: &R,
) {
    match &result {
        ExtractionResult::Success { document_id, .. } => {
            reporter.report(RunEvent::DocumentSucceeded { document_id });
        }
        ExtractionResult::Failure {
            document_id,
            reason,
            error,
            ..
        } => {
            reporter.report(RunEvent::DocumentFailed {
                document_id,
                reason: *reason,
                error,
            });
        }
    }
    let document_id = result.document_id().clone();
    statuses.insert(document_id.clone(), result.status());
    results.insert(document_id, result);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
