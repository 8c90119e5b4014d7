// src/pipeline.rs

use crate::doc_intel::{DocumentAnalyzer, ExtractionError};
use crate::normalize::{NormalizationError, Normalizer};
use crate::propagate::Propagator;
use crate::record::{FlatRecord, InvoiceRecord};
use crate::record_store::{RecordStore, StoreError, run_blocking};
use crate::sheet::SheetUpdate;
use lopdf::Document;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// Upload types the pipeline accepts, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: [&str; 5] = [".pdf", ".png", ".jpg", ".jpeg", ".tiff"];

/// Stage at which a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Staging,
    Extraction,
    Normalization,
    Persistence,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not stage document: {0}")]
    Staging(#[from] std::io::Error),
    #[error("document extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("normalization failed: {0}")]
    Normalization(#[from] NormalizationError),
    #[error("writing to table storage failed: {0}")]
    Persistence(#[from] StoreError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Staging(_) => Stage::Staging,
            Self::Extraction(_) => Stage::Extraction,
            Self::Normalization(_) => Stage::Normalization,
            Self::Persistence(_) => Stage::Persistence,
        }
    }
}

/// What happened to the best-effort spreadsheet propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Propagation {
    Disabled,
    Sent(SheetUpdate),
    Failed { update: SheetUpdate, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Unsupported file type; no collaborator was called.
    Skipped { name: String },
    Completed {
        record: InvoiceRecord,
        propagation: Propagation,
    },
}

/// Propagation collaborator plus the plant/utility the derived value belongs to.
pub struct PropagationTarget {
    pub propagator: Arc<dyn Propagator>,
    pub plant_id: String,
    pub utility_type: String,
}

pub fn is_supported(name: &str) -> bool {
    let lower = name.to_lowercase();
    SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Base name of an object without directories or extension.
pub fn partition_key_for(name: &str) -> String {
    let path = Path::new(name);
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// `YYYY-MM` taken from the first seven characters of an invoice date.
pub fn year_month_of(invoice_date: &str) -> String {
    invoice_date.chars().take(7).collect()
}

/// The uploaded body written to a temporary file. The file is removed on drop.
struct StagedDocument {
    file: NamedTempFile,
}

impl StagedDocument {
    fn create(name: &str, body: &[u8]) -> std::io::Result<Self> {
        let suffix = Path::new(name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("invoice-")
            .suffix(&suffix)
            .tempfile()?;
        file.write_all(body)?;
        file.flush()?;
        Ok(Self { file })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Drop for StagedDocument {
    fn drop(&mut self) {
        info!(path = %self.file.path().display(), "Temp file cleaned up");
    }
}

/// Page count of a PDF body, for diagnostics only.
fn probe_pdf_pages(body: &[u8]) -> Option<usize> {
    match Document::load_mem(body) {
        Ok(doc) => Some(doc.get_pages().len()),
        Err(e) => {
            warn!(error = %e, "Could not read PDF structure");
            None
        }
    }
}

/// Drives one uploaded document from staging to persistence and propagation.
pub struct Pipeline {
    analyzer: Arc<dyn DocumentAnalyzer>,
    normalizer: Normalizer,
    store: Arc<dyn RecordStore>,
    propagation: Option<PropagationTarget>,
}

impl Pipeline {
    pub fn new(
        analyzer: Arc<dyn DocumentAnalyzer>,
        normalizer: Normalizer,
        store: Arc<dyn RecordStore>,
        propagation: Option<PropagationTarget>,
    ) -> Self {
        Self {
            analyzer,
            normalizer,
            store,
            propagation,
        }
    }

    pub async fn process(&self, name: &str, body: &[u8]) -> Result<PipelineOutcome, PipelineError> {
        let span = info_span!("pipeline", name = %name, bytes = body.len());
        self.run(name, body)
            .instrument(span)
            .await
            .inspect_err(|e| error!(name = %name, stage = ?e.stage(), error = %e, "Pipeline error"))
    }

    async fn run(&self, name: &str, body: &[u8]) -> Result<PipelineOutcome, PipelineError> {
        info!("Received upload");

        if !is_supported(name) {
            warn!("Skipping unsupported file type");
            return Ok(PipelineOutcome::Skipped {
                name: name.to_string(),
            });
        }

        let staged = StagedDocument::create(name, body)?;
        info!(path = %staged.path().display(), "Saved upload to local temp file");
        if name.to_lowercase().ends_with(".pdf") {
            if let Some(pages) = probe_pdf_pages(body) {
                info!(pages, "PDF staged");
            }
        }

        info!("Starting document extraction");
        let raw = self.analyzer.analyze(staged.path()).await?;
        info!(
            fields = raw.fields.len(),
            tables = raw.tables.len(),
            "Document extraction successful"
        );

        info!("Starting normalization");
        let record = self.normalizer.normalize(&raw).await?;
        drop(raw);

        info!("Persisting invoice entity");
        let persisted = self.persist(name, record).await?;
        drop(staged);

        let propagation = self.propagate(&persisted).await;
        Ok(PipelineOutcome::Completed {
            record: persisted,
            propagation,
        })
    }

    async fn persist(&self, name: &str, record: FlatRecord) -> Result<InvoiceRecord, StoreError> {
        let partition_key = partition_key_for(name);
        let row_key = Uuid::new_v4().to_string();
        let persisted = run_blocking(&self.store, move |store| {
            store.upsert(&partition_key, &row_key, &record)
        })
        .await?;
        info!(
            partition_key = %persisted.partition_key,
            row_key = %persisted.row_key,
            "Inserted invoice entity into table storage"
        );
        Ok(persisted)
    }

    async fn propagate(&self, persisted: &InvoiceRecord) -> Propagation {
        let Some(target) = &self.propagation else {
            return Propagation::Disabled;
        };

        let fields = &persisted.record.fields;
        let update = SheetUpdate {
            year_month: year_month_of(&fields.invoice_date),
            value: fields.energy_usage_kwh.clone(),
            plant_id: target.plant_id.clone(),
            utility_type: target.utility_type.clone(),
        };
        info!(
            year_month = %update.year_month,
            value = %update.value,
            plant_id = %update.plant_id,
            "Propagating energy usage to spreadsheet"
        );

        match target.propagator.propagate(&update).await {
            Ok(()) => Propagation::Sent(update),
            Err(e) => {
                error!(error = %e, "Failed to propagate to Excel update");
                Propagation::Failed {
                    update,
                    error: e.to_string(),
                }
            }
        }
    }
}
