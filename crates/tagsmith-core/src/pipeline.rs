//! # Pipeline orchestration
//!
//! Drives one generated unit through
//! `Start -> IdentifierAssigned -> Rendered -> Transcoded -> Published -> Persisted`.
//! Any stage may fail, which ends the unit in `Failed(stage, cause)`, reported
//! as a [`PipelineError`].
//!
//! Bulk requests repeat the unit sequentially and stop at the first failure.
//! Units completed before that failure stay published and persisted.
//!
//! Publish and persist attempts are bounded by a per-attempt timeout and
//! retried on transient errors only, per [`RetryPolicy`]. Render and transcode
//! are CPU and file bound and run on the blocking pool.
//!
//! A timed-out or dropped attempt may still have landed. Identifiers are
//! unique per unit, so a conflict reported on a retry means an earlier attempt
//! succeeded and the unit carries on. An uploaded object is never removed
//! after an attempt whose outcome is unknown.

use crate::{
    error::{Error, PersistError, PipelineError, PublishError},
    identifier::{IdScheme, IdentifierGenerator},
    publish::Publisher,
    render::{LinearBarcodeRenderer, QrRenderer, SymbolRenderer, Symbology},
    store::RecordStore,
    transcode::Transcoder,
    types::{
        CompactImage, Identifier, PublishedRecord, RecordFields, RecordSummary, SymbolKind,
        TableSelector,
    },
};
use core::{fmt, future::Future, time::Duration};
use std::{path::PathBuf, sync::Arc};

pub const DEFAULT_MAX_QUANTITY: u32 = 1000;
pub const DEFAULT_BARCODE_BUCKET: &str = "barcodes_new";
pub const DEFAULT_QR_BUCKET: &str = "qrcodes_new";

/// Progress of a unit. A [`PipelineError`] carries the stage the unit was
/// working toward when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Request validation, before any side effect.
    Start,
    IdentifierAssigned,
    Rendered,
    Transcoded,
    Published,
    Persisted,
}

impl Stage {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Start => "validate",
            Self::IdentifierAssigned => "identify",
            Self::Rendered => "render",
            Self::Transcoded => "transcode",
            Self::Published => "publish",
            Self::Persisted => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a request asks the pipeline to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    BulkBarcode,
    BulkQr,
    SingleBarcode,
    SingleQr,
}

impl Operation {
    pub const fn bulk(kind: SymbolKind) -> Self {
        match kind {
            SymbolKind::Barcode => Self::BulkBarcode,
            SymbolKind::Qr => Self::BulkQr,
        }
    }

    pub const fn single(kind: SymbolKind) -> Self {
        match kind {
            SymbolKind::Barcode => Self::SingleBarcode,
            SymbolKind::Qr => Self::SingleQr,
        }
    }

    pub const fn kind(self) -> SymbolKind {
        match self {
            Self::BulkBarcode | Self::SingleBarcode => SymbolKind::Barcode,
            Self::BulkQr | Self::SingleQr => SymbolKind::Qr,
        }
    }

    pub const fn table(self) -> TableSelector {
        match self {
            Self::BulkBarcode => TableSelector::LegacyBarcode,
            Self::SingleBarcode => TableSelector::Product,
            Self::BulkQr | Self::SingleQr => TableSelector::QrCode,
        }
    }

    pub const fn is_single(self) -> bool {
        matches!(self, Self::SingleBarcode | Self::SingleQr)
    }

    /// Text encoded into the symbol. Single-item QR codes embed the value
    /// next to the identifier; everything else encodes the identifier alone.
    pub fn payload(self, value: &str, identifier: &Identifier) -> String {
        match self {
            Self::SingleQr => format!("Product: {value}, ID: {identifier}"),
            _ => identifier.to_string(),
        }
    }

    /// Only single-item records keep a base64 copy, and only in tables that
    /// have a column for it.
    pub fn keeps_inline_copy(self) -> bool {
        self.is_single() && self.table().stores_inline_copy()
    }
}

/// Bounded retry for transient publish and persist failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each retry.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

/// Routing and hardening knobs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub barcode_bucket: String,
    pub qr_bucket: String,
    pub max_quantity: u32,
    pub retry: RetryPolicy,
    /// Per-attempt bound on publish and persist calls.
    pub stage_timeout: Duration,
    /// Delete the uploaded object when its record can't be written. Skipped
    /// when an insert attempt timed out, since that row may exist.
    pub remove_orphans: bool,
    /// Keep the scratch PNG and JPEG after a unit ends.
    pub retain_scratch: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            barcode_bucket: DEFAULT_BARCODE_BUCKET.to_string(),
            qr_bucket: DEFAULT_QR_BUCKET.to_string(),
            max_quantity: DEFAULT_MAX_QUANTITY,
            retry: RetryPolicy::default(),
            stage_timeout: Duration::from_secs(30),
            remove_orphans: false,
            retain_scratch: false,
        }
    }
}

impl PipelineSettings {
    pub fn bucket_for(&self, kind: SymbolKind) -> &str {
        match kind {
            SymbolKind::Barcode => &self.barcode_bucket,
            SymbolKind::Qr => &self.qr_bucket,
        }
    }
}

/// Hooks for counting pipeline outcomes. All methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    fn unit_persisted(&self, _kind: SymbolKind) {}
    fn stage_failed(&self, _stage: Stage) {}
    fn orphan_removed(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Errors that may clear up on their own.
trait Transient: Sized {
    fn retryable(&self) -> bool;
    /// The failed call may still have taken effect.
    fn indeterminate(&self) -> bool;
    /// The target already exists.
    fn conflict(&self) -> bool;
    fn timed_out(after: Duration) -> Self;
}

impl Transient for PublishError {
    fn retryable(&self) -> bool {
        self.is_transient()
    }

    fn indeterminate(&self) -> bool {
        self.is_indeterminate()
    }

    fn conflict(&self) -> bool {
        self.is_conflict()
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl Transient for PersistError {
    fn retryable(&self) -> bool {
        self.is_transient()
    }

    fn indeterminate(&self) -> bool {
        self.is_indeterminate()
    }

    fn conflict(&self) -> bool {
        self.is_conflict()
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

/// Final failure of a retried call.
#[derive(Debug)]
struct Exhausted<E> {
    error: E,
    /// More than one attempt was made.
    retried: bool,
    /// Some attempt ended without a definite outcome.
    uncertain: bool,
}

impl<E: Transient> Exhausted<E> {
    /// An earlier attempt succeeded and this one collided with its result.
    fn landed(&self) -> bool {
        self.retried && self.error.conflict()
    }
}

/// Scratch files written by one unit.
#[derive(Default)]
struct Scratch(Vec<PathBuf>);

impl Scratch {
    fn track(&mut self, path: PathBuf) {
        self.0.push(path);
    }

    async fn sweep(self) {
        for path in self.0 {
            if let Err(_e) = tokio::fs::remove_file(&path).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(path = %path.display(), error = %_e, "scratch file not removed");
            }
        }
    }
}

/// Assembles a [`Pipeline`]. Publisher and store are required; everything
/// else has a default (ULID identifiers, Code 128, system temp dir).
pub struct PipelineBuilder {
    publisher: Publisher,
    store: Arc<dyn RecordStore>,
    ids: Option<Arc<dyn IdentifierGenerator>>,
    barcode: Option<Arc<dyn SymbolRenderer>>,
    qr: Option<Arc<dyn SymbolRenderer>>,
    transcoder: Transcoder,
    settings: PipelineSettings,
    observer: Arc<dyn PipelineObserver>,
}

impl PipelineBuilder {
    pub fn new(publisher: Publisher, store: Arc<dyn RecordStore>) -> Self {
        Self {
            publisher,
            store,
            ids: None,
            barcode: None,
            qr: None,
            transcoder: Transcoder::default(),
            settings: PipelineSettings::default(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn identifiers(mut self, ids: Arc<dyn IdentifierGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn barcode_renderer(mut self, renderer: Arc<dyn SymbolRenderer>) -> Self {
        self.barcode = Some(renderer);
        self
    }

    pub fn qr_renderer(mut self, renderer: Arc<dyn SymbolRenderer>) -> Self {
        self.qr = Some(renderer);
        self
    }

    pub fn transcoder(mut self, transcoder: Transcoder) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> Pipeline {
        let scratch = std::env::temp_dir();
        Pipeline {
            ids: self.ids.unwrap_or_else(|| IdScheme::default().build()),
            barcode: self.barcode.unwrap_or_else(|| {
                Arc::new(LinearBarcodeRenderer::new(
                    Symbology::default(),
                    scratch.clone(),
                ))
            }),
            qr: self
                .qr
                .unwrap_or_else(|| Arc::new(QrRenderer::new(scratch))),
            transcoder: self.transcoder,
            publisher: self.publisher,
            store: self.store,
            settings: self.settings,
            observer: self.observer,
        }
    }
}

/// The artifact pipeline. Built once per process and shared behind an `Arc`.
pub struct Pipeline {
    ids: Arc<dyn IdentifierGenerator>,
    barcode: Arc<dyn SymbolRenderer>,
    qr: Arc<dyn SymbolRenderer>,
    transcoder: Transcoder,
    publisher: Publisher,
    store: Arc<dyn RecordStore>,
    settings: PipelineSettings,
    observer: Arc<dyn PipelineObserver>,
}

impl Pipeline {
    pub fn builder(publisher: Publisher, store: Arc<dyn RecordStore>) -> PipelineBuilder {
        PipelineBuilder::new(publisher, store)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Generates `quantity` units named `name`, one after another.
    ///
    /// # Errors
    ///
    /// - [`Stage::Start`] with [`Error::Validation`] if `name` is blank or
    ///   `quantity` is outside `1..=max_quantity`. Nothing is rendered.
    /// - The first unit failure. Earlier units are not rolled back.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip(self, name), fields(kind = kind.label())))]
    pub async fn generate_batch(
        &self,
        kind: SymbolKind,
        name: &str,
        quantity: u32,
    ) -> Result<Vec<PublishedRecord>, PipelineError> {
        let name = require_text(name, "name")?;
        if quantity == 0 || quantity > self.settings.max_quantity {
            return Err(invalid(format!(
                "quantity must be between 1 and {}",
                self.settings.max_quantity
            )));
        }

        let operation = Operation::bulk(kind);
        let mut records = Vec::with_capacity(quantity as usize);
        for _ in 0..quantity {
            records.push(self.run_unit(operation, name).await?);
        }
        Ok(records)
    }

    /// Generates one unit for `value`, keeping an inline base64 copy.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "info", skip(self, value), fields(kind = kind.label())))]
    pub async fn generate_single(
        &self,
        kind: SymbolKind,
        value: &str,
    ) -> Result<PublishedRecord, PipelineError> {
        let value = require_text(value, "value")?;
        self.run_unit(Operation::single(kind), value).await
    }

    /// Resolves an identifier against the product and QR tables.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a blank identifier, [`Error::NotFound`] on a
    /// miss, [`Error::Persist`] if the store fails.
    pub async fn lookup(&self, identifier: &str) -> Result<RecordSummary, Error> {
        let identifier = Identifier::new(
            require_text(identifier, "unique_id").map_err(|e| e.source)?,
        );
        let found = self
            .attempt(|| self.store.lookup(&identifier))
            .await
            .map_err(|failure| failure.error)?;
        found.ok_or_else(|| Error::NotFound {
            identifier: identifier.into_inner(),
        })
    }

    async fn run_unit(
        &self,
        operation: Operation,
        name: &str,
    ) -> Result<PublishedRecord, PipelineError> {
        let mut scratch = Scratch::default();
        let outcome = self.drive_unit(operation, name, &mut scratch).await;

        if !self.settings.retain_scratch {
            scratch.sweep().await;
        }

        match &outcome {
            Ok(_) => self.observer.unit_persisted(operation.kind()),
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(stage = %err.stage, error = %err.source, "unit failed");
                self.observer.stage_failed(err.stage);
            }
        }
        outcome
    }

    async fn drive_unit(
        &self,
        operation: Operation,
        name: &str,
        scratch: &mut Scratch,
    ) -> Result<PublishedRecord, PipelineError> {
        let kind = operation.kind();
        let identifier = self
            .ids
            .new_identifier(name)
            .map_err(|e| PipelineError::new(Stage::IdentifierAssigned, e))?;

        let renderer = Arc::clone(match kind {
            SymbolKind::Barcode => &self.barcode,
            SymbolKind::Qr => &self.qr,
        });
        let payload = operation.payload(name, &identifier);
        let id = identifier.clone();
        let raster = tokio::task::spawn_blocking(move || renderer.render(&payload, &id))
            .await
            .map_err(|e| PipelineError::new(Stage::Rendered, Error::Worker(e.to_string())))?
            .map_err(|e| PipelineError::new(Stage::Rendered, e))?;
        scratch.track(raster.path.clone());

        let transcoder = self.transcoder;
        let compact = tokio::task::spawn_blocking(move || transcoder.to_compact(&raster))
            .await
            .map_err(|e| PipelineError::new(Stage::Transcoded, Error::Worker(e.to_string())))?
            .map_err(|e| PipelineError::new(Stage::Transcoded, e))?;
        scratch.track(compact.path.clone());

        let encoded_copy = operation
            .keeps_inline_copy()
            .then(|| self.transcoder.to_encoded_text(&compact));

        let bucket = self.settings.bucket_for(kind);
        let public_url = match self
            .attempt(|| self.publisher.publish(&compact, &identifier, bucket))
            .await
        {
            Ok(url) => url,
            Err(failure) if failure.landed() => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%identifier, "object already uploaded by an earlier attempt");
                self.publisher.url_for(&compact, &identifier, bucket)
            }
            Err(failure) => return Err(PipelineError::new(Stage::Published, failure.error)),
        };

        let fields = RecordFields {
            name: name.to_string(),
            identifier,
            public_url,
            encoded_copy,
        };
        let table = operation.table();
        match self.attempt(|| self.store.insert(table, &fields)).await {
            Ok(()) => {}
            Err(failure) if failure.landed() => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    identifier = %fields.identifier,
                    "row written by an earlier attempt"
                );
            }
            Err(failure) => {
                if self.settings.remove_orphans && !failure.uncertain {
                    self.remove_orphan(&compact, &fields.identifier, bucket)
                        .await;
                }
                return Err(PipelineError::new(Stage::Persisted, failure.error));
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(identifier = %fields.identifier, table = table.table(), "unit persisted");

        Ok(fields.into())
    }

    async fn remove_orphan(
        &self,
        compact: &CompactImage,
        identifier: &Identifier,
        bucket: &str,
    ) {
        match self.publisher.unpublish(compact, identifier, bucket).await {
            Ok(()) => self.observer.orphan_removed(),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%identifier, error = %_e, "orphaned object left in storage");
            }
        }
    }

    /// Runs `op` under the stage timeout, retrying transient failures.
    async fn attempt<T, E, F, Fut>(&self, mut op: F) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let policy = self.settings.retry;
        let limit = self.settings.stage_timeout;
        let mut attempt = 1;
        let mut uncertain = false;
        loop {
            let outcome = match tokio::time::timeout(limit, op()).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(E::timed_out(limit)),
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            uncertain |= err.indeterminate();
            if err.retryable() && attempt < policy.max_attempts {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, error = %err, "transient failure, retrying");
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
                continue;
            }
            return Err(Exhausted {
                error: err,
                retried: attempt > 1,
                uncertain,
            });
        }
    }
}

fn invalid(reason: impl Into<String>) -> PipelineError {
    PipelineError::new(
        Stage::Start,
        Error::Validation {
            reason: reason.into(),
        },
    )
}

fn require_text<'a>(text: &'a str, field: &str) -> Result<&'a str, PipelineError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(invalid(format!("{field} must not be empty")))
    } else {
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::IdentifierError,
        testing::{MemoryRecordStore, MemoryStorage, StorageFault, StoreFault},
        types::{CompactFormat, storage_key},
    };
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    const ROOT: &str = "https://proj.supabase.co";

    struct Harness {
        pipeline: Pipeline,
        storage: Arc<MemoryStorage>,
        store: Arc<MemoryRecordStore>,
        scratch: TempDir,
    }

    fn harness(settings: PipelineSettings) -> Harness {
        harness_with(settings, IdScheme::Ulid.build(), Symbology::Code128)
    }

    fn harness_with(
        settings: PipelineSettings,
        ids: Arc<dyn IdentifierGenerator>,
        symbology: Symbology,
    ) -> Harness {
        let scratch = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(MemoryRecordStore::new());
        let pipeline = Pipeline::builder(Publisher::new(storage.clone(), ROOT), store.clone())
            .identifiers(ids)
            .barcode_renderer(Arc::new(LinearBarcodeRenderer::new(
                symbology,
                scratch.path(),
            )))
            .qr_renderer(Arc::new(QrRenderer::new(scratch.path())))
            .settings(settings)
            .build();
        Harness {
            pipeline,
            storage,
            store,
            scratch,
        }
    }

    fn quick() -> PipelineSettings {
        PipelineSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
            stage_timeout: Duration::from_secs(5),
            ..PipelineSettings::default()
        }
    }

    struct FixedIds(&'static str);

    impl IdentifierGenerator for FixedIds {
        fn new_identifier(&self, _seed: &str) -> Result<Identifier, IdentifierError> {
            Ok(Identifier::new(self.0))
        }
    }

    #[derive(Default)]
    struct Counting {
        persisted: AtomicU32,
        orphans: AtomicU32,
        failed: Mutex<Vec<Stage>>,
    }

    impl PipelineObserver for Counting {
        fn unit_persisted(&self, _kind: SymbolKind) {
            self.persisted.fetch_add(1, Ordering::Relaxed);
        }

        fn stage_failed(&self, stage: Stage) {
            self.failed.lock().push(stage);
        }

        fn orphan_removed(&self) {
            self.orphans.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn scratch_files(h: &Harness) -> usize {
        std::fs::read_dir(h.scratch.path()).unwrap().count()
    }

    #[test]
    fn routing_table() {
        assert_eq!(Operation::BulkBarcode.table(), TableSelector::LegacyBarcode);
        assert_eq!(Operation::BulkQr.table(), TableSelector::QrCode);
        assert_eq!(Operation::SingleBarcode.table(), TableSelector::Product);
        assert_eq!(Operation::SingleQr.table(), TableSelector::QrCode);

        let id = Identifier::new("01ABC");
        assert_eq!(
            Operation::SingleQr.payload("Widget-42", &id),
            "Product: Widget-42, ID: 01ABC"
        );
        assert_eq!(Operation::SingleBarcode.payload("Widget-42", &id), "01ABC");
        assert!(!Operation::BulkQr.keeps_inline_copy());
        assert!(Operation::SingleBarcode.keeps_inline_copy());
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Rendered.to_string(), "render");
        assert_eq!(Stage::Persisted.to_string(), "persist");
        assert_eq!(Stage::Start.to_string(), "validate");
    }

    #[tokio::test]
    async fn single_qr_is_published_and_persisted() {
        let h = harness(quick());

        let record = h
            .pipeline
            .generate_single(SymbolKind::Qr, "Widget-42")
            .await
            .unwrap();

        assert_eq!(record.name, "Widget-42");
        assert_eq!(record.identifier.as_str().len(), 26);
        assert!(record.public_url.starts_with(ROOT));
        assert!(record.public_url.ends_with(".jpg"));
        assert!(record.encoded_copy.as_deref().is_some_and(|c| c.starts_with("/9j/")));

        let key = storage_key(&record.identifier, CompactFormat::Jpeg);
        let (_, content_type) = h.storage.get(DEFAULT_QR_BUCKET, &key).unwrap();
        assert_eq!(content_type, "image/jpeg");

        let rows = h.store.rows(TableSelector::QrCode);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identifier, record.identifier);
        assert_eq!(scratch_files(&h), 0);
    }

    #[tokio::test]
    async fn bulk_barcodes_go_to_legacy_table_without_inline_copy() {
        let h = harness(quick());

        let records = h
            .pipeline
            .generate_batch(SymbolKind::Barcode, "Widget", 3)
            .await
            .unwrap();

        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.encoded_copy.is_none()));
        let rows = h.store.rows(TableSelector::LegacyBarcode);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.name == "Widget"));
        assert_eq!(h.storage.len(), 3);
    }

    #[tokio::test]
    async fn invalid_requests_have_no_side_effects() {
        let h = harness(quick());

        for (name, quantity) in [("", 3), ("   ", 1), ("Widget", 0), ("Widget", 1001)] {
            let err = h
                .pipeline
                .generate_batch(SymbolKind::Barcode, name, quantity)
                .await
                .unwrap_err();
            assert_eq!(err.stage, Stage::Start);
            assert!(matches!(err.source, Error::Validation { .. }));
        }
        assert!(
            h.pipeline
                .generate_single(SymbolKind::Qr, "")
                .await
                .is_err()
        );

        assert_eq!(h.storage.attempts(), 0);
        assert_eq!(h.store.total_rows(), 0);
        assert_eq!(scratch_files(&h), 0);
    }

    #[tokio::test]
    async fn upload_failure_writes_no_record() {
        let h = harness(quick());
        h.storage.fail_with(StorageFault::Status(403));

        let err = h
            .pipeline
            .generate_single(SymbolKind::Qr, "Widget-42")
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Published);
        assert!(matches!(err.source, Error::Publish(PublishError::Rejected { status: 403, .. })));
        // Permanent rejections are not retried.
        assert_eq!(h.storage.attempts(), 1);
        assert_eq!(h.store.total_rows(), 0);
    }

    #[tokio::test]
    async fn transient_upload_failures_are_retried() {
        let h = harness(quick());
        h.storage.fail_with(StorageFault::TransientFor(2));

        h.pipeline
            .generate_single(SymbolKind::Barcode, "Widget")
            .await
            .unwrap();

        assert_eq!(h.storage.attempts(), 3);
        assert_eq!(h.store.rows(TableSelector::Product).len(), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_the_limit() {
        let h = harness(quick());
        h.storage.fail_with(StorageFault::Transport);

        let err = h
            .pipeline
            .generate_single(SymbolKind::Barcode, "Widget")
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Published);
        assert_eq!(h.storage.attempts(), 3);
    }

    #[tokio::test]
    async fn persist_failure_leaves_orphan_by_default() {
        let h = harness(PipelineSettings {
            retry: RetryPolicy::none(),
            ..quick()
        });
        h.store.fail_with(StoreFault::Connectivity);

        let err = h
            .pipeline
            .generate_single(SymbolKind::Qr, "Widget")
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Persisted);
        assert_eq!(h.storage.len(), 1);
    }

    #[tokio::test]
    async fn persist_failure_removes_orphan_when_enabled() {
        let observer = Arc::new(Counting::default());
        let scratch = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_with(StoreFault::Connectivity);
        let pipeline = Pipeline::builder(Publisher::new(storage.clone(), ROOT), store.clone())
            .qr_renderer(Arc::new(QrRenderer::new(scratch.path())))
            .settings(PipelineSettings {
                remove_orphans: true,
                retry: RetryPolicy::none(),
                ..quick()
            })
            .observer(observer.clone())
            .build();

        let err = pipeline
            .generate_single(SymbolKind::Qr, "Widget")
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Persisted);
        assert!(storage.is_empty());
        assert_eq!(observer.orphans.load(Ordering::Relaxed), 1);
        assert_eq!(*observer.failed.lock(), vec![Stage::Persisted]);
    }

    #[tokio::test]
    async fn transient_persist_failure_is_retried() {
        let h = harness(quick());
        h.store.fail_with(StoreFault::TransientFor(1));

        h.pipeline
            .generate_single(SymbolKind::Qr, "Widget")
            .await
            .unwrap();

        assert_eq!(h.store.rows(TableSelector::QrCode).len(), 1);
    }

    #[tokio::test]
    async fn lost_upload_ack_is_recovered_on_retry() {
        let h = harness(quick());
        h.storage.fail_with(StorageFault::LostAckFor(1));

        let record = h
            .pipeline
            .generate_single(SymbolKind::Qr, "Widget")
            .await
            .unwrap();

        // The first upload landed; the retry saw the object already there.
        assert_eq!(h.storage.attempts(), 2);
        assert_eq!(h.storage.len(), 1);
        let key = storage_key(&record.identifier, CompactFormat::Jpeg);
        assert!(h.storage.get(DEFAULT_QR_BUCKET, &key).is_some());
        assert!(record.public_url.ends_with(&key));
        assert_eq!(h.store.rows(TableSelector::QrCode).len(), 1);
    }

    #[tokio::test]
    async fn timed_out_commit_is_recovered_on_retry() {
        let h = harness(PipelineSettings {
            remove_orphans: true,
            stage_timeout: Duration::from_millis(50),
            ..quick()
        });
        h.store.fail_with(StoreFault::SlowCommit(Duration::from_millis(200)));

        let record = h
            .pipeline
            .generate_single(SymbolKind::Qr, "Widget")
            .await
            .unwrap();

        let rows = h.store.rows(TableSelector::QrCode);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identifier, record.identifier);
        assert_eq!(h.storage.len(), 1);
    }

    #[tokio::test]
    async fn timed_out_commit_never_removes_the_object() {
        let observer = Arc::new(Counting::default());
        let scratch = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(MemoryRecordStore::new());
        store.fail_with(StoreFault::SlowCommit(Duration::from_millis(200)));
        let pipeline = Pipeline::builder(Publisher::new(storage.clone(), ROOT), store.clone())
            .qr_renderer(Arc::new(QrRenderer::new(scratch.path())))
            .settings(PipelineSettings {
                remove_orphans: true,
                retry: RetryPolicy::none(),
                stage_timeout: Duration::from_millis(50),
                ..quick()
            })
            .observer(observer.clone())
            .build();

        let err = pipeline
            .generate_single(SymbolKind::Qr, "Widget")
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Persisted);
        assert!(matches!(err.source, Error::Persist(PersistError::Timeout(_))));
        // The row may have committed, so the object it points at stays.
        assert_eq!(storage.len(), 1);
        assert_eq!(observer.orphans.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn bulk_stops_at_first_failure_and_keeps_earlier_units() {
        let h = harness_with(quick(), Arc::new(FixedIds("SAME")), Symbology::Code128);

        let err = h
            .pipeline
            .generate_batch(SymbolKind::Qr, "Widget", 3)
            .await
            .unwrap_err();

        // The second unit collides with the first object key.
        assert_eq!(err.stage, Stage::Published);
        assert_eq!(h.storage.attempts(), 2);
        assert_eq!(h.storage.len(), 1);
        assert_eq!(h.store.rows(TableSelector::QrCode).len(), 1);
    }

    #[tokio::test]
    async fn ean13_rejects_non_numeric_identifiers_at_render() {
        let h = harness_with(quick(), IdScheme::Ulid.build(), Symbology::Ean13);

        let err = h
            .pipeline
            .generate_single(SymbolKind::Barcode, "Widget")
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Rendered);
        assert!(matches!(err.source, Error::Render(_)));
        assert_eq!(h.storage.attempts(), 0);
    }

    #[tokio::test]
    async fn ean13_accepts_numeric_identifiers() {
        let h = harness_with(quick(), Arc::new(FixedIds("400638133393")), Symbology::Ean13);

        let record = h
            .pipeline
            .generate_single(SymbolKind::Barcode, "Widget")
            .await
            .unwrap();

        assert_eq!(record.identifier.as_str(), "400638133393");
    }

    #[tokio::test]
    async fn ean13_with_numeric_scheme_publishes() {
        let h = harness_with(quick(), IdScheme::Numeric.build(), Symbology::Ean13);

        let records = h
            .pipeline
            .generate_batch(SymbolKind::Barcode, "Widget", 2)
            .await
            .unwrap();

        assert!(
            records
                .iter()
                .all(|r| r.identifier.as_str().len() == 12
                    && r.identifier.as_str().bytes().all(|b| b.is_ascii_digit()))
        );
        assert_ne!(records[0].identifier, records[1].identifier);
        assert_eq!(h.store.rows(TableSelector::LegacyBarcode).len(), 2);
    }

    #[tokio::test]
    async fn retained_scratch_keeps_png_and_jpeg() {
        let h = harness(PipelineSettings {
            retain_scratch: true,
            ..quick()
        });

        let record = h
            .pipeline
            .generate_single(SymbolKind::Barcode, "Widget")
            .await
            .unwrap();

        let id = record.identifier.as_str();
        assert!(h.scratch.path().join(format!("{id}.png")).exists());
        assert!(h.scratch.path().join(format!("{id}.jpg")).exists());
    }

    #[tokio::test]
    async fn lookup_resolves_single_items_and_reports_misses() {
        let h = harness(quick());
        let record = h
            .pipeline
            .generate_single(SymbolKind::Barcode, "Widget")
            .await
            .unwrap();

        let found = h
            .pipeline
            .lookup(record.identifier.as_str())
            .await
            .unwrap();
        assert_eq!(found.name, "Widget");
        assert_eq!(found.unique_id, record.identifier.as_str());
        assert_eq!(found.source, "products_new");

        let miss = h.pipeline.lookup("01NOPE").await.unwrap_err();
        assert!(matches!(miss, Error::NotFound { .. }));
        let blank = h.pipeline.lookup(" ").await.unwrap_err();
        assert!(matches!(blank, Error::Validation { .. }));
    }
}
