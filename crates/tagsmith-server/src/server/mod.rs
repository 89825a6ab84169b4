//! HTTP server wiring.
//!
//! ## Structure
//!
//! - [`config`] - CLI/environment options and their validation.
//! - [`api`] - routes, request parsing and the response envelope.
//! - [`telemetry`] - logging setup and metric helpers.

pub mod api;
pub mod config;
pub mod telemetry;

use config::ServerConfig;
use std::sync::Arc;
use tagsmith_core::{
    LinearBarcodeRenderer, ObjectStorage, Pipeline, Publisher, QrRenderer, RecordStore,
    Transcoder,
};

/// Assembles the pipeline from validated configuration and the process-wide
/// storage and store handles.
pub fn build_pipeline(
    config: &ServerConfig,
    storage: Arc<dyn ObjectStorage>,
    store: Arc<dyn RecordStore>,
) -> Pipeline {
    let publisher = Publisher::new(storage, config.supabase_url.clone());
    Pipeline::builder(publisher, store)
        .identifiers(config.id_scheme.build())
        .barcode_renderer(Arc::new(LinearBarcodeRenderer::new(
            config.symbology,
            config.scratch_dir.clone(),
        )))
        .qr_renderer(Arc::new(QrRenderer::new(config.scratch_dir.clone())))
        .transcoder(Transcoder::new(config.jpeg_quality))
        .settings(config.pipeline.clone())
        .observer(Arc::new(telemetry::MetricsObserver))
        .build()
}
