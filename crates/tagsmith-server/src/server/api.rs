//! JSON routes.
//!
//! Every response uses the envelope `{ "isSuccess", "message", ...payload }`.
//! Bad input is a 400 with no side effects, a failed pipeline stage is a 500
//! naming the stage, and a lookup miss is a 404.

use crate::server::telemetry;
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tagsmith_core::{Error, Pipeline, PipelineError, PublishedRecord, Stage, SymbolKind};
use tower_http::cors::{Any, CorsLayer};

const HEALTHZ_STATUS: &str = "ok";
const MISSING_FIELDS: &str = "Missing required fields";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/generate_barcode", post(generate_barcode))
        .route("/generate_qrcode", post(generate_qrcode))
        .route("/generate_barcode_v2", post(generate_barcode_v2))
        .route("/generate_qrcode_v2", post(generate_qrcode_v2))
        .route("/scan_code", post(scan_code))
        .route("/healthz", get(healthz))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    #[cfg(feature = "tracing")]
    let router = router.layer(tower_http::trace::TraceLayer::new_for_http());

    router.with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T: Serialize> {
    is_success: bool,
    message: String,
    #[serde(flatten)]
    payload: T,
}

#[derive(Debug, Serialize)]
struct NoPayload {}

fn success<T: Serialize>(status: StatusCode, message: &str, payload: T) -> Response {
    (
        status,
        Json(Envelope {
            is_success: true,
            message: message.to_string(),
            payload,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    name: Option<String>,
    quantity: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SingleRequest {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScanRequest {
    unique_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct BarcodeEntry {
    unique_id: String,
    barcode_image_path: String,
}

#[derive(Debug, Serialize)]
struct QrEntry {
    unique_id: String,
    qr_code_image_path: String,
}

#[derive(Debug, Serialize)]
struct BarcodeDetail {
    unique_id: String,
    barcode_image_path: String,
    barcode_image_base64: String,
}

#[derive(Debug, Serialize)]
struct QrDetail {
    unique_id: String,
    qr_code_image_path: String,
    qr_code_image_base64: String,
}

#[derive(Debug, Serialize)]
struct BarcodeBatch {
    barcodes: Vec<BarcodeEntry>,
}

#[derive(Debug, Serialize)]
struct QrBatch {
    qr_codes: Vec<QrEntry>,
}

#[derive(Debug, Serialize)]
struct SingleBarcode {
    barcode: BarcodeDetail,
}

#[derive(Debug, Serialize)]
struct SingleQr {
    qr_code: QrDetail,
}

#[derive(Debug, Serialize)]
struct ScanHit {
    unique_id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct Healthz {
    status: &'static str,
}

/// A failed request, rendered as an envelope with `isSuccess: false`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    /// Maps a unit failure to a status and a stage-specific message.
    fn from_pipeline(kind: SymbolKind, err: PipelineError) -> Self {
        let label = kind.label();
        match (err.stage, err.source) {
            (_, Error::Validation { reason }) => Self::BadRequest(reason),
            (Stage::Published, source) => {
                Self::Internal(format!("Failed to upload {label}: {source}"))
            }
            (Stage::Persisted, source) => {
                Self::Internal(format!("Failed to store {label} in database: {source}"))
            }
            (_, source) => Self::Internal(format!("Failed to generate {label}: {source}")),
        }
    }

    fn from_lookup(err: Error) -> Self {
        match err {
            Error::Validation { .. } => Self::BadRequest("Missing unique ID".into()),
            Error::NotFound { .. } => Self::NotFound("Product not found".into()),
            other => Self::Internal(format!("Database error: {other}")),
        }
    }

    fn from_rejection(rejection: JsonRejection) -> Self {
        Self::BadRequest(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        #[cfg(feature = "tracing")]
        {
            if status.is_server_error() {
                tracing::error!(%status, reason = %message, "request failed");
            } else {
                tracing::debug!(%status, reason = %message, "request rejected");
            }
        }

        (
            status,
            Json(Envelope {
                is_success: false,
                message,
                payload: NoPayload {},
            }),
        )
            .into_response()
    }
}

/// Counts a request and records its latency when dropped.
struct RequestTimer {
    route: &'static str,
    started: Instant,
}

impl RequestTimer {
    fn start(route: &'static str) -> Self {
        telemetry::increment_requests(route);
        Self {
            route,
            started: Instant::now(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        telemetry::record_request_duration(
            self.route,
            self.started.elapsed().as_secs_f64() * 1000.0,
        );
    }
}

/// Negative quantities clamp to zero and oversized ones to `u32::MAX`, both
/// of which the pipeline rejects.
fn clamp_quantity(quantity: i64) -> u32 {
    u32::try_from(quantity.max(0)).unwrap_or(u32::MAX)
}

fn bulk_input(
    body: Result<Json<BulkRequest>, JsonRejection>,
) -> Result<(String, u32), ApiError> {
    let Json(request) = body.map_err(ApiError::from_rejection)?;
    match (request.name, request.quantity) {
        (Some(name), Some(quantity)) if !name.trim().is_empty() => {
            Ok((name, clamp_quantity(quantity)))
        }
        _ => Err(ApiError::BadRequest(MISSING_FIELDS.into())),
    }
}

fn single_input(body: Result<Json<SingleRequest>, JsonRejection>) -> Result<String, ApiError> {
    let Json(request) = body.map_err(ApiError::from_rejection)?;
    request
        .value
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest(MISSING_FIELDS.into()))
}

async fn run_batch(
    state: &AppState,
    kind: SymbolKind,
    body: Result<Json<BulkRequest>, JsonRejection>,
) -> Result<Vec<PublishedRecord>, ApiError> {
    let (name, quantity) = bulk_input(body)?;
    state
        .pipeline
        .generate_batch(kind, &name, quantity)
        .await
        .map_err(|err| ApiError::from_pipeline(kind, err))
}

async fn run_single(
    state: &AppState,
    kind: SymbolKind,
    body: Result<Json<SingleRequest>, JsonRejection>,
) -> Result<PublishedRecord, ApiError> {
    let value = single_input(body)?;
    state
        .pipeline
        .generate_single(kind, &value)
        .await
        .map_err(|err| ApiError::from_pipeline(kind, err))
}

async fn generate_barcode(
    State(state): State<AppState>,
    body: Result<Json<BulkRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let _timer = RequestTimer::start("generate_barcode");
    let records = run_batch(&state, SymbolKind::Barcode, body).await?;
    let barcodes = records
        .into_iter()
        .map(|record| BarcodeEntry {
            unique_id: record.identifier.into_inner(),
            barcode_image_path: record.public_url,
        })
        .collect();
    Ok(success(
        StatusCode::CREATED,
        "Barcodes generated",
        BarcodeBatch { barcodes },
    ))
}

async fn generate_qrcode(
    State(state): State<AppState>,
    body: Result<Json<BulkRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let _timer = RequestTimer::start("generate_qrcode");
    let records = run_batch(&state, SymbolKind::Qr, body).await?;
    let qr_codes = records
        .into_iter()
        .map(|record| QrEntry {
            unique_id: record.identifier.into_inner(),
            qr_code_image_path: record.public_url,
        })
        .collect();
    Ok(success(
        StatusCode::CREATED,
        "QR Codes generated",
        QrBatch { qr_codes },
    ))
}

async fn generate_barcode_v2(
    State(state): State<AppState>,
    body: Result<Json<SingleRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let _timer = RequestTimer::start("generate_barcode_v2");
    let record = run_single(&state, SymbolKind::Barcode, body).await?;
    Ok(success(
        StatusCode::CREATED,
        "Barcode generated",
        SingleBarcode {
            barcode: BarcodeDetail {
                unique_id: record.identifier.into_inner(),
                barcode_image_path: record.public_url,
                barcode_image_base64: record.encoded_copy.unwrap_or_default(),
            },
        },
    ))
}

async fn generate_qrcode_v2(
    State(state): State<AppState>,
    body: Result<Json<SingleRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let _timer = RequestTimer::start("generate_qrcode_v2");
    let record = run_single(&state, SymbolKind::Qr, body).await?;
    Ok(success(
        StatusCode::CREATED,
        "QR Code generated",
        SingleQr {
            qr_code: QrDetail {
                unique_id: record.identifier.into_inner(),
                qr_code_image_path: record.public_url,
                qr_code_image_base64: record.encoded_copy.unwrap_or_default(),
            },
        },
    ))
}

async fn scan_code(
    State(state): State<AppState>,
    body: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let _timer = RequestTimer::start("scan_code");
    let Json(request) = body.map_err(ApiError::from_rejection)?;
    let unique_id = request
        .unique_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing unique ID".into()))?;

    let found = state
        .pipeline
        .lookup(&unique_id)
        .await
        .map_err(ApiError::from_lookup)?;

    Ok(success(
        StatusCode::OK,
        "Product found",
        ScanHit {
            unique_id: found.unique_id,
            name: found.name,
        },
    ))
}

async fn healthz() -> impl IntoResponse {
    Json(Healthz {
        status: HEALTHZ_STATUS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagsmith_core::{PersistError, PublishError};

    #[test]
    fn quantities_outside_u32_are_clamped() {
        assert_eq!(clamp_quantity(-5), 0);
        assert_eq!(clamp_quantity(3), 3);
        assert_eq!(clamp_quantity(i64::MAX), u32::MAX);
    }

    #[test]
    fn stage_messages_name_the_failing_step() {
        let upload = ApiError::from_pipeline(
            SymbolKind::Qr,
            PipelineError::new(Stage::Published, PublishError::Transport("reset".into())),
        );
        assert!(matches!(
            upload,
            ApiError::Internal(ref m)
                if m == "Failed to upload QR Code: upload transport failure: reset"
        ));

        let store = ApiError::from_pipeline(
            SymbolKind::Barcode,
            PipelineError::new(Stage::Persisted, PersistError::PoolExhausted),
        );
        assert!(matches!(
            store,
            ApiError::Internal(ref m)
                if m == "Failed to store barcode in database: database pool exhausted"
        ));

        let invalid = ApiError::from_pipeline(
            SymbolKind::Barcode,
            PipelineError::new(
                Stage::Start,
                Error::Validation {
                    reason: "quantity must be between 1 and 1000".into(),
                },
            ),
        );
        assert!(matches!(invalid, ApiError::BadRequest(_)));
    }

    #[test]
    fn failure_envelope_has_no_payload() {
        let body = serde_json::to_value(Envelope {
            is_success: false,
            message: "nope".into(),
            payload: NoPayload {},
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "isSuccess": false, "message": "nope" })
        );
    }
}
