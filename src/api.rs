//! HTTP surface: record write/read, spreadsheet update, blob-created events and uploads.

use crate::blob::{BlobError, BlobStore};
use crate::pipeline::{Pipeline, PipelineOutcome, Propagation};
use crate::record::{FlatRecord, stringify};
use crate::record_store::{RecordStore, StoreError, run_blocking};
use crate::sheet::{SheetUpdate, SpreadsheetUpdater};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub updater: Arc<SpreadsheetUpdater>,
    pub pipeline: Arc<Pipeline>,
    pub blobs: Arc<dyn BlobStore>,
    pub max_upload_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);
    Router::new()
        .route("/writeinvoice", get(get_invoice).post(write_invoice))
        .route("/updateexcel", post(update_excel))
        .route("/events/blobcreated", post(blob_created))
        .route("/upload", post(upload).layer(upload_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

fn status_of(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn parse_object(body: &[u8]) -> Option<serde_json::Map<String, Value>> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn key_of(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).map(stringify).filter(|k| !k.is_empty())
}

/// POST /writeinvoice
async fn write_invoice(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(map) = parse_object(&body) else {
        return text(StatusCode::BAD_REQUEST, "Invalid JSON body");
    };
    let (Some(partition_key), Some(row_key)) =
        (key_of(&map, "PartitionKey"), key_of(&map, "RowKey"))
    else {
        return text(StatusCode::BAD_REQUEST, "Missing PartitionKey or RowKey");
    };

    let record = FlatRecord::from_json_map(&map);
    let upserted = run_blocking(&state.store, move |store| {
        store.upsert(&partition_key, &row_key, &record)
    })
    .await;
    match upserted {
        Ok(_) => text(StatusCode::OK, "Record inserted with Verified=False"),
        Err(e) => {
            error!(error = %e, "Error inserting record");
            text(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}"))
        }
    }
}

/// GET /writeinvoice?PartitionKey=&RowKey=
async fn get_invoice(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let pk = params.get("PartitionKey").filter(|v| !v.is_empty()).cloned();
    let rk = params.get("RowKey").filter(|v| !v.is_empty()).cloned();
    let (Some(pk), Some(rk)) = (pk, rk) else {
        return text(StatusCode::BAD_REQUEST, "Missing PartitionKey or RowKey");
    };

    match run_blocking(&state.store, move |store| store.get(&pk, &rk)).await {
        Ok(record) => Json(record.to_entity_json()).into_response(),
        Err(e @ StoreError::NotFound { .. }) => text(StatusCode::NOT_FOUND, format!("Error: {e}")),
        Err(e) => {
            error!(error = %e, "Error retrieving record");
            text(StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e}"))
        }
    }
}

/// POST /updateexcel
async fn update_excel(State(state): State<AppState>, body: Bytes) -> Response {
    let req: SheetUpdate = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Unreadable update request");
            return text(StatusCode::BAD_REQUEST, "Invalid JSON body");
        }
    };

    match state.updater.update(&req).await {
        Ok(_) => text(StatusCode::OK, "Excel updated successfully"),
        Err(e) => {
            let status = status_of(e.status_code());
            if status.is_server_error() {
                error!(error = %e, "Error updating Excel");
            } else {
                warn!(error = %e, status = %status, "Excel update rejected");
            }
            text(status, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlobCreatedEvent {
    name: String,
    #[serde(default)]
    length: Option<u64>,
}

fn outcome_json(outcome: &PipelineOutcome) -> Value {
    match outcome {
        PipelineOutcome::Skipped { name } => json!({ "status": "skipped", "name": name }),
        PipelineOutcome::Completed {
            record,
            propagation,
        } => {
            let (prop, prop_error) = match propagation {
                Propagation::Disabled => ("disabled", None),
                Propagation::Sent(_) => ("sent", None),
                Propagation::Failed { error, .. } => ("failed", Some(error.as_str())),
            };
            json!({
                "status": "completed",
                "PartitionKey": record.partition_key,
                "RowKey": record.row_key,
                "propagation": prop,
                "propagationError": prop_error,
            })
        }
    }
}

/// POST /events/blobcreated
async fn blob_created(
    State(state): State<AppState>,
    Json(event): Json<BlobCreatedEvent>,
) -> Response {
    info!(name = %event.name, length = ?event.length, "Blob trigger");

    let body = match state.blobs.get(&event.name).await {
        Ok(body) => body,
        Err(e @ BlobError::NotFound(_)) => return text(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ BlobError::InvalidName(_)) => return text(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => return text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    match state.pipeline.process(&event.name, &body).await {
        Ok(outcome) => Json(outcome_json(&outcome)).into_response(),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("Pipeline error: {e}")),
    }
}

fn upload_name(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let millis = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    format!("{millis}-{base}")
}

/// POST /upload
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let bad_request = |msg: &str| (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response();
    let server_error = |msg: String| {
        error!(error = %msg, "Upload Error");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg }))).into_response()
    };

    let mut file: Option<(String, Bytes)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("pdf") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((file_name, bytes)),
                    Err(e) => return bad_request(&e.to_string()),
                }
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => return bad_request(&e.to_string()),
        }
    }

    let Some((file_name, bytes)) = file.filter(|(_, b)| !b.is_empty()) else {
        return bad_request("No file uploaded");
    };

    let name = upload_name(&file_name);
    if let Err(e) = state.blobs.put(&name, &bytes).await {
        return server_error(e.to_string());
    }

    let pipeline = state.pipeline.clone();
    let object = name.clone();
    tokio::spawn(async move {
        // Failures are logged inside the pipeline.
        let _ = pipeline.process(&object, &bytes).await;
    });

    Json(json!({ "message": "Upload successful", "name": name })).into_response()
}
