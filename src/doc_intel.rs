// src/doc_intel.rs

use crate::config::DocIntelConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("document intelligence is not configured: {0}")]
    NotConfigured(&'static str),
    #[error("could not read staged document: {0}")]
    Io(#[from] std::io::Error),
    #[error("document intelligence request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("document intelligence returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("no Operation-Location in analyze response")]
    MissingOperation,
    #[error("analysis failed: {0}")]
    AnalysisFailed(String),
    #[error("analysis did not finish within {0:?}")]
    TimedOut(Duration),
}

/// One non-empty table cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCell {
    pub row_index: u32,
    pub column_index: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRecord {
    pub row_count: u32,
    pub column_count: u32,
    pub cells: Vec<TableCell>,
}

/// Fields and tables pulled out of one document. Lives for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RawExtraction {
    pub fields: BTreeMap<String, String>,
    pub tables: Vec<TableRecord>,
}

/// The document-understanding collaborator.
#[async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    async fn analyze(&self, document: &Path) -> Result<RawExtraction, ExtractionError>;
}

/// REST client for the Document Intelligence analyze API.
pub struct DocIntelClient {
    client: Client,
    cfg: DocIntelConfig,
}

impl DocIntelClient {
    pub fn new(cfg: DocIntelConfig) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/documentintelligence/documentModels/{}:analyze?api-version={}",
            self.cfg.endpoint.trim_end_matches('/'),
            self.cfg.model_id,
            self.cfg.api_version
        )
    }

    async fn poll(&self, operation_url: &str) -> Result<Value, ExtractionError> {
        let interval = Duration::from_secs(self.cfg.poll_interval_secs.max(1));
        let timeout = Duration::from_secs(self.cfg.timeout_secs);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::time::sleep(interval).await;

            let poll_json: Value = self
                .client
                .get(operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.cfg.key)
                .send()
                .await?
                .json()
                .await?;

            match poll_json.get("status").and_then(Value::as_str).unwrap_or("") {
                "succeeded" => {
                    return poll_json
                        .get("analyzeResult")
                        .cloned()
                        .ok_or_else(|| ExtractionError::AnalysisFailed("no analyzeResult".into()));
                }
                "failed" => {
                    let msg = poll_json
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown error");
                    return Err(ExtractionError::AnalysisFailed(msg.to_string()));
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ExtractionError::TimedOut(timeout));
            }
        }
    }
}

#[async_trait]
impl DocumentAnalyzer for DocIntelClient {
    async fn analyze(&self, document: &Path) -> Result<RawExtraction, ExtractionError> {
        if self.cfg.endpoint.is_empty() {
            return Err(ExtractionError::NotConfigured("DOC_INTEL_ENDPOINT"));
        }
        if self.cfg.key.is_empty() {
            return Err(ExtractionError::NotConfigured("DOC_INTEL_KEY"));
        }

        let bytes = tokio::fs::read(document).await?;
        info!(model = %self.cfg.model_id, bytes = bytes.len(), "Submitting document for analysis");

        let response = self
            .client
            .post(self.analyze_url())
            .header("Ocp-Apim-Subscription-Key", &self.cfg.key)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let operation_url = response
            .headers()
            .get("Operation-Location")
            .and_then(|v| v.to_str().ok())
            .ok_or(ExtractionError::MissingOperation)?
            .to_string();

        let result = self.poll(&operation_url).await?;
        let extraction = parse_analyze_result(&result);
        info!(
            fields = extraction.fields.len(),
            tables = extraction.tables.len(),
            "Document analysis complete"
        );
        Ok(extraction)
    }
}

/// Flatten an `analyzeResult` into fields of the first document and non-empty tables.
pub fn parse_analyze_result(result: &Value) -> RawExtraction {
    let mut extraction = RawExtraction::default();

    if let Some(fields) = result
        .pointer("/documents/0/fields")
        .and_then(Value::as_object)
    {
        for (name, field) in fields {
            let text = match field.get("content").and_then(Value::as_str) {
                Some(content) => content.to_string(),
                None => field.to_string(),
            };
            extraction.fields.insert(name.clone(), text);
        }
    }

    let empty = Vec::new();
    let tables = result
        .get("tables")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    for table in tables {
        let cells: Vec<TableCell> = table
            .get("cells")
            .and_then(Value::as_array)
            .unwrap_or(&empty)
            .iter()
            .filter_map(|cell| {
                let content = cell.get("content").and_then(Value::as_str)?;
                if content.trim().is_empty() {
                    return None;
                }
                Some(TableCell {
                    row_index: index_of(cell, "rowIndex"),
                    column_index: index_of(cell, "columnIndex"),
                    content: content.to_string(),
                })
            })
            .collect();

        if cells.is_empty() {
            warn!("Dropping table with no non-empty cells");
            continue;
        }

        extraction.tables.push(TableRecord {
            row_count: index_of(table, "rowCount"),
            column_count: index_of(table, "columnCount"),
            cells,
        });
    }

    extraction
}

fn index_of(obj: &Value, key: &str) -> u32 {
    obj.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fields_prefer_content() {
        let result = json!({
            "documents": [{
                "fields": {
                    "InvoiceId": {"type": "string", "content": "INV-77", "valueString": "INV-77"},
                    "InvoiceTotal": {"type": "currency", "valueCurrency": {"amount": 10.5}}
                }
            }]
        });
        let ex = parse_analyze_result(&result);
        assert_eq!(ex.fields["InvoiceId"], "INV-77");
        assert!(ex.fields["InvoiceTotal"].contains("10.5"));
        assert!(ex.tables.is_empty());
    }

    #[test]
    fn blank_cells_and_empty_tables_are_dropped() {
        let result = json!({
            "tables": [
                {
                    "rowCount": 2, "columnCount": 2,
                    "cells": [
                        {"rowIndex": 0, "columnIndex": 0, "content": "kWh"},
                        {"rowIndex": 0, "columnIndex": 1, "content": "   "},
                        {"rowIndex": 1, "columnIndex": 0, "content": "1,250"}
                    ]
                },
                {
                    "rowCount": 1, "columnCount": 1,
                    "cells": [{"rowIndex": 0, "columnIndex": 0, "content": ""}]
                }
            ]
        });
        let ex = parse_analyze_result(&result);
        assert_eq!(ex.tables.len(), 1);
        assert_eq!(ex.tables[0].cells.len(), 2);
        assert_eq!(ex.tables[0].cells[1].row_index, 1);
        assert_eq!(ex.tables[0].cells[1].content, "1,250");
    }

    #[test]
    fn serializes_with_camel_case_names() {
        let ex = RawExtraction {
            fields: BTreeMap::new(),
            tables: vec![TableRecord {
                row_count: 1,
                column_count: 1,
                cells: vec![TableCell {
                    row_index: 0,
                    column_index: 0,
                    content: "x".into(),
                }],
            }],
        };
        let v = serde_json::to_value(&ex).unwrap();
        assert_eq!(v["tables"][0]["rowCount"], 1);
        assert_eq!(v["tables"][0]["cells"][0]["columnIndex"], 0);
    }

    #[tokio::test]
    async fn unconfigured_client_fails_fast() {
        let client = DocIntelClient::new(DocIntelConfig::default());
        let err = client.analyze(Path::new("/nonexistent")).await.unwrap_err();
        assert!(matches!(err, ExtractionError::NotConfigured(_)));
    }

    mod stubbed {
        use super::*;
        use crate::test_server::{Reply, Seen, TestServer};
        use axum::http::{Method, StatusCode};
        use std::io::Write;

        fn staged(body: &[u8]) -> tempfile::NamedTempFile {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(body).unwrap();
            file
        }

        fn client(server: &TestServer, timeout_secs: u64) -> DocIntelClient {
            DocIntelClient::new(DocIntelConfig {
                endpoint: format!("{}/", server.base),
                key: "di-key".into(),
                poll_interval_secs: 1,
                timeout_secs,
                ..DocIntelConfig::default()
            })
        }

        /// Accepts the submit and answers every poll with `status`.
        fn polling(status: serde_json::Value) -> impl Fn(&Seen) -> Reply + Clone + Send + Sync + 'static {
            move |req: &Seen| {
                if req.method == Method::POST {
                    Reply::text(StatusCode::ACCEPTED, "")
                        .with_header("operation-location", format!("{}/operations/op-1", req.origin()))
                } else {
                    Reply::json(StatusCode::OK, status.clone())
                }
            }
        }

        #[tokio::test]
        async fn submits_then_polls_until_succeeded() {
            let server = TestServer::start(polling(json!({
                "status": "succeeded",
                "analyzeResult": {"documents": [{"fields": {"InvoiceId": {"content": "INV-7"}}}]}
            })))
            .await;
            let doc = staged(b"%PDF-1.7");

            let ex = client(&server, 30).analyze(doc.path()).await.unwrap();

            assert_eq!(ex.fields["InvoiceId"], "INV-7");
            let seen = server.requests();
            assert_eq!(seen.len(), 2);
            assert_eq!(
                seen[0].uri,
                "/documentintelligence/documentModels/prebuilt-invoice:analyze?api-version=2024-11-30"
            );
            assert_eq!(seen[0].header("ocp-apim-subscription-key"), Some("di-key"));
            assert_eq!(seen[0].header("content-type"), Some("application/octet-stream"));
            assert_eq!(&seen[0].body[..], b"%PDF-1.7");
            assert_eq!(seen[1].method, Method::GET);
            assert_eq!(seen[1].uri, "/operations/op-1");
            assert_eq!(seen[1].header("ocp-apim-subscription-key"), Some("di-key"));
        }

        #[tokio::test]
        async fn rejected_submit_is_reported_with_status() {
            let server =
                TestServer::start(|_: &Seen| Reply::text(StatusCode::UNAUTHORIZED, "bad key")).await;
            let doc = staged(b"%PDF");

            let err = client(&server, 30).analyze(doc.path()).await.unwrap_err();

            match err {
                ExtractionError::Rejected { status, body } => {
                    assert_eq!(status, 401);
                    assert_eq!(body, "bad key");
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert_eq!(server.requests().len(), 1);
        }

        #[tokio::test]
        async fn accepted_without_operation_location() {
            let server = TestServer::start(|_: &Seen| Reply::text(StatusCode::ACCEPTED, "")).await;
            let doc = staged(b"%PDF");

            let err = client(&server, 30).analyze(doc.path()).await.unwrap_err();

            assert!(matches!(err, ExtractionError::MissingOperation), "{err:?}");
            assert_eq!(server.requests().len(), 1);
        }

        #[tokio::test]
        async fn failed_analysis_surfaces_service_message() {
            let server = TestServer::start(polling(json!({
                "status": "failed",
                "error": {"code": "InvalidContent", "message": "The file is corrupted or format is unsupported."}
            })))
            .await;
            let doc = staged(b"%PDF");

            let err = client(&server, 30).analyze(doc.path()).await.unwrap_err();

            match err {
                ExtractionError::AnalysisFailed(msg) => {
                    assert_eq!(msg, "The file is corrupted or format is unsupported.")
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn unfinished_analysis_times_out() {
            let server = TestServer::start(polling(json!({"status": "running"}))).await;
            let doc = staged(b"%PDF");

            let err = client(&server, 0).analyze(doc.path()).await.unwrap_err();

            assert!(
                matches!(err, ExtractionError::TimedOut(d) if d == Duration::from_secs(0)),
                "{err:?}"
            );
            assert_eq!(server.requests().len(), 2);
        }
    }
}
