use crate::sheet::{SheetError, SheetUpdate, SpreadsheetUpdater};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PropagationError {
    #[error("update endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("update endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Sheet(#[from] SheetError),
}

/// Hands a derived monthly value to the spreadsheet updater's entry point.
#[async_trait]
pub trait Propagator: Send + Sync {
    async fn propagate(&self, update: &SheetUpdate) -> Result<(), PropagationError>;
}

/// POSTs to a remote `/updateexcel` endpoint.
pub struct HttpPropagator {
    client: Client,
    url: String,
    function_key: Option<String>,
}

impl HttpPropagator {
    pub fn new(url: impl Into<String>, function_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            function_key,
        }
    }
}

#[async_trait]
impl Propagator for HttpPropagator {
    async fn propagate(&self, update: &SheetUpdate) -> Result<(), PropagationError> {
        let mut req = self.client.post(&self.url).json(update);
        if let Some(key) = &self.function_key {
            req = req.header("x-functions-key", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PropagationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(url = %self.url, "Triggered Excel update function");
        Ok(())
    }
}

/// Calls the updater in-process.
pub struct LocalPropagator {
    updater: Arc<SpreadsheetUpdater>,
}

impl LocalPropagator {
    pub fn new(updater: Arc<SpreadsheetUpdater>) -> Self {
        Self { updater }
    }
}

#[async_trait]
impl Propagator for LocalPropagator {
    async fn propagate(&self, update: &SheetUpdate) -> Result<(), PropagationError> {
        let target = self.updater.update(update).await?;
        info!(address = %target.address(), "Propagated value into workbook");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkbookConfig;
    use crate::sheet::tests::{FakeWorkbook, updater_with};
    use serde_json::json;

    #[tokio::test]
    async fn local_propagator_surfaces_sheet_errors() {
        let api = Arc::new(FakeWorkbook::with_rows(json!([["01/01/2020"]])));
        let prop = LocalPropagator::new(Arc::new(updater_with(api, WorkbookConfig::default())));
        let err = prop
            .propagate(&SheetUpdate {
                year_month: "2024-05".into(),
                value: "1".into(),
                plant_id: "999".into(),
                utility_type: "electricity".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PropagationError::Sheet(SheetError::DateNotFound(_))));
    }

    #[tokio::test]
    async fn http_propagator_posts_summary_with_function_key() {
        use axum::{Json, Router, http::HeaderMap, http::StatusCode, routing::post};
        use std::sync::Mutex;

        let seen: Arc<Mutex<Vec<(Option<String>, SheetUpdate)>>> = Arc::default();
        let sink = seen.clone();
        let app = Router::new().route(
            "/api/updateexcel",
            post(move |headers: HeaderMap, Json(body): Json<SheetUpdate>| {
                let sink = sink.clone();
                async move {
                    let key = headers
                        .get("x-functions-key")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let reject = body.plant_id == "000";
                    sink.lock().unwrap().push((key, body));
                    if reject {
                        (StatusCode::BAD_REQUEST, "Unsupported plant_id: 000")
                    } else {
                        (StatusCode::OK, "Excel updated successfully")
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let prop = HttpPropagator::new(
            format!("http://{addr}/api/updateexcel"),
            Some("fn-key".into()),
        );
        let mut update = SheetUpdate {
            year_month: "2024-05".into(),
            value: "4200".into(),
            plant_id: "999".into(),
            utility_type: "electricity".into(),
        };
        prop.propagate(&update).await.unwrap();

        update.plant_id = "000".into();
        let err = prop.propagate(&update).await.unwrap_err();
        assert!(matches!(err, PropagationError::Rejected { status: 400, .. }));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.as_deref(), Some("fn-key"));
        assert_eq!(seen[0].1.year_month, "2024-05");
    }
}
