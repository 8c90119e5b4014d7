mod api;
mod blob;
mod config;
mod doc_intel;
mod normalize;
mod pipeline;
mod propagate;
mod record;
mod record_store;
mod sheet;
#[cfg(test)]
mod test_server;

use blob::FsContainer;
use config::{Config, PropagationMode};
use doc_intel::DocIntelClient;
use normalize::{ChatCompletionClient, Normalizer};
use pipeline::{Pipeline, PipelineOutcome, PropagationTarget};
use propagate::{HttpPropagator, LocalPropagator, Propagator};
use record_store::{RecordStore, SqliteRecordStore};
use sheet::{ColumnResolver, GraphClient, SheetUpdate, SpreadsheetUpdater};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: invoice_pipeline [serve | ingest <file> | update-sheet <YYYY-MM> <value> <plant_id> <utility_type> | get-record <PartitionKey> <RowKey> | refresh-token]";

struct Components {
    store: Arc<SqliteRecordStore>,
    graph: Arc<GraphClient>,
    updater: Arc<SpreadsheetUpdater>,
    pipeline: Arc<Pipeline>,
    blobs: Arc<FsContainer>,
}

fn build(cfg: &Config) -> Result<Components, Box<dyn std::error::Error>> {
    let store = Arc::new(SqliteRecordStore::new(&cfg.store.db_path, &cfg.store.table)?);
    info!(path = %cfg.store.db_path, records = store.count()?, "Record store ready");
    let graph = Arc::new(GraphClient::new(cfg.graph.clone()));
    let updater = Arc::new(SpreadsheetUpdater::new(
        graph.clone(),
        cfg.workbook.clone(),
        ColumnResolver::new(cfg.plant_columns.clone()),
    ));

    let propagator: Option<Arc<dyn Propagator>> = match cfg.propagation.mode {
        PropagationMode::Disabled => None,
        PropagationMode::Http if cfg.propagation.url.is_empty() => {
            warn!("Propagation mode is http but no update URL is configured, disabling");
            None
        }
        PropagationMode::Http => Some(Arc::new(HttpPropagator::new(
            cfg.propagation.url.clone(),
            cfg.propagation.function_key.clone(),
        ))),
        PropagationMode::Local => Some(Arc::new(LocalPropagator::new(updater.clone()))),
    };
    let propagation = propagator.map(|propagator| PropagationTarget {
        propagator,
        plant_id: cfg.propagation.plant_id.clone(),
        utility_type: cfg.propagation.utility_type.clone(),
    });

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(DocIntelClient::new(cfg.doc_intel.clone())),
        Normalizer::new(Arc::new(ChatCompletionClient::new(cfg.completion.clone()))),
        store.clone(),
        propagation,
    ));
    let blobs = Arc::new(FsContainer::new(cfg.blob.container_dir.clone(), &cfg.blob.container));

    Ok(Components {
        store,
        graph,
        updater,
        pipeline,
        blobs,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional
    let _ = dotenvy::dotenv();

    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Install crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;

    let config_path = std::env::var("INVOICE_PIPELINE_CONFIG")
        .unwrap_or_else(|_| config::DEFAULT_CONFIG_PATH.to_string());
    let cfg = Config::load(&config_path)?;
    let app = build(&cfg)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        [] | ["serve"] => {
            let state = api::AppState {
                store: app.store,
                updater: app.updater,
                pipeline: app.pipeline,
                blobs: app.blobs,
                max_upload_bytes: cfg.server.max_upload_bytes,
            };
            let listener = tokio::net::TcpListener::bind(&cfg.server.bind).await?;
            info!(addr = %listener.local_addr()?, "Listening");
            axum::serve(listener, api::router(state)).await?;
        }
        ["ingest", file] => {
            let path = Path::new(file);
            let body = tokio::fs::read(path).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.to_string());
            match app.pipeline.process(&name, &body).await? {
                PipelineOutcome::Skipped { name } => info!(name = %name, "Skipped"),
                PipelineOutcome::Completed {
                    record,
                    propagation,
                } => {
                    info!(
                        partition_key = %record.partition_key,
                        row_key = %record.row_key,
                        propagation = ?propagation,
                        "Ingested"
                    );
                    println!("{}", serde_json::to_string_pretty(&record.to_entity_json())?);
                }
            }
        }
        ["update-sheet", year_month, value, plant_id, utility_type] => {
            let target = app
                .updater
                .update(&SheetUpdate {
                    year_month: year_month.to_string(),
                    value: value.to_string(),
                    plant_id: plant_id.to_string(),
                    utility_type: utility_type.to_string(),
                })
                .await?;
            info!(file_id = %target.file_id, address = %target.address(), "Excel updated successfully");
        }
        ["get-record", partition_key, row_key] => {
            let record = app.store.get(partition_key, row_key)?;
            println!("{}", serde_json::to_string_pretty(&record.to_entity_json())?);
        }
        ["refresh-token"] => {
            let token = app.graph.client_credentials_token().await?;
            Config::update_access_token(&config_path, &token)?;
            info!(path = %config_path, "Stored new Graph access token");
        }
        _ => return Err(USAGE.into()),
    }

    Ok(())
}
