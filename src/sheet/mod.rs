// src/sheet/mod.rs

mod columns;
mod date_match;
mod graph;

pub use columns::ColumnResolver;
pub use date_match::{YearMonth, find_row};
pub use graph::{ChildrenOf, DriveItem, GraphClient, WorkbookApi};

use crate::config::{FileMatch, WorkbookConfig};
use crate::record::stringify;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, info, info_span};

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("Missing parameters")]
    MissingParameters,
    #[error("Invalid date format: {0}. Expected 'YYYY-MM'")]
    InvalidDateFormat(String),
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("Site '{0}' not found")]
    SiteNotFound(String),
    #[error("Drive for site '{0}' not found")]
    DriveNotFound(String),
    #[error("Folder '{0}' not found")]
    FolderNotFound(String),
    #[error("Excel file '{0}' not found")]
    FileNotFound(String),
    #[error("{0}")]
    UnsupportedPlantOrUtility(String),
    #[error("Date {0} not found in column A")]
    DateNotFound(String),
    #[error("Failed to update cell ({status}): {body}")]
    PatchFailed { status: u16, body: String },
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl SheetError {
    /// HTTP status the `/updateexcel` endpoint answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingParameters
            | Self::InvalidDateFormat(_)
            | Self::UnsupportedPlantOrUtility(_) => 400,
            Self::SiteNotFound(_)
            | Self::DriveNotFound(_)
            | Self::FolderNotFound(_)
            | Self::FileNotFound(_)
            | Self::DateNotFound(_) => 404,
            _ => 500,
        }
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    Ok(stringify(&v))
}

/// Body of `/updateexcel` and the payload the pipeline propagates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetUpdate {
    #[serde(default, deserialize_with = "lenient_string")]
    pub year_month: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub plant_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub utility_type: String,
}

impl SheetUpdate {
    fn is_complete(&self) -> bool {
        [&self.year_month, &self.value, &self.plant_id, &self.utility_type]
            .iter()
            .all(|s| !s.trim().is_empty())
    }
}

/// Where one update landed. Resolved per request, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadsheetTarget {
    pub site_id: String,
    pub drive_id: String,
    pub folder_id: String,
    pub file_id: String,
    pub sheet_name: String,
    pub column_letter: String,
    pub target_row: u32,
}

impl SpreadsheetTarget {
    pub fn address(&self) -> String {
        format!("{}{}", self.column_letter, self.target_row)
    }
}

/// Writes one monthly value into a plant's workbook.
pub struct SpreadsheetUpdater {
    api: Arc<dyn WorkbookApi>,
    workbook: WorkbookConfig,
    columns: ColumnResolver,
}

impl SpreadsheetUpdater {
    pub fn new(api: Arc<dyn WorkbookApi>, workbook: WorkbookConfig, columns: ColumnResolver) -> Self {
        Self {
            api,
            workbook,
            columns,
        }
    }

    pub async fn update(&self, req: &SheetUpdate) -> Result<SpreadsheetTarget, SheetError> {
        let span = info_span!(
            "sheet_update",
            plant_id = %req.plant_id,
            utility = %req.utility_type,
            year_month = %req.year_month
        );
        self.run(req).instrument(span).await
    }

    async fn run(&self, req: &SheetUpdate) -> Result<SpreadsheetTarget, SheetError> {
        if !req.is_complete() {
            return Err(SheetError::MissingParameters);
        }
        let target_month: YearMonth = req.year_month.trim().parse()?;
        let plant_id = req.plant_id.trim();
        let column_letter = self
            .columns
            .resolve(plant_id, req.utility_type.trim())?
            .to_string();

        let token = self.api.access_token().await?;

        let site_id = self.api.site_id(&token, &self.workbook.site_ref).await?;
        info!(site_id = %site_id, "Site resolved");

        let drive_id = self.api.drive_id(&token, &site_id).await?;
        info!(drive_id = %drive_id, "Drive resolved");

        let parent = match self.workbook.folder_parent.trim_matches('/') {
            "" => ChildrenOf::Root,
            p => ChildrenOf::Path(p),
        };
        let folder_id = self
            .api
            .children(&token, &drive_id, parent)
            .await?
            .into_iter()
            .find(|item| item.name == self.workbook.folder_name)
            .map(|item| item.id)
            .ok_or_else(|| SheetError::FolderNotFound(self.workbook.folder_name.clone()))?;
        info!(folder_id = %folder_id, folder = %self.workbook.folder_name, "Folder resolved");

        let files = self
            .api
            .children(&token, &drive_id, ChildrenOf::Item(&folder_id))
            .await?;
        let file = self.pick_file(plant_id, files)?;
        info!(file_id = %file.id, file = %file.name, "Workbook resolved");

        let sheet_name = self.workbook.sheet_name.clone();
        let rows = self
            .api
            .used_range(&token, &drive_id, &file.id, &sheet_name)
            .await?;
        info!(rows = rows.len(), sheet = %sheet_name, "Used range fetched");

        let target_row = find_row(target_month, &rows)
            .ok_or_else(|| SheetError::DateNotFound(req.year_month.trim().to_string()))?;

        let target = SpreadsheetTarget {
            site_id,
            drive_id,
            folder_id,
            file_id: file.id,
            sheet_name,
            column_letter,
            target_row,
        };
        let address = target.address();
        info!(address = %address, value = %req.value, "Patching cell");

        self.api
            .patch_cell(
                &token,
                &target.drive_id,
                &target.file_id,
                &target.sheet_name,
                &address,
                &req.value,
            )
            .await?;

        info!(address = %address, "Excel updated successfully");
        Ok(target)
    }

    fn pick_file(&self, plant_id: &str, files: Vec<DriveItem>) -> Result<DriveItem, SheetError> {
        match self.workbook.file_match {
            FileMatch::Exact => {
                let expected = self.workbook.expected_file_name(plant_id);
                files
                    .into_iter()
                    .find(|f| f.name == expected)
                    .ok_or(SheetError::FileNotFound(expected))
            }
            FileMatch::Contains => files
                .into_iter()
                .find(|f| f.name.contains(plant_id))
                .ok_or_else(|| SheetError::FileNotFound(format!("*{plant_id}*"))),
        }
    }
}
