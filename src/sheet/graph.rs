use super::SheetError;
use crate::config::GraphConfig;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use urlencoding::encode;

/// Where to list drive children from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildrenOf<'a> {
    Root,
    /// Folder path relative to the drive root, e.g. `General`.
    Path(&'a str),
    Item(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriveItem {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
}

#[derive(Debug, Deserialize)]
struct UsedRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// The file-collaboration API the spreadsheet updater talks to.
#[async_trait]
pub trait WorkbookApi: Send + Sync {
    async fn access_token(&self) -> Result<String, SheetError>;
    async fn site_id(&self, token: &str, site_ref: &str) -> Result<String, SheetError>;
    async fn drive_id(&self, token: &str, site_id: &str) -> Result<String, SheetError>;
    async fn children(
        &self,
        token: &str,
        drive_id: &str,
        parent: ChildrenOf<'_>,
    ) -> Result<Vec<DriveItem>, SheetError>;
    async fn used_range(
        &self,
        token: &str,
        drive_id: &str,
        file_id: &str,
        sheet: &str,
    ) -> Result<Vec<Vec<Value>>, SheetError>;
    async fn patch_cell(
        &self,
        token: &str,
        drive_id: &str,
        file_id: &str,
        sheet: &str,
        address: &str,
        value: &str,
    ) -> Result<(), SheetError>;
}

/// Microsoft Graph implementation.
pub struct GraphClient {
    client: Client,
    cfg: GraphConfig,
}

impl GraphClient {
    pub fn new(cfg: GraphConfig) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, token: &str, path: &str) -> Result<Response, SheetError> {
        Ok(self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await?)
    }

    /// Run the client-credentials exchange, ignoring any pre-provisioned token.
    pub async fn client_credentials_token(&self) -> Result<String, SheetError> {
        let cfg = &self.cfg;
        if cfg.tenant_id.is_empty() || cfg.client_id.is_empty() || cfg.client_secret.is_empty() {
            return Err(SheetError::AuthFailed(
                "TENANT_ID, CLIENT_ID and CLIENT_SECRET are required".into(),
            ));
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            cfg.authority.trim_end_matches('/'),
            cfg.tenant_id
        );
        let body = format!(
            "client_id={}&scope={}&client_secret={}&grant_type=client_credentials",
            encode(&cfg.client_id),
            encode(&cfg.scope),
            encode(&cfg.client_secret),
        );

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(SheetError::AuthFailed(format!(
                "Token request failed: {status} - {error_text}"
            )));
        }

        let token: TokenResponse = resp.json().await?;
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SheetError::AuthFailed("token response had no access_token".into()))
    }
}

#[async_trait]
impl WorkbookApi for GraphClient {
    async fn access_token(&self) -> Result<String, SheetError> {
        let token = match self.cfg.access_token.as_deref().filter(|t| !t.is_empty()) {
            Some(t) => {
                info!("Using pre-provisioned Graph token");
                t.to_string()
            }
            None => self.client_credentials_token().await?,
        };
        log_token_subject(&token);
        Ok(token)
    }

    async fn site_id(&self, token: &str, site_ref: &str) -> Result<String, SheetError> {
        let resp = self.get(token, &format!("sites/{site_ref}")).await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), site = %site_ref, "Site lookup failed");
            let not_found = SheetError::SiteNotFound(site_ref.to_string());
            return Err(failure(resp, "site lookup", Some(not_found)).await);
        }
        let site: IdOnly = resp.json().await?;
        site.id
            .ok_or_else(|| SheetError::SiteNotFound(site_ref.to_string()))
    }

    async fn drive_id(&self, token: &str, site_id: &str) -> Result<String, SheetError> {
        let resp = self.get(token, &format!("sites/{site_id}/drive")).await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), site_id = %site_id, "Drive lookup failed");
            let not_found = SheetError::DriveNotFound(site_id.to_string());
            return Err(failure(resp, "drive lookup", Some(not_found)).await);
        }
        let drive: IdOnly = resp.json().await?;
        drive
            .id
            .ok_or_else(|| SheetError::DriveNotFound(site_id.to_string()))
    }

    async fn children(
        &self,
        token: &str,
        drive_id: &str,
        parent: ChildrenOf<'_>,
    ) -> Result<Vec<DriveItem>, SheetError> {
        let path = match parent {
            ChildrenOf::Root => format!("drives/{drive_id}/root/children"),
            ChildrenOf::Path(p) => format!(
                "drives/{drive_id}/root:/{}:/children",
                p.trim_matches('/')
            ),
            ChildrenOf::Item(id) => format!("drives/{drive_id}/items/{id}/children"),
        };
        let resp = self.get(token, &path).await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), path = %path, "Listing children failed");
            return Err(failure(resp, &format!("listing {path}"), None).await);
        }
        let page: ChildrenPage = resp.json().await?;
        Ok(page.value)
    }

    async fn used_range(
        &self,
        token: &str,
        drive_id: &str,
        file_id: &str,
        sheet: &str,
    ) -> Result<Vec<Vec<Value>>, SheetError> {
        let path = format!(
            "drives/{drive_id}/items/{file_id}/workbook/worksheets/{}/usedRange",
            encode(sheet)
        );
        let resp = self.get(token, &path).await?;
        if !resp.status().is_success() {
            return Err(failure(resp, &format!("used range of {sheet}"), None).await);
        }
        let range: UsedRange = resp.json().await?;
        Ok(range.values)
    }

    async fn patch_cell(
        &self,
        token: &str,
        drive_id: &str,
        file_id: &str,
        sheet: &str,
        address: &str,
        value: &str,
    ) -> Result<(), SheetError> {
        let path = format!(
            "drives/{drive_id}/items/{file_id}/workbook/worksheets/{}/range(address='{address}')",
            encode(sheet)
        );
        let resp = self
            .client
            .patch(self.url(&path))
            .bearer_auth(token)
            .json(&json!({ "values": [[value]] }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SheetError::PatchFailed {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Classify a non-success Graph response. 401 and 403 are auth failures, 404 is
/// `not_found` when the caller has one, anything else is unexpected.
async fn failure(resp: Response, what: &str, not_found: Option<SheetError>) -> SheetError {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        if let Some(err) = not_found {
            return err;
        }
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SheetError::AuthFailed(format!("{what}: {status} {body}"))
        }
        _ => SheetError::UnexpectedResponse(format!("{what}: {status} {body}")),
    }
}

/// Decode a JWT payload without verifying it.
pub fn decode_token_claims(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn log_token_subject(token: &str) {
    match decode_token_claims(token) {
        Some(claims) => {
            let upn = claims.get("upn").and_then(Value::as_str).unwrap_or("unknown");
            let app = claims.get("appid").and_then(Value::as_str).unwrap_or("unknown");
            info!(upn = %upn, appid = %app, "Token issued to");
        }
        None => warn!("Token decode failed"),
    }
}
