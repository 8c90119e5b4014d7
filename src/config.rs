use serde::Deserialize;
use std::collections::BTreeMap;
use std::{env, fs, path::Path};
use toml_edit::{DocumentMut, value};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = ".config/invoice_pipeline.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub doc_intel: DocIntelConfig,
    #[serde(default)]
    pub completion: CompletionSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub workbook: WorkbookConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
    /// plant_id -> utility_type -> column letter
    #[serde(default = "default_plant_columns")]
    pub plant_columns: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_plant_columns() -> BTreeMap<String, BTreeMap<String, String>> {
    [("999", "B"), ("881", "B"), ("789", "C")]
        .into_iter()
        .map(|(plant, col)| {
            (
                plant.to_string(),
                BTreeMap::from([("electricity".to_string(), col.to_string())]),
            )
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Request body cap for `/upload`.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7071".to_string(),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocIntelConfig {
    pub endpoint: String,
    pub key: String,
    pub model_id: String,
    pub api_version: String,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for DocIntelConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            key: String::new(),
            model_id: "prebuilt-invoice".to_string(),
            api_version: "2024-11-30".to_string(),
            poll_interval_secs: 2,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionBackend {
    /// Azure OpenAI deployment addressed by endpoint + deployment + api version.
    Azure,
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionSection {
    pub backend: CompletionBackend,
    pub endpoint: String,
    pub key: String,
    pub deployment: String,
    pub api_version: String,
    /// Used by the `openai` backend only.
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            backend: CompletionBackend::Azure,
            endpoint: String::new(),
            key: String::new(),
            deployment: String::new(),
            api_version: "2024-12-01-preview".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
    pub table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "store/invoices.db".to_string(),
            table: "InvoiceData".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Directory backing the upload container.
    pub container_dir: String,
    /// Container name; event names may be prefixed with it.
    pub container: String,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            container_dir: "fileuploads".to_string(),
            container: "fileuploads".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub base_url: String,
    pub authority: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    /// Pre-provisioned bearer token. When set, no client-credentials exchange happens.
    pub access_token: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            authority: "https://login.microsoftonline.com".to_string(),
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: "https://graph.microsoft.com/.default".to_string(),
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMatch {
    /// File name equals `file_template` with `{plant_id}` substituted.
    Exact,
    /// First file whose name contains the plant id.
    Contains,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkbookConfig {
    /// Graph site path, e.g. `contoso.sharepoint.com:/sites/EnvironmentalData`.
    pub site_ref: String,
    /// Folder holding the plant folder, relative to the drive root. Empty = drive root.
    pub folder_parent: String,
    pub folder_name: String,
    pub file_match: FileMatch,
    pub file_template: String,
    pub sheet_name: String,
}

impl Default for WorkbookConfig {
    fn default() -> Self {
        Self {
            site_ref: String::new(),
            folder_parent: "General".to_string(),
            folder_name: "Plant Data".to_string(),
            file_match: FileMatch::Exact,
            file_template: "{plant_id} Utility and Environmental Test Data.xlsx".to_string(),
            sheet_name: "Utilities".to_string(),
        }
    }
}

impl WorkbookConfig {
    pub fn expected_file_name(&self, plant_id: &str) -> String {
        self.file_template.replace("{plant_id}", plant_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationMode {
    Disabled,
    /// POST the summary to a remote `/updateexcel` endpoint.
    Http,
    /// Call the spreadsheet updater in-process.
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub mode: PropagationMode,
    pub url: String,
    pub function_key: Option<String>,
    pub plant_id: String,
    pub utility_type: String,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            mode: PropagationMode::Disabled,
            url: String::new(),
            function_key: None,
            plant_id: "999".to_string(),
            utility_type: "electricity".to_string(),
        }
    }
}

impl Config {
    /// Load the TOML file at `path` (defaults when it does not exist), then
    /// apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        let content = if path.exists() {
            fs::read_to_string(path)?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            String::new()
        };
        let mut cfg = Self::parse(&content)?;
        cfg.apply_env(|name| env::var(name).ok());
        Ok(cfg)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Override secrets and endpoints from the environment. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DOC_INTEL_ENDPOINT") {
            self.doc_intel.endpoint = v;
        }
        if let Some(v) = get("DOC_INTEL_KEY") {
            self.doc_intel.key = v;
        }
        if let Some(v) = get("OPENAI_ENDPOINT") {
            self.completion.endpoint = v;
        }
        if let Some(v) = get("OPENAI_KEY") {
            self.completion.key = v;
        }
        if let Some(v) = get("OPENAI_DEPLOYMENT") {
            self.completion.deployment = v;
        }
        if let Some(v) = get("OPENAI_API_VERSION") {
            self.completion.api_version = v;
        }
        if let Some(v) = get("TENANT_ID") {
            self.graph.tenant_id = v;
        }
        if let Some(v) = get("CLIENT_ID") {
            self.graph.client_id = v;
        }
        if let Some(v) = get("CLIENT_SECRET") {
            self.graph.client_secret = v;
        }
        if let Some(v) = get("GRAPH_ACCESS_TOKEN") {
            self.graph.access_token = Some(v);
        }
        if let Some(v) = get("EXCEL_UPDATE_URL") {
            self.propagation.url = v;
        }
        if let Some(v) = get("EXCEL_UPDATE_KEY") {
            self.propagation.function_key = Some(v);
        }
    }

    /// Persist a freshly issued Graph token as the pre-provisioned token.
    pub fn update_access_token(
        path: impl AsRef<Path>,
        new_token: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let content = fs::read_to_string(&path).unwrap_or_default();
        let mut doc = content.parse::<DocumentMut>()?;

        doc["graph"]["access_token"] = value(new_token);

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, doc.to_string())?;
        Ok(())
    }
}
