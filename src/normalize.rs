// src/normalize.rs

use crate::config::{CompletionBackend, CompletionSection};
use crate::doc_intel::RawExtraction;
use crate::record::FlatRecord;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str =
    "You are an expert at reading invoices and extracting clean structured data.";

/// Instruction preamble; the extraction JSON is appended after it.
const USER_PROMPT: &str = r#"You are given raw invoice data extracted from Azure Document Intelligence.
It contains key-value fields and also one or more tables.

Your task is to extract the required fields below and return them in JSON format with exactly the following keys (flat, no nesting). If a value is not found, use an empty string.

**Important Instructions:**
- Only extract energy usage (kWh) values from columns labeled with 'kWh', 'Energy Usage', or similar.
- **Do NOT use values from columns labeled 'DERS', 'DER', 'Solar', or 'Export'.**
- Return only a JSON object with the following keys and no extra text or explanation.

**Required Output Format:**
{
  "InvoiceNumber": "",
  "VendorName": "",
  "VendorTaxId": "",
  "CustomerName": "",
  "CustomerAddress": "",
  "InvoiceDate": "",
  "DueDate": "",
  "ServiceEndDate": "",
  "InvoiceTotal": "",
  "SubTotal": "",
  "TotalTax": "",
  "AmountDue": "",
  "EnergyUsage_kWh": ""
}

Extraction result:
"#;

static JSON_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\{.*\}").unwrap_or_else(|e| panic!("invalid JSON span regex: {e}"))
});

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("no JSON object found in completion response")]
    NoJsonFound,
    #[error("completion response is not a valid JSON object: {0}")]
    InvalidJson(String),
    #[error("completion service failed: {0}")]
    CompletionFailed(String),
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// The language-model completion collaborator.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, NormalizationError>;
}

/// Resolved endpoint configuration ready to make API calls.
struct ResolvedEndpoint {
    url: String,
    model: Option<String>,
    auth_header: (&'static str, String),
}

/// Resolve the completion config section into a concrete endpoint.
fn resolve_endpoint(cfg: &CompletionSection) -> Result<ResolvedEndpoint, NormalizationError> {
    match cfg.backend {
        CompletionBackend::Azure => {
            if cfg.endpoint.is_empty() || cfg.deployment.is_empty() {
                return Err(NormalizationError::CompletionFailed(
                    "OPENAI_ENDPOINT and OPENAI_DEPLOYMENT are required for the azure backend"
                        .into(),
                ));
            }
            info!(
                endpoint = %cfg.endpoint,
                deployment = %cfg.deployment,
                api_version = %cfg.api_version,
                "Using Azure OpenAI backend"
            );
            Ok(ResolvedEndpoint {
                url: format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    cfg.endpoint.trim_end_matches('/'),
                    cfg.deployment,
                    cfg.api_version
                ),
                // The deployment already pins the model.
                model: None,
                auth_header: ("api-key", cfg.key.clone()),
            })
        }
        CompletionBackend::OpenAi => {
            info!(url = %cfg.base_url, model = %cfg.model, "Using OpenAI-compatible backend");
            Ok(ResolvedEndpoint {
                url: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
                model: Some(cfg.model.clone()),
                auth_header: ("Authorization", format!("Bearer {}", cfg.key)),
            })
        }
    }
}

/// HTTP chat-completions client for either backend.
pub struct ChatCompletionClient {
    client: Client,
    cfg: CompletionSection,
}

impl ChatCompletionClient {
    pub fn new(cfg: CompletionSection) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }
}

#[async_trait]
impl CompletionService for ChatCompletionClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, NormalizationError> {
        let endpoint = resolve_endpoint(&self.cfg)?;
        let request = ChatRequest {
            model: endpoint.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: self.cfg.max_tokens,
            temperature: 0.0,
        };

        let failed = |e: reqwest::Error| NormalizationError::CompletionFailed(e.to_string());
        let response = self
            .client
            .post(&endpoint.url)
            .header(endpoint.auth_header.0, endpoint.auth_header.1)
            .json(&request)
            .send()
            .await
            .map_err(failed)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NormalizationError::CompletionFailed(format!(
                "completion API error {status}: {body}"
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(failed)?;
        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| NormalizationError::CompletionFailed("empty choices".into()))
    }
}

/// Build the user instruction embedding the raw extraction.
pub fn build_prompt(raw: &RawExtraction) -> String {
    let payload = serde_json::to_string_pretty(raw).unwrap_or_else(|_| "{}".to_string());
    format!("{USER_PROMPT}{payload}")
}

/// Take the first `{` through the last `}` of a free-text response.
pub fn extract_json_object(text: &str) -> Result<&str, NormalizationError> {
    JSON_SPAN
        .find(text)
        .map(|m| m.as_str())
        .ok_or(NormalizationError::NoJsonFound)
}

/// Parse a completion response into a flat record.
pub fn parse_completion(text: &str) -> Result<FlatRecord, NormalizationError> {
    let span = extract_json_object(text)?;
    let value: serde_json::Value =
        serde_json::from_str(span).map_err(|e| NormalizationError::InvalidJson(e.to_string()))?;
    let map = value
        .as_object()
        .ok_or_else(|| NormalizationError::InvalidJson("not a JSON object".into()))?;
    Ok(FlatRecord::from_json_map(map))
}

/// Turns a raw extraction into the 13-field schema with one completion call.
pub struct Normalizer {
    completion: std::sync::Arc<dyn CompletionService>,
}

impl Normalizer {
    pub fn new(completion: std::sync::Arc<dyn CompletionService>) -> Self {
        Self { completion }
    }

    pub async fn normalize(&self, raw: &RawExtraction) -> Result<FlatRecord, NormalizationError> {
        let prompt = build_prompt(raw);
        let text = self.completion.complete(SYSTEM_PROMPT, &prompt).await?;
        info!(chars = text.len(), "Completion received");

        let record = parse_completion(&text).inspect_err(|e| {
            warn!(error = %e, raw = %text, "Could not parse completion response");
        })?;

        if !record.extra.is_empty() {
            warn!(extra = ?record.extra.keys().collect::<Vec<_>>(), "Completion returned keys outside the schema");
        }
        let (filled, total) = record.fields.coverage();
        info!(filled, total, "Normalization complete");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc_intel::{TableCell, TableRecord};
    use std::sync::{Arc, Mutex};

    struct CannedCompletion {
        reply: String,
        prompts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CompletionService for CannedCompletion {
        async fn complete(&self, system: &str, user: &str) -> Result<String, NormalizationError> {
            self.prompts
                .lock()
                .unwrap()
                .push((system.to_string(), user.to_string()));
            Ok(self.reply.clone())
        }
    }

    fn canned(reply: &str) -> Arc<CannedCompletion> {
        Arc::new(CannedCompletion {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn extracts_object_from_surrounding_text() {
        let text = "Here is the result:\n{\"InvoiceNumber\":\"123\"}\nThanks";
        assert_eq!(extract_json_object(text).unwrap(), "{\"InvoiceNumber\":\"123\"}");
    }

    #[test]
    fn span_is_greedy_across_lines() {
        let text = "```json\n{\n  \"a\": {\"b\": \"c\"}\n}\n```";
        assert_eq!(extract_json_object(text).unwrap(), "{\n  \"a\": {\"b\": \"c\"}\n}");
    }

    #[test]
    fn no_braces_is_no_json_found() {
        let err = extract_json_object("I could not read this invoice.").unwrap_err();
        assert!(matches!(err, NormalizationError::NoJsonFound));
    }

    #[test]
    fn broken_object_is_invalid_json() {
        let err = parse_completion("{\"InvoiceNumber\": }").unwrap_err();
        assert!(matches!(err, NormalizationError::InvalidJson(_)));
    }

    #[test]
    fn prompt_embeds_extraction_and_exclusion_rule() {
        let raw = RawExtraction {
            fields: [("InvoiceId".to_string(), "INV-9".to_string())].into(),
            tables: vec![TableRecord {
                row_count: 1,
                column_count: 1,
                cells: vec![TableCell {
                    row_index: 0,
                    column_index: 0,
                    content: "DERS".into(),
                }],
            }],
        };
        let prompt = build_prompt(&raw);
        assert!(prompt.contains("\"InvoiceId\": \"INV-9\""));
        assert!(prompt.contains("\"rowIndex\": 0"));
        assert!(prompt.contains("Do NOT use values from columns labeled 'DERS'"));
        assert!(prompt.contains("\"EnergyUsage_kWh\": \"\""));
    }

    #[tokio::test]
    async fn normalize_sends_one_call_and_fills_schema() {
        let svc = canned("Sure!\n{\"InvoiceNumber\": \"123\", \"EnergyUsage_kWh\": 4200}");
        let normalizer = Normalizer::new(svc.clone());

        let record = normalizer.normalize(&RawExtraction::default()).await.unwrap();

        assert_eq!(record.fields.invoice_number, "123");
        assert_eq!(record.fields.energy_usage_kwh, "4200");
        assert_eq!(record.fields.vendor_name, "");
        let prompts = svc.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].0, SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn normalize_surfaces_missing_json() {
        let normalizer = Normalizer::new(canned("no data"));
        let err = normalizer
            .normalize(&RawExtraction::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizationError::NoJsonFound));
    }

    #[test]
    fn azure_endpoint_requires_deployment() {
        let cfg = CompletionSection::default();
        assert!(resolve_endpoint(&cfg).is_err());
    }

    #[test]
    fn azure_endpoint_url_shape() {
        let cfg = CompletionSection {
            endpoint: "https://acct.openai.azure.com/".into(),
            deployment: "gpt-4o".into(),
            key: "k".into(),
            ..CompletionSection::default()
        };
        let ep = resolve_endpoint(&cfg).unwrap();
        assert_eq!(
            ep.url,
            "https://acct.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-12-01-preview"
        );
        assert_eq!(ep.auth_header.0, "api-key");
        assert!(ep.model.is_none());
    }
}
