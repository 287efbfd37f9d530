// VeriCorp company verification tools

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_object, json_schema_string, Tool};
use anyhow::Result;
use reqwest::header;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const PROXY_SECRET_HEADER: &str = "x-rapidapi-proxy-secret";

/// Failures reaching the VeriCorp API.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid proxy secret: {0}")]
    Secret(#[from] header::InvalidHeaderValue),
}

/// Raw upstream reply: HTTP status plus body text.
pub struct UpstreamResponse {
    pub status: reqwest::StatusCode,
    pub body: String,
}

/// Shared HTTP client for the VeriCorp verification API.
///
/// Every request goes out as a GET carrying the proxy secret header; no tool
/// uses any other verb.
pub struct VeriCorpClient {
    client: reqwest::Client,
    base_url: url::Url,
}

impl VeriCorpClient {
    pub fn new(
        base_url: url::Url,
        proxy_secret: &str,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::HeaderName::from_static(PROXY_SECRET_HEADER),
            header::HeaderValue::from_str(proxy_secret)?,
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, base_url })
    }

    /// Issue a GET and capture status plus body text. Transport failures
    /// surface as errors; HTTP error statuses do not.
    pub async fn get_text(&self, path: &str) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.base_url.join(path)?;
        tracing::debug!(url = %url, "GET request to VeriCorp");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        Ok(UpstreamResponse { status, body })
    }
}

/// Map an upstream exchange onto tool content. Failures of any kind ride
/// back as text; this never produces a protocol-level error.
fn upstream_result(outcome: Result<UpstreamResponse, UpstreamError>) -> CallToolResult {
    match outcome {
        Ok(response) if response.status.is_success() => CallToolResult::text(response.body),
        Ok(response) => CallToolResult::text(format!(
            "API error ({}): {}",
            response.status.as_u16(),
            response.body
        )),
        Err(e) => CallToolResult::text(format!("Failed to reach VeriCorp API: {}", e)),
    }
}

#[derive(Debug, Deserialize)]
struct TaxIdArgs {
    tax_id: String,
}

/// Tool to look up company details by European tax ID.
pub struct CompanyLookupTool {
    client: Arc<VeriCorpClient>,
}

impl CompanyLookupTool {
    pub fn new(client: Arc<VeriCorpClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for CompanyLookupTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "vericorp_company_lookup".to_string(),
            description: "Look up a European company by tax ID. Returns company name, address, \
                          legal form, status, directors, and more. Supports 28 countries (27 EU + UK)."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "tax_id": json_schema_string(
                        "Tax ID with country prefix, e.g. PT502011378, DK10150817, GB00445790"
                    )
                }),
                vec!["tax_id"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        // A missing or non-string tax_id degrades to text like any other failure
        let args: TaxIdArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(_) => return Ok(CallToolResult::text("Missing required parameter: tax_id")),
        };

        let path = format!("/v1/company/{}", urlencoding::encode(&args.tax_id));
        Ok(upstream_result(self.client.get_text(&path).await))
    }
}

/// Tool to validate a European VAT number against VIES.
pub struct ValidateVatTool {
    client: Arc<VeriCorpClient>,
}

impl ValidateVatTool {
    pub fn new(client: Arc<VeriCorpClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for ValidateVatTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "vericorp_validate_vat".to_string(),
            description: "Validate a European VAT number. Checks format locally and verifies \
                          against VIES (EU VAT validation service). Returns validity status and \
                          company name if valid."
                .to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "tax_id": json_schema_string(
                        "VAT number with country prefix, e.g. PT502011378, DE123456789"
                    )
                }),
                vec!["tax_id"],
            ),
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let args: TaxIdArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(_) => return Ok(CallToolResult::text("Missing required parameter: tax_id")),
        };

        let path = format!("/v1/validate/{}", urlencoding::encode(&args.tax_id));
        Ok(upstream_result(self.client.get_text(&path).await))
    }
}

/// Tool to list the countries VeriCorp covers.
pub struct SupportedCountriesTool {
    client: Arc<VeriCorpClient>,
}

impl SupportedCountriesTool {
    pub fn new(client: Arc<VeriCorpClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for SupportedCountriesTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "vericorp_supported_countries".to_string(),
            description: "List all countries supported by VeriCorp. Shows which countries have \
                          full enrichment vs VAT-only validation."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
        }
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<CallToolResult> {
        Ok(upstream_result(self.client.get_text("/v1/countries").await))
    }
}
