//! AI workflow client
//!
//! Invokes the external report-generation workflow (a Dify-style
//! conversational app) with a prompt plus formatted financial data and
//! returns the generated text. Uses a long-lived reqwest::Client for
//! connection pooling.

use crate::config::WorkflowConfig;
use crate::error::DispatchError;
use crate::models::ReportKind;
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Everything one workflow invocation needs besides credentials.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub kind: ReportKind,
    /// The configured natural-language prompt for this report kind
    pub report_query: String,
    /// Pre-formatted transaction summary text, empty when no data applies
    pub transaction_data: String,
    /// End-user identifier forwarded to the workflow
    pub user: String,
}

#[async_trait::async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, config: &WorkflowConfig, request: &WorkflowRequest) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatMessageRequest<'a> {
    inputs: ChatInputs<'a>,
    query: String,
    response_mode: &'static str,
    user: &'a str,
    /// Empty string starts a fresh conversation
    conversation_id: &'static str,
    auto_generate_name: bool,
}

#[derive(Debug, Serialize)]
struct ChatInputs<'a> {
    report_type: &'a str,
    report_query: &'a str,
    transaction_data: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    answer: Option<String>,
    message: Option<String>,
    content: Option<String>,
    text: Option<String>,
    message_id: Option<String>,
    id: Option<String>,
}

/// The answer normally lives in `answer`; older workflow deployments used
/// other field names.
fn extract_answer(response: &ChatMessageResponse) -> Option<String> {
    [&response.answer, &response.message, &response.content, &response.text]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .cloned()
}

fn build_query(request: &WorkflowRequest) -> String {
    if request.transaction_data.is_empty() {
        return request.report_query.clone();
    }
    format!(
        "{}\n\n交易数据:\n{}\n\n请根据以上数据生成 {} 报告。",
        request.report_query, request.transaction_data, request.kind
    )
}

pub struct WorkflowClient {
    http: Client,
    base_url: String,
}

impl WorkflowClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        // Workflow runs can take a while; the timeout is well above the
        // ledger client's.
        let http = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ReportGenerator for WorkflowClient {
    async fn generate(&self, config: &WorkflowConfig, request: &WorkflowRequest) -> Result<String> {
        if !config.enabled {
            return Err(DispatchError::Workflow(
                "workflow disabled for this user".to_string(),
            ));
        }

        let url = format!("{}/chat-messages", self.base_url);
        let body = ChatMessageRequest {
            inputs: ChatInputs {
                report_type: request.kind.as_str(),
                report_query: &request.report_query,
                transaction_data: &request.transaction_data,
            },
            query: build_query(request),
            response_mode: "blocking",
            user: &request.user,
            conversation_id: "",
            auto_generate_name: false,
        };

        info!(kind = %request.kind, user = %request.user, "Calling report workflow");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&config.api_key)
            .header("Content-Type", "application/json; charset=utf-8")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Workflow request failed: {}", e);
                DispatchError::Workflow(format!("workflow request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, "Workflow returned error response: {}", text);
            return Err(DispatchError::Workflow(format!(
                "workflow returned {}: {}",
                status, text
            )));
        }

        let parsed: ChatMessageResponse = response.json().await.map_err(|e| {
            error!("Failed to parse workflow response: {}", e);
            DispatchError::Workflow(format!("workflow parse error: {}", e))
        })?;

        let answer = extract_answer(&parsed).ok_or_else(|| {
            DispatchError::Workflow("empty answer from workflow".to_string())
        })?;

        info!(
            run_id = parsed
                .message_id
                .as_deref()
                .or(parsed.id.as_deref())
                .unwrap_or("unknown"),
            chars = answer.len(),
            "Workflow run completed"
        );

        Ok(answer)
    }
}
