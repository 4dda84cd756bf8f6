//! Notification dispatch to per-user chat webhooks
//!
//! Delivers plain-text bot messages (`msgtype: text`) to the user's
//! configured webhook URL, signing the payload when a secret is set.
//! Delivery is synchronous with one bounded immediate retry; longer-term
//! retries belong to the scheduler's per-period attempt budget.

use crate::auth;
use crate::config::NotificationConfig;
use crate::error::DispatchError;
use crate::models::{BudgetStatus, ReportKind, ReportResult};
use crate::retry::retry_with_backoff;
use crate::Result;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

const DELIVERY_ATTEMPTS: u32 = 2;
const DELIVERY_RETRY_DELAY: Duration = Duration::from_millis(500);

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, config: &NotificationConfig, message: &str) -> Result<()>;
}

//
// ================= Message Formatting =================
//

pub fn report_title(kind: ReportKind, locale: &str) -> &'static str {
    if locale.starts_with("en") {
        match kind {
            ReportKind::Daily => "📊 Daily Financial Report",
            ReportKind::Weekly => "📈 Weekly Financial Report",
            ReportKind::Monthly => "📋 Monthly Financial Report",
            ReportKind::Yearly => "📊 Yearly Financial Report",
        }
    } else {
        match kind {
            ReportKind::Daily => "📊 财务日报",
            ReportKind::Weekly => "📈 财务周报",
            ReportKind::Monthly => "📋 财务月报",
            ReportKind::Yearly => "📊 财务年报",
        }
    }
}

/// Title plus body. Workflow output sometimes arrives with literal `\n`
/// sequences; unescape them so the bot renders line breaks.
pub fn format_report_message(result: &ReportResult, locale: &str) -> String {
    format!(
        "{}\n\n{}",
        report_title(result.kind, locale),
        result.content.replace("\\n", "\n")
    )
}

/// A ledger transaction event as surfaced to the user.
#[derive(Debug, Clone)]
pub struct TransactionNotice {
    pub trigger: String,
    pub description: String,
    pub amount: String,
    pub category: String,
    pub budget: String,
}

pub fn format_transaction_message(notice: &TransactionNotice) -> String {
    let action = match notice.trigger.as_str() {
        "STORE_TRANSACTION" => "您新增了一笔交易",
        "UPDATE_TRANSACTION" => "您更新了一笔交易",
        _ => "交易操作",
    };
    format!(
        "{}：{}, 费用：{}，分类：{}，预算：{}。",
        action, notice.description, notice.amount, notice.category, notice.budget
    )
}

pub fn append_budget_overview(message: &mut String, budgets: &[BudgetStatus]) {
    if budgets.is_empty() {
        return;
    }
    message.push_str("\n交易处理完成，当前预算情况:");
    for budget in budgets {
        message.push_str(&format!(
            "\n{}: 预算 {:.2}，支出 {:.2}，剩余 {:.2} 元",
            budget.name, budget.total_budget, budget.total_spent, budget.remaining
        ));
    }
}

//
// ================= Webhook Dispatcher =================
//

pub struct WebhookDispatcher {
    http: Client,
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        let http = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self { http }
    }

    async fn post_message(&self, config: &NotificationConfig, message: &str) -> Result<()> {
        let payload = json!({
            "msgtype": "text",
            "text": { "content": message }
        });
        let body = serde_json::to_vec(&payload)?;

        let mut request = self
            .http
            .post(&config.webhook_url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "finance-report-dispatcher/0.1");

        if !config.webhook_secret.is_empty() {
            let timestamp = chrono::Utc::now().timestamp().to_string();
            request = request.header(
                "Signature",
                auth::sign_payload(&config.webhook_secret, &timestamp, &body),
            );
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| DispatchError::Delivery(format!("webhook post failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DispatchError::Delivery(format!(
                "webhook returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        debug!(chars = message.len(), "Webhook message delivered");
        Ok(())
    }
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookDispatcher {
    async fn send(&self, config: &NotificationConfig, message: &str) -> Result<()> {
        if !config.enabled {
            warn!("Notifications disabled for this user, dropping message");
            return Err(DispatchError::Delivery(
                "notifications disabled".to_string(),
            ));
        }
        if message.trim().is_empty() {
            warn!("Refusing to deliver empty message");
            return Err(DispatchError::Delivery("empty message".to_string()));
        }

        retry_with_backoff(DELIVERY_ATTEMPTS, DELIVERY_RETRY_DELAY, "notify.webhook", || {
            self.post_message(config, message)
        })
        .await?;

        info!("Notification delivered");
        Ok(())
    }
}
