//! Ledger API client
//!
//! Bearer-authenticated wrapper over the finance ledger's REST API.
//! Transactions arrive grouped with nested splits and are flattened into
//! [`Transaction`] rows; kind/category/tag filtering happens client-side
//! because the upstream search cannot express the tag conjunction.

use crate::config::LedgerCredentials;
use crate::error::DispatchError;
use crate::models::{
    BudgetStatus, DateRange, Transaction, TransactionKind, TransactionQuery, TransactionRequest,
    TransactionSummary,
};
use crate::retry::retry_with_backoff;
use crate::Result;
use chrono::{Duration as ChronoDuration, NaiveDate};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const PAGE_SIZE: u32 = 200;
const MAX_FETCH_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Boundary trait so the report pipeline can be exercised without a live
/// ledger.
#[async_trait::async_trait]
pub trait LedgerGateway: Send + Sync {
    async fn fetch_transactions(
        &self,
        credentials: &LedgerCredentials,
        range: DateRange,
        query: &TransactionQuery,
    ) -> Result<Vec<Transaction>>;

    async fn fetch_summary(
        &self,
        credentials: &LedgerCredentials,
        range: DateRange,
        query: &TransactionQuery,
    ) -> Result<TransactionSummary> {
        let transactions = self.fetch_transactions(credentials, range, query).await?;
        Ok(TransactionSummary::from_transactions(
            range.label(),
            transactions,
        ))
    }

    async fn add_transaction(
        &self,
        credentials: &LedgerCredentials,
        request: &TransactionRequest,
    ) -> Result<Value>;

    async fn budget_overview(
        &self,
        credentials: &LedgerCredentials,
        range: DateRange,
    ) -> Result<Vec<BudgetStatus>>;
}

//
// ================= Wire Format =================
//

#[derive(Debug, Deserialize)]
struct TransactionsPage {
    #[serde(default)]
    data: Vec<TransactionGroup>,
    meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
struct TransactionGroup {
    attributes: GroupAttributes,
}

#[derive(Debug, Deserialize)]
struct GroupAttributes {
    #[serde(default)]
    transactions: Vec<SplitAttributes>,
}

#[derive(Debug, Deserialize)]
struct SplitAttributes {
    date: String,
    description: String,
    amount: String,
    #[serde(rename = "type")]
    kind: String,
    category_name: Option<String>,
    budget_name: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    current_page: u32,
    last_page: u32,
}

#[derive(Debug, Deserialize)]
struct BudgetsPage {
    #[serde(default)]
    data: Vec<BudgetEntry>,
}

#[derive(Debug, Deserialize)]
struct BudgetEntry {
    id: String,
    attributes: BudgetAttributes,
}

#[derive(Debug, Deserialize)]
struct BudgetAttributes {
    name: String,
}

#[derive(Debug, Deserialize)]
struct LimitsPage {
    #[serde(default)]
    data: Vec<LimitEntry>,
}

#[derive(Debug, Deserialize)]
struct LimitEntry {
    attributes: LimitAttributes,
}

#[derive(Debug, Deserialize)]
struct LimitAttributes {
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    spent: Option<String>,
}

/// Flatten one wire split into a domain row. Splits with an unknown kind
/// or unparseable amount/date are dropped with a warning rather than
/// failing the whole window.
fn split_to_transaction(split: &SplitAttributes) -> Option<Transaction> {
    let kind = match split.kind.as_str() {
        "withdrawal" => TransactionKind::Withdrawal,
        "deposit" => TransactionKind::Deposit,
        "transfer" => TransactionKind::Transfer,
        other => {
            warn!(kind = other, "Skipping transaction split with unknown kind");
            return None;
        }
    };

    let date = NaiveDate::parse_from_str(split.date.get(..10)?, "%Y-%m-%d").ok()?;
    let amount: f64 = split.amount.parse().ok()?;

    Some(Transaction {
        date,
        description: split.description.clone(),
        amount,
        kind,
        category: split.category_name.clone(),
        budget: split.budget_name.clone(),
        tags: split.tags.clone(),
    })
}

/// Request body for transaction creation. Amounts go over the wire as
/// strings and unset optional fields are omitted entirely.
fn build_creation_payload(request: &TransactionRequest) -> Value {
    let mut tx = serde_json::Map::new();
    tx.insert("type".into(), json!(TransactionKind::Withdrawal.as_str()));
    tx.insert("date".into(), json!(request.date));
    tx.insert("amount".into(), json!(format!("{}", request.amount)));
    tx.insert("description".into(), json!(request.description));
    if let Some(source) = &request.source_account {
        tx.insert("source_name".into(), json!(source));
    }
    if let Some(destination) = &request.destination_account {
        tx.insert("destination_name".into(), json!(destination));
    }
    if let Some(category) = &request.category {
        tx.insert("category_name".into(), json!(category));
    }
    if let Some(budget) = &request.budget {
        tx.insert("budget_name".into(), json!(budget));
    }
    if let Some(tags) = &request.tags {
        tx.insert("tags".into(), json!(tags));
    }

    json!({ "transactions": [Value::Object(tx)] })
}

//
// ================= HTTP Client =================
//

pub struct LedgerClient {
    http: Client,
    default_base_url: String,
}

impl LedgerClient {
    pub fn new(default_base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self::with_client(http, default_base_url)
    }

    pub fn with_client(http: Client, default_base_url: impl Into<String>) -> Self {
        Self {
            http,
            default_base_url: default_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn base_url<'a>(&'a self, credentials: &'a LedgerCredentials) -> &'a str {
        credentials
            .api_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or(&self.default_base_url)
    }

    async fn get_page(
        &self,
        credentials: &LedgerCredentials,
        range: DateRange,
        page: u32,
    ) -> Result<TransactionsPage> {
        let url = format!("{}/transactions", self.base_url(credentials));
        // The upstream window is inclusive on both ends
        let end_inclusive = range.end - ChronoDuration::days(1);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&credentials.access_token)
            .header("Accept", "application/json")
            .query(&[
                ("start", range.start.to_string()),
                ("end", end_inclusive.to_string()),
                ("page", page.to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ])
            .send()
            .await
            .map_err(|e| DispatchError::DataFetch(format!("transaction query failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::DataFetch(format!(
                "ledger returned {} for {}: {}",
                status, url, body
            )));
        }

        response
            .json::<TransactionsPage>()
            .await
            .map_err(|e| DispatchError::DataFetch(format!("invalid transactions response: {}", e)))
    }
}

#[async_trait::async_trait]
impl LedgerGateway for LedgerClient {
    async fn fetch_transactions(
        &self,
        credentials: &LedgerCredentials,
        range: DateRange,
        query: &TransactionQuery,
    ) -> Result<Vec<Transaction>> {
        let mut transactions = Vec::new();
        let mut page = 1;

        loop {
            let fetched = retry_with_backoff(MAX_FETCH_ATTEMPTS, RETRY_BASE_DELAY, "ledger.transactions", || {
                self.get_page(credentials, range, page)
            })
            .await?;

            let page_count = fetched.data.len();
            for group in &fetched.data {
                for split in &group.attributes.transactions {
                    if let Some(tx) = split_to_transaction(split) {
                        if query.matches(&tx) {
                            transactions.push(tx);
                        }
                    }
                }
            }

            let last_page = fetched
                .meta
                .as_ref()
                .and_then(|m| m.pagination.as_ref())
                .map(|p| p.current_page >= p.last_page)
                .unwrap_or(true);

            debug!(page, page_count, total = transactions.len(), "Fetched transaction page");

            if last_page || page_count == 0 {
                break;
            }
            page += 1;
        }

        info!(
            start = %range.start,
            end = %range.end,
            matched = transactions.len(),
            "Transaction window fetched"
        );

        Ok(transactions)
    }

    async fn add_transaction(
        &self,
        credentials: &LedgerCredentials,
        request: &TransactionRequest,
    ) -> Result<Value> {
        let url = format!("{}/transactions", self.base_url(credentials));
        let payload = build_creation_payload(request);

        let body = retry_with_backoff(MAX_FETCH_ATTEMPTS, RETRY_BASE_DELAY, "ledger.add_transaction", || async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&credentials.access_token)
                .header("Accept", "application/json")
                .json(&payload)
                .send()
                .await
                .map_err(|e| DispatchError::DataFetch(format!("transaction create failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(DispatchError::DataFetch(format!(
                    "ledger returned {} for transaction create: {}",
                    status, text
                )));
            }

            response
                .json::<Value>()
                .await
                .map_err(|e| DispatchError::DataFetch(format!("invalid create response: {}", e)))
        })
        .await?;

        info!(
            id = body.pointer("/data/id").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "Transaction created"
        );
        Ok(body)
    }

    async fn budget_overview(
        &self,
        credentials: &LedgerCredentials,
        range: DateRange,
    ) -> Result<Vec<BudgetStatus>> {
        let base = self.base_url(credentials).to_string();
        let budgets_url = format!("{}/budgets", base);

        let budgets = retry_with_backoff(MAX_FETCH_ATTEMPTS, RETRY_BASE_DELAY, "ledger.budgets", || async {
            let response = self
                .http
                .get(&budgets_url)
                .bearer_auth(&credentials.access_token)
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| DispatchError::DataFetch(format!("budget query failed: {}", e)))?;
            if !response.status().is_success() {
                return Err(DispatchError::DataFetch(format!(
                    "ledger returned {} for budgets",
                    response.status()
                )));
            }
            response
                .json::<BudgetsPage>()
                .await
                .map_err(|e| DispatchError::DataFetch(format!("invalid budgets response: {}", e)))
        })
        .await?;

        let end_inclusive = range.end - ChronoDuration::days(1);
        let mut overview = Vec::with_capacity(budgets.data.len());

        for budget in &budgets.data {
            let limits_url = format!("{}/budgets/{}/limits", base, budget.id);
            let limits = self
                .http
                .get(&limits_url)
                .bearer_auth(&credentials.access_token)
                .header("Accept", "application/json")
                .query(&[
                    ("start", range.start.to_string()),
                    ("end", end_inclusive.to_string()),
                ])
                .send()
                .await
                .map_err(|e| DispatchError::DataFetch(format!("budget limits failed: {}", e)))?
                .json::<LimitsPage>()
                .await
                .map_err(|e| DispatchError::DataFetch(format!("invalid limits response: {}", e)))?;

            let mut total_budget = 0.0;
            let mut total_spent = 0.0;
            for limit in &limits.data {
                total_budget += limit
                    .attributes
                    .amount
                    .as_deref()
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                // Spent amounts come back negative
                total_spent += limit
                    .attributes
                    .spent
                    .as_deref()
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0)
                    .abs();
            }

            overview.push(BudgetStatus {
                name: budget.attributes.name.clone(),
                total_budget,
                total_spent,
                remaining: (total_budget - total_spent).max(0.0),
            });
        }

        Ok(overview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(kind: &str, category: Option<&str>, tags: &[&str]) -> SplitAttributes {
        SplitAttributes {
            date: "2025-06-15T12:00:00+08:00".to_string(),
            description: "外卖午餐".to_string(),
            amount: "32.50".to_string(),
            kind: kind.to_string(),
            category_name: category.map(|c| c.to_string()),
            budget_name: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_split_flattening() {
        let tx = split_to_transaction(&split("withdrawal", Some("餐饮"), &["外卖"])).unwrap();
        assert_eq!(tx.kind, TransactionKind::Withdrawal);
        assert_eq!(tx.amount, 32.50);
        assert_eq!(tx.date, NaiveDate::from_ymd_opt(2025, 6, 15).unwrap());
        assert_eq!(tx.category.as_deref(), Some("餐饮"));

        assert!(split_to_transaction(&split("opening-balance", None, &[])).is_none());

        let mut bad_amount = split("deposit", None, &[]);
        bad_amount.amount = "N/A".to_string();
        assert!(split_to_transaction(&bad_amount).is_none());
    }

    #[test]
    fn test_default_query_filters_transfers_out() {
        let splits = [
            split("withdrawal", Some("餐饮"), &[]),
            split("deposit", None, &[]),
            split("transfer", None, &[]),
        ];
        let query = TransactionQuery::default();
        let matched: Vec<_> = splits
            .iter()
            .filter_map(split_to_transaction)
            .filter(|tx| query.matches(tx))
            .collect();

        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|tx| tx.kind != TransactionKind::Transfer));
    }

    #[test]
    fn test_category_and_tags_filter_count_is_exact() {
        let splits = [
            split("withdrawal", Some("餐饮"), &["外卖", "工作餐"]),
            split("withdrawal", Some("餐饮"), &["外卖", "工作餐", "加班"]),
            split("withdrawal", Some("餐饮"), &["外卖"]),
            split("withdrawal", Some("交通"), &["外卖", "工作餐"]),
            split("deposit", Some("餐饮"), &["外卖", "工作餐"]),
        ];
        let query = TransactionQuery {
            kinds: None,
            category: Some("餐饮".to_string()),
            tags: vec!["外卖".to_string(), "工作餐".to_string()],
        };

        let matched: Vec<_> = splits
            .iter()
            .filter_map(split_to_transaction)
            .filter(|tx| query.matches(tx))
            .collect();

        // Category must equal AND every listed tag must be present; the
        // deposit row still matches because kinds default to both.
        assert_eq!(matched.len(), 3);
    }

    #[test]
    fn test_creation_payload_shape() {
        let request = TransactionRequest {
            amount: 25.5,
            description: "午餐".to_string(),
            date: "2025-06-26".to_string(),
            source_account: Some("现金".to_string()),
            destination_account: None,
            category: Some("餐饮".to_string()),
            budget: None,
            tags: Some(vec!["外卖".to_string()]),
        };

        let payload = build_creation_payload(&request);
        let tx = &payload["transactions"][0];

        assert_eq!(tx["type"], "withdrawal");
        assert_eq!(tx["amount"], "25.5");
        assert_eq!(tx["source_name"], "现金");
        assert_eq!(tx["category_name"], "餐饮");
        // Unset optionals are omitted, not null
        assert!(tx.get("destination_name").is_none());
        assert!(tx.get("budget_name").is_none());
    }
}
