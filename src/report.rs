//! Report generation service
//!
//! Orchestrates one report: compute the calendar window, pull the ledger
//! data, build the workflow prompt, invoke the workflow, and validate the
//! answer. Failures propagate as typed errors for the scheduler to retry
//! within its per-period budget; they never crash the tick loop.

use crate::config::UserProfile;
use crate::error::DispatchError;
use crate::ledger::LedgerGateway;
use crate::models::{
    DateRange, PeriodKey, ReportKind, ReportRequest, ReportResult, TransactionQuery,
    TransactionSummary,
};
use crate::workflow::{ReportGenerator, WorkflowRequest};
use crate::Result;
use chrono::NaiveDate;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

/// Minimum trimmed length for a workflow answer to count as a report.
const MIN_REPORT_LEN: usize = 20;

/// An answer containing these markers is the workflow echoing its own API
/// instructions instead of writing a report.
const INSTRUCTION_MARKERS: &[&str] = &["api_endpoint", "query_parameters"];

const REPORT_KEYWORDS: &[&str] = &[
    "收入", "支出", "余额", "交易", "财务", "报告", "分析", "总计",
    "income", "expense", "balance", "report",
];

pub struct ReportService {
    ledger: Arc<dyn LedgerGateway>,
    generator: Arc<dyn ReportGenerator>,
}

impl ReportService {
    pub fn new(ledger: Arc<dyn LedgerGateway>, generator: Arc<dyn ReportGenerator>) -> Self {
        Self { ledger, generator }
    }

    /// Produce a report for the period containing `date`.
    pub async fn generate(
        &self,
        profile: &UserProfile,
        kind: ReportKind,
        date: NaiveDate,
    ) -> Result<ReportResult> {
        let workflow_config = profile
            .workflow
            .as_ref()
            .filter(|w| w.enabled)
            .ok_or_else(|| {
                DispatchError::Config(format!(
                    "workflow not configured for user '{}'",
                    profile.user_id
                ))
            })?;

        let request = ReportRequest {
            user_id: profile.user_id.clone(),
            kind,
            period: PeriodKey::for_kind(kind, date),
            range: DateRange::for_period(kind, date),
            prompt: profile.schedule.prompt_for(kind),
        };

        info!(
            user_id = %request.user_id,
            kind = %kind,
            period = %request.period,
            start = %request.range.start,
            end = %request.range.end,
            "Generating report"
        );

        let summary = self
            .ledger
            .fetch_summary(&profile.ledger, request.range, &TransactionQuery::default())
            .await?;

        let workflow_request = WorkflowRequest {
            kind,
            report_query: request.prompt.clone(),
            transaction_data: format_summary(&summary),
            user: request.user_id.clone(),
        };

        let content = self
            .generator
            .generate(workflow_config, &workflow_request)
            .await?;

        if !is_plausible_report(&content) {
            warn!(
                user_id = %request.user_id,
                kind = %kind,
                "Workflow answer does not look like a financial report"
            );
            return Err(DispatchError::Workflow(
                "workflow answer does not look like a financial report".to_string(),
            ));
        }

        Ok(ReportResult {
            kind,
            period: request.period,
            period_label: request.range.label(),
            content,
            generated_at: chrono::Utc::now(),
        })
    }
}

/// Render the fetched window as prompt-ready text sections.
pub fn format_summary(summary: &TransactionSummary) -> String {
    let mut out = String::new();

    out.push_str("=== 统计摘要 ===\n");
    let _ = writeln!(out, "统计期间: {}", summary.period);
    let _ = writeln!(out, "交易总数: {}", summary.transaction_count);
    let _ = writeln!(out, "总收入: {:.2}", summary.total_income);
    let _ = writeln!(out, "总支出: {:.2}", summary.total_expense);
    let _ = writeln!(out, "净额: {:.2}", summary.net_amount);

    if !summary.categories.is_empty() {
        out.push_str("\n=== 分类统计 ===\n");
        for (category, amount) in &summary.categories {
            let _ = writeln!(out, "{}: {:.2}", category, amount);
        }
    }

    if !summary.recent.is_empty() {
        let _ = write!(out, "\n=== 交易明细 (最近{}条) ===\n", summary.recent.len());
        for tx in &summary.recent {
            let _ = writeln!(
                out,
                "{}: {} - {:.2} ({})",
                tx.date,
                tx.description,
                tx.amount,
                tx.category.as_deref().unwrap_or("未分类")
            );
        }
    }

    out.trim_end().to_string()
}

fn is_plausible_report(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.chars().count() < MIN_REPORT_LEN {
        return false;
    }
    if INSTRUCTION_MARKERS.iter().any(|m| trimmed.contains(m)) {
        return false;
    }
    let lowered = trimmed.to_lowercase();
    REPORT_KEYWORDS.iter().any(|kw| lowered.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        LedgerCredentials, NotificationConfig, ReportScheduleSet, WorkflowConfig,
    };
    use crate::models::{Transaction, TransactionKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockLedger {
        fail: bool,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl LedgerGateway for MockLedger {
        async fn fetch_transactions(
            &self,
            _credentials: &LedgerCredentials,
            _range: DateRange,
            query: &TransactionQuery,
        ) -> crate::Result<Vec<Transaction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DispatchError::DataFetch("ledger down".into()));
            }
            let rows = vec![
                Transaction {
                    date: NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
                    description: "午餐".to_string(),
                    amount: 30.0,
                    kind: TransactionKind::Withdrawal,
                    category: Some("餐饮".to_string()),
                    budget: None,
                    tags: vec![],
                },
                Transaction {
                    date: NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
                    description: "工资".to_string(),
                    amount: 500.0,
                    kind: TransactionKind::Deposit,
                    category: None,
                    budget: None,
                    tags: vec![],
                },
            ];
            Ok(rows.into_iter().filter(|tx| query.matches(tx)).collect())
        }

        async fn add_transaction(
            &self,
            _credentials: &LedgerCredentials,
            _request: &crate::models::TransactionRequest,
        ) -> crate::Result<serde_json::Value> {
            unimplemented!("not used by report tests")
        }

        async fn budget_overview(
            &self,
            _credentials: &LedgerCredentials,
            _range: DateRange,
        ) -> crate::Result<Vec<crate::models::BudgetStatus>> {
            Ok(vec![])
        }
    }

    struct MockGenerator {
        answer: std::result::Result<&'static str, &'static str>,
    }

    #[async_trait::async_trait]
    impl ReportGenerator for MockGenerator {
        async fn generate(
            &self,
            _config: &WorkflowConfig,
            request: &WorkflowRequest,
        ) -> crate::Result<String> {
            // The summary sections must reach the workflow
            assert!(request.transaction_data.contains("统计摘要"));
            match self.answer {
                Ok(answer) => Ok(answer.to_string()),
                Err(e) => Err(DispatchError::Workflow(e.to_string())),
            }
        }
    }

    fn profile() -> UserProfile {
        UserProfile {
            user_id: "dad".to_string(),
            ledger: LedgerCredentials {
                api_url: None,
                access_token: "token".to_string(),
            },
            workflow: Some(WorkflowConfig {
                api_key: "wf-key".to_string(),
                workflow_id: None,
                enabled: true,
            }),
            notification: NotificationConfig {
                webhook_url: "https://example.com/hook".to_string(),
                webhook_secret: "s".to_string(),
                webhook_secret_update: None,
                enabled: true,
            },
            api_token: None,
            schedule: ReportScheduleSet::default(),
            locale: "zh".to_string(),
        }
    }

    fn service(ledger_fail: bool, answer: std::result::Result<&'static str, &'static str>) -> ReportService {
        ReportService::new(
            Arc::new(MockLedger {
                fail: ledger_fail,
                calls: AtomicU32::new(0),
            }),
            Arc::new(MockGenerator { answer }),
        )
    }

    const GOOD_ANSWER: &str = "今日财务报告：总收入 500 元，总支出 30 元，净额 470 元。";

    #[tokio::test]
    async fn test_generate_success() {
        let service = service(false, Ok(GOOD_ANSWER));
        let date = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();

        let result = service
            .generate(&profile(), ReportKind::Daily, date)
            .await
            .unwrap();

        assert_eq!(result.kind, ReportKind::Daily);
        assert_eq!(result.period, PeriodKey::Day(date));
        assert_eq!(result.period_label, "2025-06-15 ~ 2025-06-15");
        assert_eq!(result.content, GOOD_ANSWER);
    }

    #[tokio::test]
    async fn test_ledger_failure_propagates_as_data_fetch() {
        let service = service(true, Ok(GOOD_ANSWER));
        let err = service
            .generate(
                &profile(),
                ReportKind::Daily,
                NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DataFetch(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_workflow_failure_propagates() {
        let service = service(false, Err("upstream 500"));
        let err = service
            .generate(
                &profile(),
                ReportKind::Weekly,
                NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Workflow(_)));
    }

    #[tokio::test]
    async fn test_degenerate_answer_rejected() {
        // Echoed API instructions are not a report
        let service = service(
            false,
            Ok(r#"{"api_endpoint": "/transactions", "query_parameters": {}} 财务数据查询"#),
        );
        let err = service
            .generate(
                &profile(),
                ReportKind::Daily,
                NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Workflow(_)));
    }

    #[tokio::test]
    async fn test_missing_workflow_config_is_config_error() {
        let service = service(false, Ok(GOOD_ANSWER));
        let mut profile = profile();
        profile.workflow = None;

        let err = service
            .generate(
                &profile,
                ReportKind::Daily,
                NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_summary_formatting_sections() {
        let summary = TransactionSummary::from_transactions(
            "2025-06-15 ~ 2025-06-15".to_string(),
            vec![
                Transaction {
                    date: NaiveDate::from_ymd_opt(2025, 6, 15).unwrap(),
                    description: "午餐".to_string(),
                    amount: 30.0,
                    kind: TransactionKind::Withdrawal,
                    category: Some("餐饮".to_string()),
                    budget: None,
                    tags: vec![],
                },
            ],
        );

        let text = format_summary(&summary);
        assert!(text.contains("=== 统计摘要 ==="));
        assert!(text.contains("交易总数: 1"));
        assert!(text.contains("总支出: 30.00"));
        assert!(text.contains("=== 分类统计 ==="));
        assert!(text.contains("餐饮: 30.00"));
        assert!(text.contains("=== 交易明细 (最近1条) ==="));
        assert!(text.contains("午餐 - 30.00 (餐饮)"));
    }

    #[test]
    fn test_plausibility_check() {
        assert!(is_plausible_report(GOOD_ANSWER));
        assert!(is_plausible_report(
            "Monthly report: total income 1200, total expense 800."
        ));
        assert!(!is_plausible_report("好的"));
        assert!(!is_plausible_report(""));
        assert!(!is_plausible_report(
            "這是一段足夠長但與主題完全無關的純聊天回覆內容哦哦哦"
        ));
    }
}
