//! Core data models for the report dispatcher

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

//
// ================= Report Kinds =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl ReportKind {
    pub const ALL: [ReportKind; 4] = [
        ReportKind::Daily,
        ReportKind::Weekly,
        ReportKind::Monthly,
        ReportKind::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Daily => "daily",
            ReportKind::Weekly => "weekly",
            ReportKind::Monthly => "monthly",
            ReportKind::Yearly => "yearly",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Recurrence Periods =================
//

/// The calendar bucket for which at most one successful report fire is
/// permitted. Weekly buckets follow the ISO week (Monday-based), matching
/// how the dedup window groups dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PeriodKey {
    Day(NaiveDate),
    Week { year: i32, week: u32 },
    Month { year: i32, month: u32 },
    Year(i32),
}

impl PeriodKey {
    pub fn for_kind(kind: ReportKind, date: NaiveDate) -> Self {
        match kind {
            ReportKind::Daily => PeriodKey::Day(date),
            ReportKind::Weekly => {
                let iso = date.iso_week();
                PeriodKey::Week {
                    year: iso.year(),
                    week: iso.week(),
                }
            }
            ReportKind::Monthly => PeriodKey::Month {
                year: date.year(),
                month: date.month(),
            },
            ReportKind::Yearly => PeriodKey::Year(date.year()),
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodKey::Day(d) => write!(f, "{}", d),
            PeriodKey::Week { year, week } => write!(f, "{}-W{:02}", year, week),
            PeriodKey::Month { year, month } => write!(f, "{}-{:02}", year, month),
            PeriodKey::Year(y) => write!(f, "{}", y),
        }
    }
}

//
// ================= Date Ranges =================
//

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let next = NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid month start");
    (next - first).num_days() as u32
}

/// Clamp a configured day-of-month anchor to the month's actual length,
/// so a day-31 schedule fires on the last day of shorter months.
pub fn clamp_day(year: i32, month: u32, day: u32) -> u32 {
    day.min(days_in_month(year, month))
}

/// Half-open calendar window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// The full calendar bucket a report covers: the day itself, the
    /// Monday-to-Sunday week, the calendar month, or the calendar year
    /// containing `date`.
    pub fn for_period(kind: ReportKind, date: NaiveDate) -> Self {
        match kind {
            ReportKind::Daily => DateRange {
                start: date,
                end: date + Duration::days(1),
            },
            ReportKind::Weekly => {
                let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                DateRange {
                    start: monday,
                    end: monday + Duration::days(7),
                }
            }
            ReportKind::Monthly => {
                let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                    .expect("valid month start");
                let end = if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
                }
                .expect("valid month start");
                DateRange { start, end }
            }
            ReportKind::Yearly => DateRange {
                start: NaiveDate::from_ymd_opt(date.year(), 1, 1).expect("valid year start"),
                end: NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).expect("valid year start"),
            },
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date < self.end
    }

    /// Inclusive human-readable label, e.g. `2025-06-01 ~ 2025-06-30`.
    pub fn label(&self) -> String {
        format!("{} ~ {}", self.start, self.end - Duration::days(1))
    }
}

//
// ================= Ledger Transactions =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Withdrawal,
    Deposit,
    Transfer,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Deposit => "deposit",
            TransactionKind::Transfer => "transfer",
        }
    }
}

/// One transaction split as the report pipeline sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub kind: TransactionKind,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Filter applied to a ledger transaction query.
///
/// Transfers move money between the user's own accounts; including them by
/// default would double-count internal movements in a report, so they are
/// opt-in via an explicit `kinds` list.
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    pub kinds: Option<Vec<TransactionKind>>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

impl TransactionQuery {
    pub fn effective_kinds(&self) -> Vec<TransactionKind> {
        self.kinds
            .clone()
            .unwrap_or_else(|| vec![TransactionKind::Withdrawal, TransactionKind::Deposit])
    }

    /// Whether a transaction passes this filter: kind in the effective
    /// set, category equal when given, and ALL listed tags present.
    pub fn matches(&self, tx: &Transaction) -> bool {
        if !self.effective_kinds().contains(&tx.kind) {
            return false;
        }
        if let Some(category) = &self.category {
            if tx.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        self.tags.iter().all(|tag| tx.tags.contains(tag))
    }
}

/// Aggregated window of ledger data that feeds the report prompt.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSummary {
    pub period: String,
    pub transaction_count: usize,
    pub total_income: f64,
    pub total_expense: f64,
    pub net_amount: f64,
    pub categories: BTreeMap<String, f64>,
    /// Most recent splits, newest first, capped by the caller.
    pub recent: Vec<Transaction>,
}

impl TransactionSummary {
    pub const RECENT_LIMIT: usize = 10;

    pub fn from_transactions(period: String, mut transactions: Vec<Transaction>) -> Self {
        let mut total_income = 0.0;
        let mut total_expense = 0.0;
        let mut categories: BTreeMap<String, f64> = BTreeMap::new();

        for tx in &transactions {
            match tx.kind {
                TransactionKind::Deposit => total_income += tx.amount,
                TransactionKind::Withdrawal => {
                    total_expense += tx.amount;
                    if let Some(category) = &tx.category {
                        *categories.entry(category.clone()).or_insert(0.0) += tx.amount;
                    }
                }
                TransactionKind::Transfer => {}
            }
        }

        let transaction_count = transactions.len();
        transactions.sort_by(|a, b| b.date.cmp(&a.date));
        transactions.truncate(Self::RECENT_LIMIT);

        TransactionSummary {
            period,
            transaction_count,
            total_income,
            total_expense,
            net_amount: total_income - total_expense,
            categories,
            recent: transactions,
        }
    }
}

/// Monthly budget standing reported alongside transaction notifications.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub name: String,
    pub total_budget: f64,
    pub total_spent: f64,
    pub remaining: f64,
}

//
// ================= Report Request / Result =================
//

/// Ephemeral unit of work created when a trigger fires, discarded after
/// dispatch.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub user_id: String,
    pub kind: ReportKind,
    pub period: PeriodKey,
    pub range: DateRange,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct ReportResult {
    pub kind: ReportKind,
    pub period: PeriodKey,
    pub period_label: String,
    pub content: String,
    pub generated_at: DateTime<Utc>,
}

//
// ================= Ingestion Request =================
//

/// Inbound transaction as accepted by the token-guarded ingestion
/// endpoint, validated before it is forwarded to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub amount: f64,
    pub description: String,
    pub date: String,
    pub source_account: Option<String>,
    #[serde(default)]
    pub destination_account: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl TransactionRequest {
    const MAX_DESCRIPTION_LEN: usize = 500;

    /// Validate and normalize in place. Dates arrive either as plain
    /// `YYYY-MM-DD` or as a full ISO timestamp (`2025-06-26T20:00:00+08:00`);
    /// both normalize to the date component.
    pub fn validate(&mut self) -> crate::Result<()> {
        if self.amount <= 0.0 {
            return Err(crate::error::DispatchError::Config(
                "amount must be greater than zero".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(crate::error::DispatchError::Config(
                "description must not be empty".to_string(),
            ));
        }
        if self.description.chars().count() > Self::MAX_DESCRIPTION_LEN {
            return Err(crate::error::DispatchError::Config(format!(
                "description exceeds {} characters",
                Self::MAX_DESCRIPTION_LEN
            )));
        }

        let normalized = if let Ok(dt) = DateTime::parse_from_rfc3339(&self.date) {
            dt.date_naive()
        } else {
            NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").map_err(|_| {
                crate::error::DispatchError::Config(format!(
                    "invalid date '{}', expected YYYY-MM-DD or ISO timestamp",
                    self.date
                ))
            })?
        };
        self.date = normalized.format("%Y-%m-%d").to_string();

        Ok(())
    }
}
