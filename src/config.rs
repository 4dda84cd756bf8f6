//! User configuration store and process settings
//!
//! Each user owns one JSON file under the config directory
//! (`<users_dir>/<user_id>.json`). Files are parsed into strongly-typed
//! structs and validated at load time; a profile that fails validation is
//! rejected as a whole rather than surfacing partially-valid objects at
//! runtime.

use crate::error::DispatchError;
use crate::models::ReportKind;
use crate::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

//
// ================= Clock Time =================
//

/// A validated `HH:MM` 24-hour wall-clock value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u32,
    pub minute: u32,
}

impl ClockTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(ClockTime { hour, minute })
        } else {
            None
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (h, m) = value.split_once(':')?;
        ClockTime::new(h.parse().ok()?, m.parse().ok()?)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ClockTime::parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid time '{}', expected HH:MM", raw))
        })
    }
}

fn default_report_time() -> ClockTime {
    ClockTime { hour: 9, minute: 0 }
}

fn default_one() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_locale() -> String {
    "zh".to_string()
}

//
// ================= Report Schedules =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_report_time")]
    pub time: ClockTime,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeeklySchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_report_time")]
    pub time: ClockTime,
    /// 1 = Monday .. 7 = Sunday
    #[serde(default = "default_one")]
    pub weekday: u32,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlySchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_report_time")]
    pub time: ClockTime,
    /// 1..=31; days past the month's end fire on its last day
    #[serde(default = "default_one")]
    pub day: u32,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YearlySchedule {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_report_time")]
    pub time: ClockTime,
    #[serde(default = "default_one")]
    pub month: u32,
    #[serde(default = "default_one")]
    pub day: u32,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl Default for DailySchedule {
    fn default() -> Self {
        DailySchedule {
            enabled: false,
            time: default_report_time(),
            prompt: None,
        }
    }
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        WeeklySchedule {
            enabled: false,
            time: default_report_time(),
            weekday: 1,
            prompt: None,
        }
    }
}

impl Default for MonthlySchedule {
    fn default() -> Self {
        MonthlySchedule {
            enabled: false,
            time: default_report_time(),
            day: 1,
            prompt: None,
        }
    }
}

impl Default for YearlySchedule {
    fn default() -> Self {
        YearlySchedule {
            enabled: false,
            time: default_report_time(),
            month: 1,
            day: 1,
            prompt: None,
        }
    }
}

/// Kind-specific anchor a trigger must match in addition to its
/// time-of-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    None,
    Weekday(u32),
    MonthDay(u32),
    YearDate { month: u32, day: u32 },
}

/// Uniform view of one schedule record, regardless of kind.
#[derive(Debug, Clone, Copy)]
pub struct TriggerSpec {
    pub enabled: bool,
    pub time: ClockTime,
    pub anchor: Anchor,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportScheduleSet {
    #[serde(default)]
    pub daily: DailySchedule,
    #[serde(default)]
    pub weekly: WeeklySchedule,
    #[serde(default)]
    pub monthly: MonthlySchedule,
    #[serde(default)]
    pub yearly: YearlySchedule,
}

impl ReportScheduleSet {
    pub fn trigger_spec(&self, kind: ReportKind) -> TriggerSpec {
        match kind {
            ReportKind::Daily => TriggerSpec {
                enabled: self.daily.enabled,
                time: self.daily.time,
                anchor: Anchor::None,
            },
            ReportKind::Weekly => TriggerSpec {
                enabled: self.weekly.enabled,
                time: self.weekly.time,
                anchor: Anchor::Weekday(self.weekly.weekday),
            },
            ReportKind::Monthly => TriggerSpec {
                enabled: self.monthly.enabled,
                time: self.monthly.time,
                anchor: Anchor::MonthDay(self.monthly.day),
            },
            ReportKind::Yearly => TriggerSpec {
                enabled: self.yearly.enabled,
                time: self.yearly.time,
                anchor: Anchor::YearDate {
                    month: self.yearly.month,
                    day: self.yearly.day,
                },
            },
        }
    }

    /// Configured prompt template for a kind, falling back to the stock
    /// request phrasing.
    pub fn prompt_for(&self, kind: ReportKind) -> String {
        let configured = match kind {
            ReportKind::Daily => &self.daily.prompt,
            ReportKind::Weekly => &self.weekly.prompt,
            ReportKind::Monthly => &self.monthly.prompt,
            ReportKind::Yearly => &self.yearly.prompt,
        };
        configured.clone().unwrap_or_else(|| {
            match kind {
                ReportKind::Daily => "请生成今日财务报告",
                ReportKind::Weekly => "请生成本周财务报告",
                ReportKind::Monthly => "请生成本月财务报告",
                ReportKind::Yearly => "请生成本年度财务报告",
            }
            .to_string()
        })
    }

    fn validate(&self) -> Result<()> {
        if !(1..=7).contains(&self.weekly.weekday) {
            return Err(DispatchError::Config(format!(
                "weekly.weekday {} out of range 1..=7",
                self.weekly.weekday
            )));
        }
        if !(1..=31).contains(&self.monthly.day) {
            return Err(DispatchError::Config(format!(
                "monthly.day {} out of range 1..=31",
                self.monthly.day
            )));
        }
        if !(1..=12).contains(&self.yearly.month) {
            return Err(DispatchError::Config(format!(
                "yearly.month {} out of range 1..=12",
                self.yearly.month
            )));
        }
        if !(1..=31).contains(&self.yearly.day) {
            return Err(DispatchError::Config(format!(
                "yearly.day {} out of range 1..=31",
                self.yearly.day
            )));
        }
        Ok(())
    }
}

//
// ================= User Profile =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCredentials {
    /// Per-user override of the global ledger base URL
    #[serde(default)]
    pub api_url: Option<String>,
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub api_key: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: String,
    pub webhook_secret: String,
    /// Secondary secret accepted during rotation
    #[serde(default)]
    pub webhook_secret_update: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(skip)]
    pub user_id: String,
    pub ledger: LedgerCredentials,
    #[serde(default)]
    pub workflow: Option<WorkflowConfig>,
    pub notification: NotificationConfig,
    /// Bearer token for the ingestion endpoint; absent means that
    /// endpoint is closed for this user.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub schedule: ReportScheduleSet,
    #[serde(default = "default_locale")]
    pub locale: String,
}

impl UserProfile {
    /// Whether scheduled reports can run at all for this user.
    pub fn reports_enabled(&self) -> bool {
        self.notification.enabled
            && self
                .workflow
                .as_ref()
                .map(|w| w.enabled)
                .unwrap_or(false)
    }

    fn validate(&mut self) -> Result<()> {
        // Tokens are sometimes pasted with the scheme prefix included
        self.ledger.access_token = self
            .ledger
            .access_token
            .trim_start_matches("Bearer ")
            .trim()
            .to_string();
        if self.ledger.access_token.is_empty() {
            return Err(DispatchError::Config(
                "ledger.access_token must not be empty".to_string(),
            ));
        }
        if self.notification.webhook_url.trim().is_empty() {
            return Err(DispatchError::Config(
                "notification.webhook_url must not be empty".to_string(),
            ));
        }
        if let Some(workflow) = &self.workflow {
            if workflow.enabled && workflow.api_key.trim().is_empty() {
                return Err(DispatchError::Config(
                    "workflow.api_key must not be empty when enabled".to_string(),
                ));
            }
        }
        self.schedule.validate()
    }
}

//
// ================= Config Store =================
//

/// Directory-backed store of user profiles. Profiles are loaded fresh on
/// each access so the scheduler sees edits without a restart; each load
/// is an immutable snapshot for the duration of one tick.
pub struct UserConfigStore {
    dir: PathBuf,
}

impl UserConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All user ids with a config file present, sorted for stable logs.
    pub fn list_users(&self) -> Result<Vec<String>> {
        let mut users = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    users.push(stem.to_string());
                }
            }
        }
        users.sort();
        Ok(users)
    }

    pub fn load(&self, user_id: &str) -> Result<UserProfile> {
        let path = self.dir.join(format!("{}.json", user_id));
        if !path.is_file() {
            return Err(DispatchError::Config(format!(
                "unknown user '{}'",
                user_id
            )));
        }

        let raw = std::fs::read_to_string(&path)?;
        let mut profile: UserProfile = serde_json::from_str(&raw).map_err(|e| {
            DispatchError::Config(format!("invalid profile for '{}': {}", user_id, e))
        })?;
        profile.user_id = user_id.to_string();
        profile.validate()?;
        Ok(profile)
    }
}

//
// ================= Process Settings =================
//

/// Process-level settings sourced from the environment (`.env` honored).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub users_dir: PathBuf,
    pub ledger_api_url: String,
    pub workflow_api_url: String,
    pub tick_interval: Duration,
    pub grace_window: Duration,
    pub dispatch_timeout: Duration,
    pub max_attempts_per_period: u32,
    pub max_concurrent_dispatches: usize,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| DispatchError::Config(format!("invalid {}: '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let tick_secs: u64 = env_parse("TICK_INTERVAL_SECS", 60)?;
        Ok(AppConfig {
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 9012)?,
            users_dir: PathBuf::from(env_or("USERS_DIR", "data/users")),
            ledger_api_url: env_or("LEDGER_API_URL", "http://localhost:8080/api/v1"),
            workflow_api_url: env_or("WORKFLOW_API_URL", "https://api.dify.ai/v1"),
            tick_interval: Duration::from_secs(tick_secs),
            // The late-fire window defaults to one tick so a trigger
            // minute missed by jitter still fires exactly once
            grace_window: Duration::from_secs(env_parse("GRACE_WINDOW_SECS", tick_secs)?),
            dispatch_timeout: Duration::from_secs(env_parse("DISPATCH_TIMEOUT_SECS", 120)?),
            max_attempts_per_period: env_parse("MAX_ATTEMPTS_PER_PERIOD", 3)?,
            max_concurrent_dispatches: env_parse("MAX_CONCURRENT_DISPATCHES", 4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_profile(dir: &Path, user_id: &str, body: &str) {
        std::fs::write(dir.join(format!("{}.json", user_id)), body).unwrap();
    }

    const MINIMAL: &str = r#"{
        "ledger": { "access_token": "Bearer abc123" },
        "notification": {
            "webhook_url": "https://example.com/hook",
            "webhook_secret": "s3cret"
        }
    }"#;

    #[test]
    fn test_clock_time_parsing() {
        assert_eq!(ClockTime::parse("23:00"), ClockTime::new(23, 0));
        assert_eq!(ClockTime::parse("09:05"), ClockTime::new(9, 5));
        assert_eq!(ClockTime::parse("24:00"), None);
        assert_eq!(ClockTime::parse("12:60"), None);
        assert_eq!(ClockTime::parse("noon"), None);
        assert_eq!(ClockTime::parse("12"), None);
    }

    #[test]
    fn test_load_strips_bearer_prefix_and_injects_id() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), "dad", MINIMAL);

        let store = UserConfigStore::new(dir.path());
        let profile = store.load("dad").unwrap();
        assert_eq!(profile.user_id, "dad");
        assert_eq!(profile.ledger.access_token, "abc123");
        assert_eq!(profile.locale, "zh");
        assert!(!profile.schedule.daily.enabled);
    }

    #[test]
    fn test_unknown_user_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = UserConfigStore::new(dir.path());
        let err = store.load("nobody").unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn test_invalid_schedule_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(
            dir.path(),
            "dad",
            r#"{
                "ledger": { "access_token": "t" },
                "notification": { "webhook_url": "https://x", "webhook_secret": "s" },
                "schedule": { "weekly": { "enabled": true, "weekday": 8 } }
            }"#,
        );

        let store = UserConfigStore::new(dir.path());
        assert!(matches!(
            store.load("dad").unwrap_err(),
            DispatchError::Config(_)
        ));
    }

    #[test]
    fn test_invalid_time_rejected_at_parse() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(
            dir.path(),
            "dad",
            r#"{
                "ledger": { "access_token": "t" },
                "notification": { "webhook_url": "https://x", "webhook_secret": "s" },
                "schedule": { "daily": { "enabled": true, "time": "25:00" } }
            }"#,
        );

        let store = UserConfigStore::new(dir.path());
        assert!(store.load("dad").is_err());
    }

    #[test]
    fn test_list_users_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), "mom", MINIMAL);
        write_profile(dir.path(), "dad", MINIMAL);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = UserConfigStore::new(dir.path());
        assert_eq!(store.list_users().unwrap(), vec!["dad", "mom"]);
    }

    #[test]
    fn test_schedule_prompts_and_specs() {
        let schedule: ReportScheduleSet = serde_json::from_str(
            r#"{
                "daily": { "enabled": true, "time": "23:00", "prompt": "自定义日报" },
                "weekly": { "enabled": true, "time": "21:30", "weekday": 5 }
            }"#,
        )
        .unwrap();

        assert_eq!(schedule.prompt_for(ReportKind::Daily), "自定义日报");
        assert_eq!(schedule.prompt_for(ReportKind::Weekly), "请生成本周财务报告");

        let spec = schedule.trigger_spec(ReportKind::Weekly);
        assert!(spec.enabled);
        assert_eq!(spec.time, ClockTime::new(21, 30).unwrap());
        assert_eq!(spec.anchor, Anchor::Weekday(5));

        let spec = schedule.trigger_spec(ReportKind::Monthly);
        assert!(!spec.enabled);
    }

    #[test]
    fn test_reports_enabled_requires_workflow_and_notification() {
        let dir = tempfile::tempdir().unwrap();
        write_profile(dir.path(), "dad", MINIMAL);
        let store = UserConfigStore::new(dir.path());
        // No workflow config at all
        assert!(!store.load("dad").unwrap().reports_enabled());

        write_profile(
            dir.path(),
            "mom",
            r#"{
                "ledger": { "access_token": "t" },
                "workflow": { "api_key": "wf-key" },
                "notification": { "webhook_url": "https://x", "webhook_secret": "s" }
            }"#,
        );
        assert!(store.load("mom").unwrap().reports_enabled());
    }
}
