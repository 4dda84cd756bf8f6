//! Scheduled report dispatch engine
//!
//! A recurring tick walks every configured user and report kind, decides
//! which triggers are newly satisfied for the current recurrence period,
//! and dispatches at most one successful report per (user, kind, period).
//! Fire attempts for different users run concurrently under a worker
//! limit; attempts for the same pair are serialized through the trigger
//! table. One user's failure never aborts the tick for the others.

pub mod triggers;

use crate::config::{Anchor, AppConfig, TriggerSpec, UserConfigStore, UserProfile};
use crate::models::{clamp_day, PeriodKey, ReportKind};
use crate::notify::{format_report_message, Notifier};
use crate::report::ReportService;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use triggers::{AttemptDecision, AttemptGuard, TriggerKey, TriggerStateTable};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// How long past its minute a trigger still fires (late, never twice)
    pub grace_window: Duration,
    /// Wall-clock bound on one generate-and-deliver attempt
    pub dispatch_timeout: Duration,
    pub max_attempts_per_period: u32,
    pub max_concurrent_dispatches: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            grace_window: Duration::from_secs(60),
            dispatch_timeout: Duration::from_secs(120),
            max_attempts_per_period: 3,
            max_concurrent_dispatches: 4,
        }
    }
}

impl From<&AppConfig> for SchedulerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            tick_interval: config.tick_interval,
            grace_window: config.grace_window,
            dispatch_timeout: config.dispatch_timeout,
            max_attempts_per_period: config.max_attempts_per_period,
            max_concurrent_dispatches: config.max_concurrent_dispatches,
        }
    }
}

/// What one tick did. Dispatch handles resolve to `true` on a confirmed
/// delivery; the run loop drops them (tasks are detached), tests await
/// them.
pub struct TickOutcome {
    pub users_evaluated: usize,
    pub users_skipped: usize,
    pub dispatched: Vec<JoinHandle<bool>>,
}

pub struct SchedulerEngine {
    store: Arc<UserConfigStore>,
    service: Arc<ReportService>,
    notifier: Arc<dyn Notifier>,
    triggers: Arc<TriggerStateTable>,
    permits: Arc<Semaphore>,
    settings: SchedulerSettings,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<UserConfigStore>,
        service: Arc<ReportService>,
        notifier: Arc<dyn Notifier>,
        settings: SchedulerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_dispatches.max(1)));
        Self {
            store,
            service,
            notifier,
            triggers: TriggerStateTable::new(),
            permits,
            settings,
        }
    }

    /// Drive ticks forever at the configured interval.
    pub async fn run(self: Arc<Self>) {
        info!(
            tick_secs = self.settings.tick_interval.as_secs(),
            grace_secs = self.settings.grace_window.as_secs(),
            "Scheduler started"
        );

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now = chrono::Local::now().naive_local();
            let outcome = self.tick(now);
            debug!(
                users = outcome.users_evaluated,
                skipped = outcome.users_skipped,
                dispatched = outcome.dispatched.len(),
                "Tick complete"
            );
            // Dispatch tasks keep running past the tick; the trigger
            // table serializes any overlap with the next one.
        }
    }

    /// Evaluate every (user, kind) trigger against `now` and spawn a fire
    /// attempt for each one that is due and claimable.
    pub fn tick(&self, now: NaiveDateTime) -> TickOutcome {
        let mut outcome = TickOutcome {
            users_evaluated: 0,
            users_skipped: 0,
            dispatched: Vec::new(),
        };

        let users = match self.store.list_users() {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "Cannot list users, skipping tick");
                return outcome;
            }
        };

        for user_id in users {
            let profile = match self.store.load(&user_id) {
                Ok(profile) => profile,
                Err(e) => {
                    // Fatal for this user's tick only
                    warn!(user_id = %user_id, error = %e, "Skipping user with invalid config");
                    outcome.users_skipped += 1;
                    continue;
                }
            };

            if !profile.reports_enabled() {
                debug!(user_id = %user_id, "Reports not enabled, skipping");
                outcome.users_skipped += 1;
                continue;
            }

            outcome.users_evaluated += 1;
            let profile = Arc::new(profile);

            for kind in ReportKind::ALL {
                let spec = profile.schedule.trigger_spec(kind);
                if !is_due(&spec, now, self.settings.grace_window) {
                    continue;
                }

                let period = PeriodKey::for_kind(kind, now.date());
                let key = TriggerKey::new(user_id.clone(), kind);

                match self.triggers.begin_attempt(
                    key,
                    period,
                    self.settings.max_attempts_per_period,
                ) {
                    AttemptDecision::Proceed(guard) => {
                        debug!(
                            user_id = %user_id,
                            kind = %kind,
                            period = %period,
                            attempt = guard.attempt(),
                            "Trigger due, dispatching"
                        );
                        outcome.dispatched.push(self.spawn_dispatch(
                            Arc::clone(&profile),
                            kind,
                            period,
                            now.date(),
                            guard,
                        ));
                    }
                    AttemptDecision::AlreadyFired => {
                        debug!(user_id = %user_id, kind = %kind, period = %period, "Already fired");
                    }
                    AttemptDecision::InFlight => {
                        // Scheduling conflict: a previous attempt is still
                        // outstanding. Not an error.
                        debug!(user_id = %user_id, kind = %kind, period = %period, "Attempt in flight, skipping");
                    }
                    AttemptDecision::AttemptsExhausted => {
                        warn!(
                            user_id = %user_id,
                            kind = %kind,
                            period = %period,
                            max_attempts = self.settings.max_attempts_per_period,
                            "Retry budget exhausted for this period"
                        );
                    }
                }
            }
        }

        outcome
    }

    fn spawn_dispatch(
        &self,
        profile: Arc<UserProfile>,
        kind: ReportKind,
        period: PeriodKey,
        date: NaiveDate,
        guard: AttemptGuard,
    ) -> JoinHandle<bool> {
        let service = Arc::clone(&self.service);
        let notifier = Arc::clone(&self.notifier);
        let permits = Arc::clone(&self.permits);
        let timeout = self.settings.dispatch_timeout;

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return false, // semaphore closed, shutting down
            };

            let attempt = guard.attempt();
            let started = Instant::now();

            let outcome = tokio::time::timeout(timeout, async {
                let report = service.generate(&profile, kind, date).await?;
                let message = format_report_message(&report, &profile.locale);
                notifier.send(&profile.notification, &message).await
            })
            .await;

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(Ok(())) => {
                    info!(
                        user_id = %profile.user_id,
                        kind = %kind,
                        period = %period,
                        attempt,
                        elapsed_ms,
                        "Report dispatched"
                    );
                    guard.succeed();
                    true
                }
                Ok(Err(e)) => {
                    error!(
                        user_id = %profile.user_id,
                        kind = %kind,
                        period = %period,
                        attempt,
                        elapsed_ms,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Report dispatch failed"
                    );
                    false
                }
                Err(_) => {
                    error!(
                        user_id = %profile.user_id,
                        kind = %kind,
                        period = %period,
                        attempt,
                        timeout_secs = timeout.as_secs(),
                        "Report dispatch timed out"
                    );
                    false
                }
            }
            // On the failure paths the guard drops here, freeing the
            // (user, kind) slot for the next tick.
        })
    }
}

/// Whether a trigger is satisfied at `now`: anchor match plus time-of-day
/// within `[target, target + grace)`. A process that was down at the
/// exact minute still fires late inside the window; anything later waits
/// for the next period.
fn is_due(spec: &TriggerSpec, now: NaiveDateTime, grace: Duration) -> bool {
    if !spec.enabled {
        return false;
    }
    if !anchor_matches(spec.anchor, now.date()) {
        return false;
    }

    let target = now
        .date()
        .and_hms_opt(spec.time.hour, spec.time.minute, 0)
        .expect("clock time validated at load");
    if now < target {
        return false;
    }
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60));
    now - target < grace
}

fn anchor_matches(anchor: Anchor, date: NaiveDate) -> bool {
    match anchor {
        Anchor::None => true,
        Anchor::Weekday(weekday) => date.weekday().number_from_monday() == weekday,
        Anchor::MonthDay(day) => date.day() == clamp_day(date.year(), date.month(), day),
        Anchor::YearDate { month, day } => {
            date.month() == month && date.day() == clamp_day(date.year(), month, day)
        }
    }
}
