//! Per-(user, kind) trigger dedup state
//!
//! The only mutable structure shared between concurrent fire attempts.
//! Every read-check-then-write runs as one compare-and-set under the slot
//! lock, so two overlapping ticks can never both claim the same
//! (user, kind, period). State lives for the process lifetime only: a
//! restart inside a trigger's grace window can re-fire once at a period
//! boundary.

use crate::models::{PeriodKey, ReportKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerKey {
    pub user_id: String,
    pub kind: ReportKind,
}

impl TriggerKey {
    pub fn new(user_id: impl Into<String>, kind: ReportKind) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
        }
    }
}

#[derive(Debug, Default)]
struct TriggerSlot {
    /// Period of the last successful fire
    fired_period: Option<PeriodKey>,
    /// Period the attempt counter refers to
    attempt_period: Option<PeriodKey>,
    attempts: u32,
    in_flight: bool,
}

/// Outcome of the atomic claim for one fire attempt.
pub enum AttemptDecision {
    /// The slot is claimed; the guard must be resolved
    Proceed(AttemptGuard),
    /// This period already fired successfully
    AlreadyFired,
    /// A previous attempt for this pair is still outstanding
    InFlight,
    /// The per-period retry budget is spent
    AttemptsExhausted,
}

pub struct TriggerStateTable {
    slots: Mutex<HashMap<TriggerKey, TriggerSlot>>,
}

impl TriggerStateTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Claim the (user, kind) slot for a fire attempt in `period`.
    ///
    /// On `Proceed` the slot is marked in-flight and the attempt counter
    /// is already incremented; the returned guard releases the slot on
    /// drop and records the fired period only through
    /// [`AttemptGuard::succeed`].
    pub fn begin_attempt(
        self: &Arc<Self>,
        key: TriggerKey,
        period: PeriodKey,
        max_attempts: u32,
    ) -> AttemptDecision {
        let mut slots = self.slots.lock().expect("trigger table poisoned");
        let slot = slots.entry(key.clone()).or_default();

        if slot.fired_period == Some(period) {
            return AttemptDecision::AlreadyFired;
        }
        if slot.in_flight {
            return AttemptDecision::InFlight;
        }
        if slot.attempt_period != Some(period) {
            slot.attempt_period = Some(period);
            slot.attempts = 0;
        }
        if slot.attempts >= max_attempts {
            return AttemptDecision::AttemptsExhausted;
        }

        slot.attempts += 1;
        slot.in_flight = true;
        let attempt = slot.attempts;
        drop(slots);

        AttemptDecision::Proceed(AttemptGuard {
            table: Arc::clone(self),
            key,
            period,
            attempt,
            resolved: false,
        })
    }

    pub fn fired_period(&self, key: &TriggerKey) -> Option<PeriodKey> {
        let slots = self.slots.lock().expect("trigger table poisoned");
        slots.get(key).and_then(|slot| slot.fired_period)
    }

    pub fn attempts_for(&self, key: &TriggerKey, period: PeriodKey) -> u32 {
        let slots = self.slots.lock().expect("trigger table poisoned");
        slots
            .get(key)
            .filter(|slot| slot.attempt_period == Some(period))
            .map(|slot| slot.attempts)
            .unwrap_or(0)
    }

    fn record_success(&self, key: &TriggerKey, period: PeriodKey) {
        let mut slots = self.slots.lock().expect("trigger table poisoned");
        if let Some(slot) = slots.get_mut(key) {
            slot.fired_period = Some(period);
            slot.in_flight = false;
        }
    }

    fn release(&self, key: &TriggerKey) {
        let mut slots = self.slots.lock().expect("trigger table poisoned");
        if let Some(slot) = slots.get_mut(key) {
            slot.in_flight = false;
        }
    }
}

/// RAII claim on one (user, kind) slot. Dropping without `succeed` counts
/// as a failed attempt: the slot frees up for a later tick but the period
/// stays unfired.
pub struct AttemptGuard {
    table: Arc<TriggerStateTable>,
    key: TriggerKey,
    period: PeriodKey,
    attempt: u32,
    resolved: bool,
}

impl AttemptGuard {
    /// Which attempt within the period this claim is (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a confirmed delivery: the period is marked fired and no
    /// further attempts run until the next period.
    pub fn succeed(mut self) {
        self.resolved = true;
        self.table.record_success(&self.key, self.period);
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.resolved {
            self.table.release(&self.key);
        }
    }
}
