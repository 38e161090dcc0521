/// Event admission gate: loop and duplicate suppression
///
/// Push providers redeliver, and the same logical notification can arrive over
/// push and socket within moments of each other. The gate bounds how often one
/// event id can take effect and how close together any two admissions can be.
///
/// The global lock is a deadline on the monotonic clock, checked on every call.
/// A spawned timer clears it as well, but nothing depends on that timer firing.
use crate::config::AdmissionConfig;
use crate::event::NotificationEvent;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Why an event was accepted or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    /// First sighting of this id
    First,
    /// Seen before, still under the processing limit
    Repeat,
    /// Seen before, but the previous window expired
    WindowReset,
    /// Global lock held by a recent admission
    Locked,
    /// Too soon after the previous admission
    Throttled,
    /// Processing limit reached inside the window
    Duplicate,
    /// Could not be parsed into an event
    Invalid,
    /// Internal fault; degraded to reject
    Fault,
}

/// Outcome of an admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub accepted: bool,
    pub reason: AdmissionReason,
}

impl Admission {
    fn accepted(reason: AdmissionReason) -> Self {
        Self {
            accepted: true,
            reason,
        }
    }

    pub fn rejected(reason: AdmissionReason) -> Self {
        Self {
            accepted: false,
            reason,
        }
    }

    pub fn invalid() -> Self {
        Self::rejected(AdmissionReason::Invalid)
    }
}

/// Bookkeeping for one distinct event id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRecord {
    pub first_seen_at: Instant,
    pub times_processed: u32,
    pub window_expires_at: Instant,
}

#[derive(Default)]
struct GateState {
    records: HashMap<String, AdmissionRecord>,
    locked_until: Option<Instant>,
    last_admitted_at: Option<Instant>,
    calls: u64,
    // Bumped on every lock acquisition so a stale release timer is a no-op
    lock_epoch: u64,
}

impl GateState {
    fn prune(&mut self, now: Instant) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.window_expires_at > now);
        before - self.records.len()
    }
}

/// Admission gate shared by all inbound sources
#[derive(Clone)]
pub struct AdmissionGate {
    config: AdmissionConfig,
    state: Arc<Mutex<GateState>>,
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(GateState::default())),
        }
    }

    /// Decide whether `event` may take effect. Never panics; faults reject.
    pub fn admit(&self, event: &NotificationEvent) -> Admission {
        let now = Instant::now();
        let mut state = match self.lock_state() {
            Some(state) => state,
            None => return Admission::rejected(AdmissionReason::Fault),
        };

        state.calls += 1;
        if self.config.prune_every > 0 && state.calls % self.config.prune_every == 0 {
            let removed = state.prune(now);
            if removed > 0 {
                debug!("Pruned {} expired admission records", removed);
            }
        }

        match state.locked_until {
            Some(until) if until > now => {
                debug!("Event {} rejected: processing lock held", event.id);
                return Admission::rejected(AdmissionReason::Locked);
            }
            Some(_) => state.locked_until = None,
            None => {}
        }

        if let Some(last) = state.last_admitted_at {
            if now.duration_since(last) < self.config.min_processing_interval {
                debug!("Event {} rejected: below minimum interval", event.id);
                return Admission::rejected(AdmissionReason::Throttled);
            }
        }

        let window = self.config.processing_window;
        let max = self.config.max_processing_count;
        let fresh = AdmissionRecord {
            first_seen_at: now,
            times_processed: 1,
            window_expires_at: now + window,
        };
        let (record, reason) = match state.records.get(&event.id).copied() {
            None => (fresh, AdmissionReason::First),
            Some(record) if record.window_expires_at <= now => (fresh, AdmissionReason::WindowReset),
            Some(record) if record.times_processed < max => (
                AdmissionRecord {
                    times_processed: record.times_processed + 1,
                    ..record
                },
                AdmissionReason::Repeat,
            ),
            Some(record) => {
                debug!(
                    "Event {} rejected: processed {} times in window",
                    event.id, record.times_processed
                );
                return Admission::rejected(AdmissionReason::Duplicate);
            }
        };
        state.records.insert(event.id.clone(), record);

        state.last_admitted_at = Some(now);
        state.locked_until = Some(now + self.config.lock_duration);
        state.lock_epoch += 1;
        let epoch = state.lock_epoch;
        drop(state);

        self.schedule_release(epoch);
        debug!("Event {} ({}) admitted: {:?}", event.id, event.kind, reason);
        Admission::accepted(reason)
    }

    /// Remove records whose window has expired
    pub fn prune_expired(&self) -> usize {
        match self.lock_state() {
            Some(mut state) => state.prune(Instant::now()),
            None => 0,
        }
    }

    /// Whether the global lock is currently held
    pub fn is_locked(&self) -> bool {
        let now = Instant::now();
        self.lock_state()
            .and_then(|s| s.locked_until)
            .map(|until| until > now)
            .unwrap_or(false)
    }

    pub fn record(&self, event_id: &str) -> Option<AdmissionRecord> {
        self.lock_state()
            .and_then(|s| s.records.get(event_id).copied())
    }

    pub fn len(&self) -> usize {
        self.lock_state().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything (logout)
    pub fn reset(&self) {
        if let Some(mut state) = self.lock_state() {
            let epoch = state.lock_epoch + 1;
            *state = GateState {
                lock_epoch: epoch,
                ..GateState::default()
            };
        }
    }

    fn lock_state(&self) -> Option<MutexGuard<'_, GateState>> {
        match self.state.lock() {
            Ok(state) => Some(state),
            Err(poisoned) => {
                warn!("Admission state poisoned; releasing lock and rejecting");
                let mut state = poisoned.into_inner();
                state.locked_until = None;
                drop(state);
                self.state.clear_poison();
                None
            }
        }
    }

    fn schedule_release(&self, epoch: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let state = Arc::downgrade(&self.state);
        let hold = self.config.lock_duration;
        handle.spawn(async move {
            tokio::time::sleep(hold).await;
            if let Some(state) = state.upgrade() {
                if let Ok(mut state) = state.lock() {
                    if state.lock_epoch == epoch {
                        state.locked_until = None;
                    }
                }
            }
        });
    }
}
