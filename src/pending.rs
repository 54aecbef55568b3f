//! At-least-once delivery for message edits.
//!
//! Each submitted edit is recorded under its message id and watched by a
//! timer task. Every `ack_timeout` the watchdog looks the record up again:
//!
//! - record gone (acknowledged or removed): the watchdog stops;
//! - older than `ttl`: the record is dropped as expired;
//! - `attempts >= max_resend_attempts`: the record is dropped as exhausted;
//! - otherwise the edit is re-published with fresh sequence numbers.
//!
//! The map is bounded. Inserting a new key at capacity evicts the oldest
//! inserted key. Drops (eviction, expiry, exhaustion) are reported through
//! [`PendingEvent`] callbacks only; the original caller is not notified.
//! An acknowledged edit simply has no record.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::{sleep, Instant};

use crate::{
    errors::{Result, ValidationError},
    realtime::{Publisher, QoS, TaskEnvelope, TASK_TOPIC},
    session::SessionContext,
    telemetry::Telemetry,
};

/// Tracker limits and timers.
#[derive(Clone, Debug)]
pub struct PendingConfig {
    /// Maximum number of live records (default 1000).
    pub capacity: usize,
    /// Delay between watchdog checks (default 12s).
    pub ack_timeout: Duration,
    /// Records older than this are dropped without resending (default 300s).
    pub ttl: Duration,
    /// Resends allowed per record (default 2).
    pub max_resend_attempts: u32,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ack_timeout: Duration::from_millis(12_000),
            ttl: Duration::from_millis(300_000),
            max_resend_attempts: 2,
        }
    }
}

/// A tracked edit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEdit {
    pub message_id: String,
    pub text: String,
    pub created_at: Instant,
    pub attempts: u32,
    generation: u64,
}

/// Lifecycle events for tracked edits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingEvent {
    Resent { message_id: String, attempt: u32 },
    Expired { message_id: String, attempts: u32 },
    Exhausted { message_id: String, attempts: u32 },
    Evicted { message_id: String },
}

enum WatchDecision {
    Stop,
    Drop(PendingEvent),
    Resend { text: String, attempt: u32 },
}

#[derive(Default)]
struct TrackerState {
    records: HashMap<String, PendingEdit>,
    order: VecDeque<String>,
    next_generation: u64,
}

impl TrackerState {
    fn remove(&mut self, message_id: &str) -> Option<PendingEdit> {
        let record = self.records.remove(message_id)?;
        self.order.retain(|k| k != message_id);
        Some(record)
    }
}

struct TrackerInner {
    config: PendingConfig,
    state: Mutex<TrackerState>,
    publisher: Arc<dyn Publisher>,
    session: Arc<SessionContext>,
    telemetry: Telemetry,
}

/// Bounded, insertion-ordered map of in-flight edits plus their watchdogs.
#[derive(Clone)]
pub struct PendingEdits {
    inner: Arc<TrackerInner>,
}

impl fmt::Debug for PendingEdits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEdits")
            .field("config", &self.inner.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl PendingEdits {
    pub fn new(
        config: PendingConfig,
        publisher: Arc<dyn Publisher>,
        session: Arc<SessionContext>,
    ) -> Self {
        Self::with_telemetry(config, publisher, session, Telemetry::default())
    }

    pub(crate) fn with_telemetry(
        mut config: PendingConfig,
        publisher: Arc<dyn Publisher>,
        session: Arc<SessionContext>,
        telemetry: Telemetry,
    ) -> Self {
        config.capacity = config.capacity.max(1);
        Self {
            inner: Arc::new(TrackerInner {
                config,
                state: Mutex::new(TrackerState::default()),
                publisher,
                session,
                telemetry,
            }),
        }
    }

    /// Record an edit, publish it, and start its watchdog.
    ///
    /// A publish failure is returned, but the record stays queued and the
    /// watchdog will resend it.
    ///
    /// # Panics
    ///
    /// Panics if polled outside a tokio runtime, like [`insert`](Self::insert).
    pub async fn submit(&self, message_id: &str, text: &str) -> Result<()> {
        if message_id.trim().is_empty() {
            return Err(ValidationError::new("is required")
                .with_field("message_id")
                .into());
        }
        self.insert(message_id, text);
        self.publish(message_id, text).await
    }

    /// Record an edit and start its watchdog without publishing.
    ///
    /// Re-inserting a live key replaces its record and restarts its clock.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, since the watchdog is
    /// spawned onto the current one.
    pub fn insert(&self, message_id: &str, text: &str) {
        let (generation, evicted) = {
            let mut state = self.state();
            state.next_generation += 1;
            let generation = state.next_generation;

            let mut evicted = None;
            if state.records.contains_key(message_id) {
                state.order.retain(|k| k != message_id);
            } else if state.records.len() >= self.inner.config.capacity {
                if let Some(oldest) = state.order.pop_front() {
                    state.records.remove(&oldest);
                    evicted = Some(oldest);
                }
            }

            state.records.insert(
                message_id.to_string(),
                PendingEdit {
                    message_id: message_id.to_string(),
                    text: text.to_string(),
                    created_at: Instant::now(),
                    attempts: 0,
                    generation,
                },
            );
            state.order.push_back(message_id.to_string());
            (generation, evicted)
        };

        if let Some(message_id) = evicted {
            self.inner.session.record_health("edit.evicted");
            self.inner
                .telemetry
                .record_pending(PendingEvent::Evicted { message_id });
        }
        self.spawn_watchdog(message_id.to_string(), generation);
    }

    /// Mark an edit as delivered. Returns whether a record existed.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        self.remove(message_id).is_some()
    }

    pub fn remove(&self, message_id: &str) -> Option<PendingEdit> {
        self.state().remove(message_id)
    }

    pub fn get(&self, message_id: &str) -> Option<PendingEdit> {
        self.state().records.get(message_id).cloned()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.state().records.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys, oldest first.
    pub fn keys(&self) -> Vec<String> {
        self.state().order.iter().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn publish(&self, message_id: &str, text: &str) -> Result<()> {
        let payload = TaskEnvelope::edit_message(message_id, text).encode(&self.inner.session)?;
        self.inner
            .publisher
            .publish(TASK_TOPIC, payload, QoS::AtLeastOnce)
            .await
    }

    fn spawn_watchdog(&self, message_id: String, generation: u64) {
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker.watch(message_id, generation).await;
        });
    }

    async fn watch(self, message_id: String, generation: u64) {
        loop {
            sleep(self.inner.config.ack_timeout).await;
            match self.check(&message_id, generation) {
                WatchDecision::Stop => return,
                WatchDecision::Drop(event) => {
                    let key = match &event {
                        PendingEvent::Expired { .. } => "edit.expired",
                        _ => "edit.exhausted",
                    };
                    self.inner.session.record_health(key);
                    self.inner.telemetry.record_pending(event);
                    return;
                }
                WatchDecision::Resend { text, attempt } => {
                    self.inner.session.record_health("edit.resend");
                    self.inner.telemetry.record_pending(PendingEvent::Resent {
                        message_id: message_id.clone(),
                        attempt,
                    });
                    if let Err(err) = self.publish(&message_id, &text).await {
                        self.inner.session.record_health("edit.resend_failed");
                        #[cfg(feature = "tracing")]
                        tracing::warn!(message_id = %message_id, attempt, error = %err, "edit resend failed");
                        #[cfg(not(feature = "tracing"))]
                        let _ = err;
                    }
                }
            }
        }
    }

    fn check(&self, message_id: &str, generation: u64) -> WatchDecision {
        let config = &self.inner.config;
        let mut state = self.state();
        let Some(record) = state.records.get_mut(message_id) else {
            return WatchDecision::Stop;
        };
        if record.generation != generation {
            return WatchDecision::Stop;
        }

        if record.created_at.elapsed() > config.ttl {
            let attempts = record.attempts;
            state.remove(message_id);
            return WatchDecision::Drop(PendingEvent::Expired {
                message_id: message_id.to_string(),
                attempts,
            });
        }
        if record.attempts >= config.max_resend_attempts {
            let attempts = record.attempts;
            state.remove(message_id);
            return WatchDecision::Drop(PendingEvent::Exhausted {
                message_id: message_id.to_string(),
                attempts,
            });
        }

        record.attempts += 1;
        WatchDecision::Resend {
            text: record.text.clone(),
            attempt: record.attempts,
        }
    }
}
