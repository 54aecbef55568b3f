//! Advisory pacing for account actions.
//!
//! The advisor keeps a small activity record per identity in a caller-owned
//! [`RiskStore`] and derives a [`RiskTier`] from the error rate and how
//! recently the identity acted. It only answers questions; callers decide
//! whether to wait.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

/// Kind of human-like pause a delay should imitate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionClass {
    Typing,
    Reading,
    Thinking,
    Browsing,
}

impl ActionClass {
    /// Base delay range in milliseconds.
    fn base_range_ms(self) -> (u64, u64) {
        match self {
            ActionClass::Typing => (800, 2500),
            ActionClass::Reading => (1500, 4000),
            ActionClass::Thinking => (2000, 6000),
            ActionClass::Browsing => (3000, 8000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    fn delay_multiplier(self) -> f64 {
        match self {
            RiskTier::Low => 1.0,
            RiskTier::Medium => 1.5,
            RiskTier::High => 2.5,
        }
    }
}

/// Whether a recorded action succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    Success,
    Error,
}

/// Activity counters for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskSession {
    pub request_count: u64,
    pub error_count: u64,
    pub last_activity: Instant,
}

impl RiskSession {
    pub fn new(last_activity: Instant) -> Self {
        Self {
            request_count: 0,
            error_count: 0,
            last_activity,
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.error_count as f64 / self.request_count.max(1) as f64
    }
}

/// Thresholds and shaping for [`SafetyAdvisor`].
#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub high_error_rate: f64,
    pub medium_error_rate: f64,
    /// Activity more recent than this puts an identity in the high tier.
    pub high_recency: Duration,
    /// Activity more recent than this puts an identity in the medium tier.
    pub medium_recency: Duration,
    /// Quiet time a medium-tier identity needs before acting again.
    pub medium_quiet: Duration,
    /// Quiet time a high-tier identity needs before acting again.
    pub high_quiet: Duration,
    /// Counters halve once the request count exceeds this.
    pub decay_threshold: u64,
    pub jitter: f64,
    pub min_delay: Duration,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            high_error_rate: 0.3,
            medium_error_rate: 0.1,
            high_recency: Duration::from_millis(1000),
            medium_recency: Duration::from_millis(3000),
            medium_quiet: Duration::from_millis(3000),
            high_quiet: Duration::from_millis(10_000),
            decay_threshold: 100,
            jitter: 0.05,
            min_delay: Duration::from_millis(200),
        }
    }
}

/// Per-identity activity records, shared by whoever owns the advisor.
#[derive(Debug, Default)]
pub struct RiskStore {
    sessions: Mutex<HashMap<String, RiskSession>>,
}

impl RiskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str) -> Option<RiskSession> {
        self.sessions().get(identity).cloned()
    }

    /// Replace the record for `identity` (for restoring saved state).
    pub fn insert(&self, identity: &str, session: RiskSession) {
        self.sessions().insert(identity.to_string(), session);
    }

    pub fn remove(&self, identity: &str) -> Option<RiskSession> {
        self.sessions().remove(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, RiskSession>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyAdvisor {
    store: Arc<RiskStore>,
    config: AdvisorConfig,
}

impl SafetyAdvisor {
    pub fn new(store: Arc<RiskStore>) -> Self {
        Self::with_config(store, AdvisorConfig::default())
    }

    pub fn with_config(store: Arc<RiskStore>, config: AdvisorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<RiskStore> {
        &self.store
    }

    /// Count one action for `identity`, creating its record on first use.
    pub fn record_activity(&self, identity: &str, outcome: ActivityOutcome) {
        let now = Instant::now();
        let mut sessions = self.store.sessions();
        let session = sessions
            .entry(identity.to_string())
            .or_insert_with(|| RiskSession::new(now));

        session.request_count += 1;
        if outcome == ActivityOutcome::Error {
            session.error_count += 1;
        }
        session.last_activity = now;

        if session.request_count > self.config.decay_threshold {
            session.request_count /= 2;
            session.error_count /= 2;
        }
    }

    pub fn risk_tier(&self, identity: &str) -> RiskTier {
        match self.store.get(identity) {
            Some(session) => self.tier_at(&session, Instant::now()),
            None => RiskTier::Low,
        }
    }

    /// Whether enough quiet time has passed for the identity's tier.
    pub fn is_safe_to_execute(&self, identity: &str, action: ActionClass) -> bool {
        let Some(session) = self.store.get(identity) else {
            return true;
        };
        let now = Instant::now();
        let tier = self.tier_at(&session, now);
        let quiet = now.saturating_duration_since(session.last_activity);
        let safe = match tier {
            RiskTier::Low => true,
            RiskTier::Medium => quiet >= self.config.medium_quiet,
            RiskTier::High => quiet >= self.config.high_quiet,
        };
        #[cfg(feature = "tracing")]
        tracing::trace!(identity, ?action, ?tier, quiet_ms = quiet.as_millis() as u64, safe, "safety check");
        #[cfg(not(feature = "tracing"))]
        let _ = action;
        safe
    }

    /// Suggested pause before the next `action`.
    pub fn safe_delay(&self, identity: &str, action: ActionClass) -> Duration {
        let tier = self.risk_tier(identity);
        let (lo, hi) = action.base_range_ms();
        let base = fastrand::u64(lo..=hi) as f64;
        let jitter = 1.0 + (fastrand::f64() * 2.0 - 1.0) * self.config.jitter;
        let millis = (base * tier.delay_multiplier() * jitter)
            .max(self.config.min_delay.as_millis() as f64);
        Duration::from_millis(millis.round() as u64)
    }

    fn tier_at(&self, session: &RiskSession, now: Instant) -> RiskTier {
        let rate = session.error_rate();
        let since = now.saturating_duration_since(session.last_activity);
        if rate > self.config.high_error_rate || since < self.config.high_recency {
            RiskTier::High
        } else if rate > self.config.medium_error_rate || since < self.config.medium_recency {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }
}
