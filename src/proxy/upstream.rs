//! Upstream replica sets: failure-based ejection and least-connections
//! selection.
//!
//! Each replica owns its health state behind its own lock, so accounting
//! for one replica never blocks traffic headed to another. Ejection is a
//! timed state machine: `max_fails` failures inside the rolling window
//! eject a replica until `fail_timeout` elapses, after which the next
//! selection readmits it on probation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::UpstreamConfig;

#[derive(Debug, Default)]
struct HealthState {
    /// Failures accumulated since `window_start`.
    failures: u32,
    window_start: Option<Instant>,
    ejected_until: Option<Instant>,
}

/// One backend process instance.
pub struct Replica {
    /// Configured `host:port`, used for SNI and logging.
    pub host: String,
    pub addr: SocketAddr,
    state: Mutex<HealthState>,
    active: AtomicUsize,
}

impl Replica {
    fn new(host: String, addr: SocketAddr) -> Self {
        Self {
            host,
            addr,
            state: Mutex::new(HealthState::default()),
            active: AtomicUsize::new(0),
        }
    }

    /// Requests currently in flight against this replica.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Whether the replica may receive traffic at `now`.
    ///
    /// A replica whose ejection deadline has passed counts as available;
    /// the readmission itself happens when it is next selected.
    pub(crate) fn is_available(&self, now: Instant) -> bool {
        let state = lock(&self.state);
        state.ejected_until.map_or(true, |until| until <= now)
    }
}

fn lock(state: &Mutex<HealthState>) -> std::sync::MutexGuard<'_, HealthState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A named set of replicas sharing failure thresholds.
pub struct UpstreamClass {
    name: &'static str,
    replicas: Vec<Replica>,
    max_fails: u32,
    fail_timeout: Duration,
}

impl UpstreamClass {
    /// Builds a class from resolved upstream addresses.
    ///
    /// Configuration guarantees at least one replica per class.
    pub fn new(
        name: &'static str,
        upstreams: &[UpstreamConfig],
        max_fails: u32,
        fail_timeout: Duration,
    ) -> Self {
        let replicas = upstreams
            .iter()
            .map(|u| Replica::new(u.host.clone(), u.addr))
            .collect::<Vec<_>>();
        tracing::info!(class = name, replicas = replicas.len(), "upstream class configured");
        Self {
            name,
            replicas,
            max_fails,
            fail_timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn replica(&self, idx: usize) -> &Replica {
        &self.replicas[idx]
    }

    /// Whether any replica outside `exclude` may receive traffic.
    pub fn has_candidate(&self, exclude: &[usize], now: Instant) -> bool {
        self.replicas
            .iter()
            .enumerate()
            .any(|(idx, replica)| !exclude.contains(&idx) && replica.is_available(now))
    }

    /// Whether the class can serve anything at all right now.
    pub fn has_available(&self, now: Instant) -> bool {
        self.has_candidate(&[], now)
    }

    /// Picks the available replica with the fewest in-flight requests,
    /// skipping indices in `exclude`. Ties go to configuration order.
    ///
    /// The pick is counted as an active connection; callers must pair it
    /// with [`release`](Self::release). Selecting a replica whose
    /// ejection deadline passed clears its ejection (probationary
    /// readmission).
    pub fn select(&self, exclude: &[usize], now: Instant) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, replica) in self.replicas.iter().enumerate() {
            if exclude.contains(&idx) || !replica.is_available(now) {
                continue;
            }
            let active = replica.active_connections();
            match best {
                Some((best_active, _)) if active >= best_active => {}
                _ => best = Some((active, idx)),
            }
        }

        let (_, idx) = best?;
        let replica = &self.replicas[idx];
        {
            let mut state = lock(&replica.state);
            if state.ejected_until.is_some_and(|until| until <= now) {
                state.ejected_until = None;
                state.failures = 0;
                state.window_start = None;
            }
        }
        replica.active.fetch_add(1, Ordering::Relaxed);
        Some(idx)
    }

    /// Returns the active-connection slot taken by [`select`](Self::select).
    pub fn release(&self, idx: usize) {
        self.replicas[idx].active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records a network-level failure against a replica. Reaching
    /// `max_fails` failures within the rolling window ejects it for
    /// `fail_timeout`.
    pub fn record_failure(&self, idx: usize, now: Instant) {
        let replica = &self.replicas[idx];
        let mut state = lock(&replica.state);

        match state.window_start {
            Some(start) if now.saturating_duration_since(start) <= self.fail_timeout => {}
            _ => {
                state.window_start = Some(now);
                state.failures = 0;
            }
        }
        state.failures += 1;

        if state.failures >= self.max_fails {
            state.ejected_until = Some(now + self.fail_timeout);
            state.failures = 0;
            state.window_start = None;
            tracing::warn!(
                class = self.name,
                replica = %replica.host,
                fail_timeout_secs = self.fail_timeout.as_secs(),
                "replica ejected"
            );
        }
    }

    /// Resets the failure window after a successful connection.
    pub fn record_success(&self, idx: usize) {
        let mut state = lock(&self.replicas[idx].state);
        state.failures = 0;
        state.window_start = None;
    }
}
