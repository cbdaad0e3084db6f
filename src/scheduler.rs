//! Quota-aware admission control for gateway calls.
//!
//! [`ThrottleScheduler`] combines a concurrency semaphore with a sliding
//! one-minute window of token and request reservations. [`admit`] suspends
//! the caller until both a slot and enough budget are free; it never fails
//! because of quota, it only delays. [`release`] returns the slot and
//! reconciles the reservation with the provider-reported usage.
//!
//! Time is read from [`tokio::time::Instant`], so tests can drive the window
//! with a paused clock.
//!
//! [`admit`]: ThrottleScheduler::admit
//! [`release`]: ThrottleScheduler::release

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::config::SchedulerConfig;

/// Length of the rolling budget window.
pub const BUDGET_WINDOW: Duration = Duration::from_secs(60);

/// Scheduler construction and admission errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Limits that could never admit anything.
    #[error("invalid scheduler limits: {0}")]
    InvalidLimits(String),

    /// The scheduler was shut down while waiting.
    #[error("scheduler closed")]
    Closed,
}

/// A granted admission. Hand it back through [`ThrottleScheduler::release`].
///
/// Dropping a permit without releasing it frees the concurrency slot but
/// leaves the full estimate charged to the window.
#[derive(Debug)]
pub struct Permit {
    id: u64,
    reserved_tokens: u64,
    _slot: OwnedSemaphorePermit,
}

impl Permit {
    /// Tokens reserved against the window at admission.
    pub fn reserved_tokens(&self) -> u64 {
        self.reserved_tokens
    }
}

/// Budget consumed inside the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    /// Tokens charged (estimates until reconciled).
    pub tokens: u64,
    /// Requests admitted.
    pub requests: u32,
}

#[derive(Debug)]
struct Reservation {
    id: u64,
    at: Instant,
    tokens: u64,
}

#[derive(Debug, Default)]
struct BudgetWindow {
    entries: VecDeque<Reservation>,
}

impl BudgetWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .entries
            .front()
            .is_some_and(|r| now.saturating_duration_since(r.at) >= window)
        {
            self.entries.pop_front();
        }
    }

    fn usage(&self) -> WindowUsage {
        WindowUsage {
            tokens: self
                .entries
                .iter()
                .fold(0u64, |acc, r| acc.saturating_add(r.tokens)),
            requests: u32::try_from(self.entries.len()).unwrap_or(u32::MAX),
        }
    }

    /// Time until the oldest reservation leaves the window.
    fn wait_hint(&self, now: Instant, window: Duration) -> Duration {
        self.entries
            .front()
            .map(|r| window.saturating_sub(now.saturating_duration_since(r.at)))
            .unwrap_or(window)
            .max(Duration::from_millis(1))
    }
}

/// Sliding-window token/request throttle with bounded concurrency.
#[derive(Debug)]
pub struct ThrottleScheduler {
    slots: Arc<Semaphore>,
    window: Mutex<BudgetWindow>,
    released: Notify,
    next_id: AtomicU64,
    tokens_per_minute: u64,
    requests_per_minute: u32,
    estimated_tokens_per_call: u64,
    window_len: Duration,
}

impl ThrottleScheduler {
    /// Build a scheduler from configured limits.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidLimits`] for zero limits or an
    /// estimate larger than the whole token budget.
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        if config.max_concurrent_calls == 0 {
            return Err(SchedulerError::InvalidLimits(
                "max_concurrent_calls must be at least 1".to_owned(),
            ));
        }
        if config.requests_per_minute == 0 || config.tokens_per_minute == 0 {
            return Err(SchedulerError::InvalidLimits(
                "per-minute budgets must be non-zero".to_owned(),
            ));
        }
        if config.estimated_tokens_per_call > config.tokens_per_minute {
            return Err(SchedulerError::InvalidLimits(format!(
                "estimated_tokens_per_call ({}) exceeds tokens_per_minute ({})",
                config.estimated_tokens_per_call, config.tokens_per_minute
            )));
        }

        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            window: Mutex::new(BudgetWindow::default()),
            released: Notify::new(),
            next_id: AtomicU64::new(0),
            tokens_per_minute: config.tokens_per_minute,
            requests_per_minute: config.requests_per_minute,
            estimated_tokens_per_call: config.estimated_tokens_per_call,
            window_len: BUDGET_WINDOW,
        })
    }

    /// Wait for a concurrency slot and enough window budget, then reserve
    /// the per-call estimate.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] if the scheduler is shut down.
    pub async fn admit(&self) -> Result<Permit, SchedulerError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Closed)?;

        loop {
            if self.slots.is_closed() {
                return Err(SchedulerError::Closed);
            }

            // Register interest before checking so a release between the check
            // and the wait is not missed.
            let released = self.released.notified();

            let wait = {
                let mut window = self.lock_window()?;
                let now = Instant::now();
                window.prune(now, self.window_len);
                let usage = window.usage();
                let fits_tokens = usage
                    .tokens
                    .saturating_add(self.estimated_tokens_per_call)
                    <= self.tokens_per_minute;
                let fits_requests = usage.requests < self.requests_per_minute;

                if fits_tokens && fits_requests {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    window.entries.push_back(Reservation {
                        id,
                        at: now,
                        tokens: self.estimated_tokens_per_call,
                    });
                    return Ok(Permit {
                        id,
                        reserved_tokens: self.estimated_tokens_per_call,
                        _slot: slot,
                    });
                }
                window.wait_hint(now, self.window_len)
            };

            debug!(
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "budget window full, delaying admission"
            );
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = released => {}
            }
        }
    }

    /// Return the slot and replace the reservation with `actual_tokens`.
    pub fn release(&self, permit: Permit, actual_tokens: u64) {
        if let Ok(mut window) = self.window.lock() {
            if let Some(entry) = window.entries.iter_mut().find(|r| r.id == permit.id) {
                entry.tokens = actual_tokens;
            }
        }
        drop(permit);
        self.released.notify_waiters();
    }

    /// Budget consumed in the current window.
    pub fn usage(&self) -> WindowUsage {
        match self.window.lock() {
            Ok(mut window) => {
                window.prune(Instant::now(), self.window_len);
                window.usage()
            }
            Err(_) => WindowUsage {
                tokens: self.tokens_per_minute,
                requests: self.requests_per_minute,
            },
        }
    }

    /// Concurrency slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Stop admitting; pending and future [`admit`](Self::admit) calls fail.
    pub fn close(&self) {
        self.slots.close();
        self.released.notify_waiters();
    }

    fn lock_window(&self) -> Result<std::sync::MutexGuard<'_, BudgetWindow>, SchedulerError> {
        self.window.lock().map_err(|_| SchedulerError::Closed)
    }
}
