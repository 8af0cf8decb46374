use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{IpamError, Result, TimeoutCause};
use crate::index::{ScopeIndex, ScopeSlot, ScopeWriter};
use crate::metrics::RegistryMetrics;

/// Lifecycle of one mutation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Request accepted, nothing checked yet.
    Received,
    /// Inputs parsed and the scope resolved.
    Validated,
    /// Durable and visible.
    Committed,
    /// Refused; nothing was written.
    Rejected,
}

/// Cooperative cancellation flag shared between a caller and its request.
///
/// Cancelling before the commit point guarantees the request has no effect.
/// Cancelling after it does nothing; the mutation stands.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-request overrides for the commit protocol.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Cancellation flag checked up to the commit point.
    pub cancel: Option<CancelToken>,
    /// Overall budget, replacing the configured deadline.
    pub deadline: Option<Duration>,
}

impl CommitOptions {
    /// Attaches a cancellation token.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Overrides the commit deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// Budget for the lock waits of one commit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Budget {
    pub max_attempts: u32,
    pub lock_wait: Duration,
    pub deadline: Duration,
}

/// One pass through the check-then-insert protocol for a single scope.
pub(crate) struct Commit<'a> {
    slot: &'a ScopeSlot,
    options: &'a CommitOptions,
    metrics: &'a RegistryMetrics,
    budget: Budget,
    started: Instant,
    attempts: u32,
    state: TxState,
}

impl<'a> Commit<'a> {
    pub(crate) fn new(
        slot: &'a ScopeSlot,
        options: &'a CommitOptions,
        metrics: &'a RegistryMetrics,
        budget: Budget,
    ) -> Self {
        Self {
            slot,
            options,
            metrics,
            budget,
            started: Instant::now(),
            attempts: 0,
            state: TxState::Received,
        }
    }

    /// Plans a mutation against the scope and, if the plan holds, runs
    /// `write` with exclusive access to it.
    ///
    /// `gather` copies what the plan needs out of the index under the read
    /// lock; `plan` works on that copy with no lock held. Both run again under
    /// the commit guard if another writer published in between. `write` gets
    /// the scope's [`ScopeWriter`]: it must make the mutation durable before
    /// publishing it, and must not fail after publishing.
    ///
    /// Every lock wait counts against the attempt budget and the deadline.
    /// Running out of either leaves the store and the index untouched.
    pub(crate) fn run<G, P, T>(
        mut self,
        gather: impl Fn(&ScopeIndex) -> G,
        plan: impl Fn(G) -> Result<P>,
        write: impl FnOnce(&mut ScopeWriter<'_>, P) -> Result<T>,
    ) -> Result<T> {
        self.transition(TxState::Validated);
        let slot = self.slot;

        let (gathered, seen) = {
            let index = self.wait_for("read", |wait| slot.try_read(wait))?;
            (gather(&index), slot.version())
        };
        let mut planned = self.reject_on_err(plan(gathered))?;

        let mut guard = self.wait_for("guard", |wait| slot.try_guard(wait))?;
        if slot.version() != seen {
            trace!(scope = %slot.key(), "registry.commit.replan");
            let gathered = {
                let index = self.wait_for("read", |wait| slot.try_read(wait))?;
                gather(&index)
            };
            planned = self.reject_on_err(plan(gathered))?;
        }

        let mut writer = loop {
            let wait = self.next_wait()?;
            match slot.try_writer(guard, wait) {
                Ok(writer) => break writer,
                Err(back) => {
                    guard = back;
                    self.busy("write")?;
                }
            }
        };
        if self.options.cancelled() {
            drop(writer);
            return Err(self.give_up(TimeoutCause::Cancelled));
        }

        match write(&mut writer, planned) {
            Ok(value) => {
                self.transition(TxState::Committed);
                Ok(value)
            }
            Err(err) => {
                if matches!(err, IpamError::Storage(_)) {
                    self.metrics.record_storage_failure();
                }
                self.transition(TxState::Rejected);
                Err(err)
            }
        }
    }

    /// Retries `try_lock` until it succeeds or the budget runs out.
    fn wait_for<L>(
        &mut self,
        lock: &'static str,
        try_lock: impl Fn(Duration) -> Option<L>,
    ) -> Result<L> {
        loop {
            let wait = self.next_wait()?;
            if let Some(held) = try_lock(wait) {
                return Ok(held);
            }
            self.busy(lock)?;
        }
    }

    /// How long the next lock attempt may block.
    fn next_wait(&mut self) -> Result<Duration> {
        if self.options.cancelled() {
            return Err(self.give_up(TimeoutCause::Cancelled));
        }
        match self.budget.deadline.checked_sub(self.started.elapsed()) {
            Some(remaining) if !remaining.is_zero() => Ok(remaining.min(self.budget.lock_wait)),
            _ => Err(self.give_up(TimeoutCause::Deadline)),
        }
    }

    /// Records a contended lock and fails once the attempt budget is spent.
    fn busy(&mut self, lock: &'static str) -> Result<()> {
        self.attempts += 1;
        self.metrics.record_retry();
        debug!(
            scope = %self.slot.key(),
            attempt = self.attempts,
            lock,
            "registry.commit.lock_busy"
        );
        if self.attempts < self.budget.max_attempts {
            return Ok(());
        }
        let cause = if self.started.elapsed() >= self.budget.deadline {
            TimeoutCause::Deadline
        } else {
            TimeoutCause::Attempts
        };
        Err(self.give_up(cause))
    }

    fn reject_on_err<P>(&mut self, result: Result<P>) -> Result<P> {
        if let Err(err) = &result {
            if matches!(err, IpamError::Conflict { .. }) {
                self.metrics.record_conflict();
            }
            self.transition(TxState::Rejected);
        }
        result
    }

    fn give_up(&mut self, cause: TimeoutCause) -> IpamError {
        self.metrics.record_timeout();
        self.transition(TxState::Rejected);
        debug!(
            scope = %self.slot.key(),
            attempts = self.attempts,
            %cause,
            "registry.commit.timeout"
        );
        IpamError::Timeout {
            attempts: self.attempts,
            elapsed: self.started.elapsed(),
            cause,
        }
    }

    fn transition(&mut self, next: TxState) {
        trace!(scope = %self.slot.key(), from = ?self.state, to = ?next, "registry.commit.state");
        self.state = next;
    }
}
