//! Delayed background faults against an in-flight foreground call.
//!
//! The foreground call and the background action run concurrently on the
//! calling task. The background action always runs to completion before
//! [`FaultInjector::run`] returns, whatever the foreground outcome, so the
//! fault has been applied by the time the scenario asserts on the result.
//!
//! ```text
//! t=0          t=delay               t=fg returns      t=joined
//! ├── foreground ───────────────────────┤
//! ├── sleep(delay) ──┼── action ──────────────────────────┤
//!                                                         └─► FaultOutcome
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::config::FaultConfig;
use crate::error::HarnessError;

/// A disruptive action to run after `delay`.
#[derive(Debug)]
pub struct FaultSchedule<A> {
    /// Service or replica the action disrupts (for logs).
    pub target: String,
    /// Delay before the action starts.
    pub delay: Duration,
    /// The action. Not polled before `delay` has elapsed.
    pub action: A,
}

impl<A> FaultSchedule<A>
where
    A: Future<Output = Result<(), HarnessError>>,
{
    /// Schedule `action` against `target` after `delay`.
    pub fn new(target: &str, delay: Duration, action: A) -> Self {
        Self {
            target: target.to_string(),
            delay,
            action,
        }
    }
}

/// Result of one fault-injected call.
#[derive(Debug)]
pub struct FaultOutcome<T> {
    /// What the foreground call returned.
    pub foreground: Result<T, HarnessError>,
    /// What the background action returned.
    pub background: Result<(), HarnessError>,
    /// Time until the foreground call returned.
    pub foreground_elapsed: Duration,
    /// Time until the background action completed.
    pub background_elapsed: Duration,
}

/// Runs a foreground call with a delayed background fault.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    foreground_timeout: Duration,
    join_grace: Duration,
}

impl FaultInjector {
    /// Injector for foreground calls that time out after `foreground_timeout`.
    pub fn new(foreground_timeout: Duration) -> Self {
        Self {
            foreground_timeout,
            join_grace: FaultConfig::default().join_grace,
        }
    }

    /// Injector using the `[fault]` configuration.
    pub fn from_config(config: &FaultConfig, foreground_timeout: Duration) -> Self {
        Self::new(foreground_timeout).join_grace(config.join_grace)
    }

    /// Time past `foreground_timeout` before the call counts as hung.
    pub fn join_grace(mut self, grace: Duration) -> Self {
        self.join_grace = grace;
        self
    }

    /// Run `foreground` and the scheduled fault concurrently and join both.
    ///
    /// # Errors
    ///
    /// - `Configuration` if the fault delay is not shorter than the
    ///   foreground timeout
    /// - `ForegroundHung` if the foreground call is still running after its
    ///   timeout plus grace (returned only after the fault has completed)
    pub async fn run<T, F, A>(
        &self,
        schedule: FaultSchedule<A>,
        foreground: F,
    ) -> Result<FaultOutcome<T>, HarnessError>
    where
        F: Future<Output = Result<T, HarnessError>>,
        A: Future<Output = Result<(), HarnessError>>,
    {
        if schedule.delay >= self.foreground_timeout {
            return Err(HarnessError::Configuration(format!(
                "fault delay {:?} must be shorter than the foreground timeout {:?}",
                schedule.delay, self.foreground_timeout
            )));
        }

        let started = Instant::now();
        let deadline = self.foreground_timeout + self.join_grace;
        let FaultSchedule {
            target,
            delay,
            action,
        } = schedule;

        let foreground = async {
            let result = tokio::time::timeout(deadline, foreground).await;
            (result, started.elapsed())
        };
        let background = async {
            tokio::time::sleep(delay).await;
            info!(service = %target, "injecting fault");
            let result = action.await;
            info!(service = %target, ok = result.is_ok(), "fault applied");
            (result, started.elapsed())
        };

        let ((foreground, foreground_elapsed), (background, background_elapsed)) =
            tokio::join!(foreground, background);

        let foreground = foreground.map_err(|_| HarnessError::ForegroundHung { after: deadline })?;

        Ok(FaultOutcome {
            foreground,
            background,
            foreground_elapsed,
            background_elapsed,
        })
    }
}
